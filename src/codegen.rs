//! Body Rewriter / Hoister
//!
//! Turns the classified, named and analyzed module into output text:
//! - tagged functions that cannot stay where they are are hoisted to module
//!   scope under their allocated local name,
//! - directives become closure-retrieval prologues (or disappear),
//! - calls to steps become durable dispatch calls, other references point at
//!   the hoisted implementation,
//! - every durable function is registered right after its declaration.
//!
//! All output is produced by span edits over the original text. Nothing is
//! printed from the AST, so untouched code keeps its formatting and comments.

use oxc_semantic::Scoping;
use std::collections::BTreeMap;

use crate::directive::{FunctionHost, FunctionKind, ModuleScan, TaggedFunction};
use crate::naming::{IdentifierRecord, NameTable};
use crate::parse::SourceText;
use crate::renamer::EditList;
use crate::scope::{is_dispatched, tagged_bindings};
use crate::validate::{Diagnostic, ERR_HYGIENE_EXHAUSTED};

pub const REGISTER_STEP: &str = "registerStepFunction";
pub const REGISTER_WORKFLOW: &str = "registerWorkflowFunction";
pub const GET_CLOSURE_VARS: &str = "__private_getClosureVars";
pub const USE_STEP: &str = "__private_useStep";

// ═══════════════════════════════════════════════════════════════════════════════
// INPUT
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RewriteInput<'a, 's> {
    pub source: &'a SourceText<'s>,
    pub scan: &'a ModuleScan,
    pub records: &'a [IdentifierRecord],
    pub scoping: &'a Scoping,
    pub runtime_module: &'a str,
    /// Manifest annotation placed at the top of the output.
    pub annotation: &'a str,
}

/// Local names for the runtime helpers this module actually uses, keyed by
/// the exported helper name.
#[derive(Debug, Default)]
struct Helpers {
    locals: BTreeMap<&'static str, String>,
}

impl Helpers {
    fn get<'a>(&'a self, helper: &'a str) -> &'a str {
        self.locals.get(helper).map(String::as_str).unwrap_or(helper)
    }

    fn import_statement(&self, runtime_module: &str) -> String {
        let specifiers = self
            .locals
            .iter()
            .map(|(imported, local)| {
                if imported == local {
                    imported.to_string()
                } else {
                    format!("{} as {}", imported, local)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "import {{ {} }} from \"{}\";",
            specifiers,
            escape_js_string(runtime_module)
        )
    }
}

fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "")
}

fn capture_list(record: &IdentifierRecord) -> String {
    record
        .closure_vars
        .iter()
        .map(|v| v.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ═══════════════════════════════════════════════════════════════════════════════
// REWRITER
// ═══════════════════════════════════════════════════════════════════════════════

struct Rewriter<'a, 's> {
    input: RewriteInput<'a, 's>,
    helpers: Helpers,
    edits: EditList,
}

impl Rewriter<'_, '_> {
    fn registration(&self, function: &TaggedFunction, record: &IdentifierRecord) -> String {
        let register = match function.kind {
            FunctionKind::Workflow => self.helpers.get(REGISTER_WORKFLOW),
            FunctionKind::Step => self.helpers.get(REGISTER_STEP),
        };
        format!(
            "{}(\"{}\", {});",
            register,
            escape_js_string(&record.qualified_id),
            record.local_name
        )
    }

    fn prologue(&self, function: &TaggedFunction, record: &IdentifierRecord) -> String {
        if !function.is_step() || record.closure_vars.is_empty() {
            return String::new();
        }
        // Written captures need a mutable local copy.
        let keyword = if record.closure_vars.iter().any(|v| v.written) {
            "let"
        } else {
            "const"
        };
        format!(
            "{} {{ {} }} = {}();",
            keyword,
            capture_list(record),
            self.helpers.get(GET_CLOSURE_VARS)
        )
    }

    /// Replaces the function at its original position once it lives at module scope.
    fn replace_host(&mut self, function: &TaggedFunction, record: &IdentifierRecord) {
        let local = &record.local_name;
        match &function.host {
            FunctionHost::Declaration => self.edits.replace(function.function_span, ""),
            FunctionHost::ObjectMethod {
                property,
                key,
                computed,
            } => {
                let key_text = self.input.source.slice(key.start, key.end);
                let key_text = if *computed {
                    format!("[{}]", key_text)
                } else {
                    key_text.to_string()
                };
                self.edits.replace(*property, format!("{}: {}", key_text, local));
            }
            FunctionHost::ClassMethod { .. } => {
                self.edits.replace(
                    function.body,
                    format!("{{ return {}.apply(this, arguments); }}", local),
                );
            }
            FunctionHost::Variable | FunctionHost::DefaultExport | FunctionHost::Expression => {
                self.edits.replace(function.function_span, local.clone());
            }
        }
    }

    /// Module-scope declaration carrying the original parameters and body.
    fn hoisted_declaration(&self, function: &TaggedFunction, record: &IdentifierRecord) -> String {
        let source = self.input.source;
        let signature = self
            .edits
            .render(source.text, function.params_start, function.body.start);
        let body = self
            .edits
            .render(source.text, function.body.start + 1, function.body.end - 1);
        if function.is_arrow {
            format!(
                "const {} = async {}{{{}}};",
                record.local_name, signature, body
            )
        } else {
            format!("async function {}{}{{{}}}", record.local_name, signature, body)
        }
    }

    fn rewrite_references(&mut self) {
        let scan = self.input.scan;
        let scoping = self.input.scoping;
        let bindings = tagged_bindings(scan);

        for site in &scan.references {
            let reference = scoping.get_reference(site.reference_id);
            if !reference.is_value() {
                continue;
            }
            let Some(&target) = reference.symbol_id().and_then(|s| bindings.get(&s)) else {
                continue;
            };
            let function = &scan.functions[target];
            let record = &self.input.records[target];

            if is_dispatched(function, site) {
                let use_step = self.helpers.get(USE_STEP);
                let id = escape_js_string(&record.qualified_id);
                let text = if record.closure_vars.is_empty() {
                    format!("{}(\"{}\")", use_step, id)
                } else {
                    format!(
                        "{}(\"{}\", () => ({{ {} }}))",
                        use_step,
                        id,
                        capture_list(record)
                    )
                };
                self.edits.replace(site.span, text);
            } else if !function.in_place && record.local_name != site.name {
                let text = if site.shorthand {
                    format!("{}: {}", site.name, record.local_name)
                } else {
                    record.local_name.clone()
                };
                self.edits.replace(site.span, text);
            }
        }
    }

    fn rewrite_functions(&mut self) {
        let scan = self.input.scan;
        let records = self.input.records;

        // Prologues, host replacements and in-place registrations first, so
        // hoisted bodies render with every inner edit applied.
        for (function, record) in scan.functions.iter().zip(records) {
            let prologue = self.prologue(function, record);
            self.edits.replace(function.directive, prologue);

            if function.in_place {
                if function.default_export {
                    let source = self.input.source.text;
                    let spaced = source[..function.params_start as usize].ends_with(char::is_whitespace);
                    let name = if spaced {
                        record.local_name.clone()
                    } else {
                        format!(" {}", record.local_name)
                    };
                    self.edits.insert(function.params_start, name);
                }
                let registration = self.registration(function, record);
                self.edits
                    .insert(function.statement.end, format!("\n{}", registration));
            } else {
                self.replace_host(function, record);
            }
        }

        let hoisted: Vec<(u32, String)> = scan
            .functions
            .iter()
            .zip(records)
            .filter(|(function, _)| !function.in_place)
            .map(|(function, record)| {
                let text = format!(
                    "{}\n{}\n",
                    self.hoisted_declaration(function, record),
                    self.registration(function, record)
                );
                (function.statement.start, text)
            })
            .collect();
        for (at, text) in hoisted {
            self.edits.insert(at, text);
        }
    }

    fn emit_header(&mut self) {
        let scan = self.input.scan;
        let annotation = self.input.annotation;
        if scan.header_start == 0 {
            self.edits.insert(0, format!("{}\n", annotation));
        } else {
            self.edits.insert(scan.header_start, format!("\n{}", annotation));
        }

        if self.helpers.locals.is_empty() {
            return;
        }
        let import = self.helpers.import_statement(self.input.runtime_module);
        if scan.prologue_end == 0 {
            self.edits.insert(0, format!("{}\n", import));
        } else {
            self.edits.insert(scan.prologue_end, format!("\n{}", import));
        }
    }
}

fn plan_helpers(
    input: &RewriteInput,
    names: &mut NameTable,
) -> Result<Helpers, Diagnostic> {
    let scan = input.scan;
    let records = input.records;
    let bindings = tagged_bindings(scan);

    let mut wanted: Vec<&'static str> = Vec::new();
    if records.iter().any(|r| r.kind == FunctionKind::Step) {
        wanted.push(REGISTER_STEP);
    }
    if records.iter().any(|r| r.kind == FunctionKind::Workflow) {
        wanted.push(REGISTER_WORKFLOW);
    }
    if records
        .iter()
        .any(|r| r.kind == FunctionKind::Step && !r.closure_vars.is_empty())
    {
        wanted.push(GET_CLOSURE_VARS);
    }
    let dispatches = scan.references.iter().any(|site| {
        input
            .scoping
            .get_reference(site.reference_id)
            .symbol_id()
            .and_then(|symbol| bindings.get(&symbol))
            .is_some_and(|&target| is_dispatched(&scan.functions[target], site))
    });
    if dispatches {
        wanted.push(USE_STEP);
    }

    let mut helpers = Helpers::default();
    for helper in wanted {
        let local = names.reserve(helper).ok_or_else(|| {
            input.source.error(
                ERR_HYGIENE_EXHAUSTED,
                &format!("No free local name for runtime helper \"{}\"", helper),
                0,
            )
        })?;
        helpers.locals.insert(helper, local);
    }
    Ok(helpers)
}

/// Produces the transformed module text.
pub fn rewrite_module(input: RewriteInput, names: &mut NameTable) -> Result<String, Vec<Diagnostic>> {
    let helpers = plan_helpers(&input, names).map_err(|d| vec![d])?;
    let mut rewriter = Rewriter {
        input,
        helpers,
        edits: EditList::new(),
    };

    rewriter.rewrite_references();
    // The header goes in before any hoisted text that may share offset 0.
    rewriter.emit_header();
    rewriter.rewrite_functions();

    tracing::debug!(
        "rewrote {} with {} edits",
        rewriter.input.source.path,
        rewriter.edits.len()
    );
    Ok(rewriter.edits.apply(rewriter.input.source.text))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
