//! Closure Variable Extractor
//!
//! For every step, finds the variables it reads from enclosing function
//! scopes. Those bindings do not exist once the step is hoisted to module
//! scope, so the rewriter replaces them with a prologue that asks the runtime
//! for their values.
//!
//! Resolution is done entirely through `oxc_semantic` reference and scope
//! facts. Name matching is never used to decide what a reference points at.

use oxc_semantic::Scoping;
use oxc_syntax::scope::ScopeId;
use oxc_syntax::symbol::SymbolId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::directive::{FunctionKind, ModuleScan, ReferenceSite, TaggedFunction};
use crate::naming::IdentifierRecord;
use crate::parse::SourceText;
use crate::validate::{
    Diagnostic, ERR_SHADOWED_CAPTURE, ERR_UNRESOLVED_FREE_VARIABLE, WARN_CAPTURED_WRITE,
};

lazy_static::lazy_static! {
    /// Names a step may read without any binding in the module.
    pub static ref KNOWN_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        // Language
        s.insert("undefined");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("globalThis");
        s.insert("arguments");
        s.insert("eval");
        s.insert("isNaN");
        s.insert("isFinite");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("encodeURI");
        s.insert("encodeURIComponent");
        s.insert("decodeURI");
        s.insert("decodeURIComponent");

        // Built-in constructors and namespaces
        s.insert("Object");
        s.insert("Function");
        s.insert("Array");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Symbol");
        s.insert("BigInt");
        s.insert("Math");
        s.insert("JSON");
        s.insert("Date");
        s.insert("RegExp");
        s.insert("Error");
        s.insert("TypeError");
        s.insert("RangeError");
        s.insert("SyntaxError");
        s.insert("ReferenceError");
        s.insert("AggregateError");
        s.insert("Promise");
        s.insert("Map");
        s.insert("Set");
        s.insert("WeakMap");
        s.insert("WeakSet");
        s.insert("WeakRef");
        s.insert("Proxy");
        s.insert("Reflect");
        s.insert("Intl");
        s.insert("ArrayBuffer");
        s.insert("SharedArrayBuffer");
        s.insert("DataView");
        s.insert("Int8Array");
        s.insert("Uint8Array");
        s.insert("Uint8ClampedArray");
        s.insert("Int16Array");
        s.insert("Uint16Array");
        s.insert("Int32Array");
        s.insert("Uint32Array");
        s.insert("Float32Array");
        s.insert("Float64Array");
        s.insert("BigInt64Array");
        s.insert("BigUint64Array");

        // Host environment
        s.insert("console");
        s.insert("process");
        s.insert("Buffer");
        s.insert("fetch");
        s.insert("Request");
        s.insert("Response");
        s.insert("Headers");
        s.insert("URL");
        s.insert("URLSearchParams");
        s.insert("TextEncoder");
        s.insert("TextDecoder");
        s.insert("AbortController");
        s.insert("AbortSignal");
        s.insert("crypto");
        s.insert("structuredClone");
        s.insert("setTimeout");
        s.insert("clearTimeout");
        s.insert("setInterval");
        s.insert("clearInterval");
        s.insert("setImmediate");
        s.insert("queueMicrotask");
        s.insert("require");
        s.insert("module");
        s.insert("exports");
        s.insert("__dirname");
        s.insert("__filename");
        s
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLOSURE VARIABLES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosureOrigin {
    Workflow,
    Step,
    /// A plain (untagged) enclosing function.
    Function,
    /// A block at module level; the hoisted step would no longer see it.
    Module,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureVariable {
    pub name: String,
    pub origin: ClosureOrigin,
    /// The step assigns to this variable.
    #[serde(default, skip_serializing_if = "is_false")]
    pub written: bool,
    #[serde(skip)]
    pub symbol: Option<SymbolId>,
}

/// Symbol bound to each tagged function, for resolving calls and references.
pub fn tagged_bindings(scan: &ModuleScan) -> HashMap<SymbolId, usize> {
    scan.functions
        .iter()
        .flat_map(|f| {
            [f.binding, f.self_binding]
                .into_iter()
                .flatten()
                .map(move |symbol| (symbol, f.index))
        })
        .collect()
}

/// Calls to nested steps always dispatch. Calls to module-level steps
/// dispatch only from inside a workflow or step body.
pub fn is_dispatched(target: &TaggedFunction, site: &ReferenceSite) -> bool {
    target.kind == FunctionKind::Step && site.is_callee && (target.nested || site.owner.is_some())
}

fn declared_within(scoping: &Scoping, symbol: SymbolId, scope: ScopeId) -> bool {
    scoping
        .scope_ancestors(scoping.symbol_scope_id(symbol))
        .any(|ancestor| ancestor == scope)
}

struct Extractor<'a, 's> {
    scan: &'a ModuleScan,
    scoping: &'a Scoping,
    source: &'a SourceText<'s>,
    bindings: HashMap<SymbolId, usize>,
    scope_owner: HashMap<ScopeId, usize>,
    strict_globals: bool,
    known_globals: &'a HashSet<String>,
    diagnostics: Vec<Diagnostic>,
}

impl Extractor<'_, '_> {
    fn origin_of(&self, symbol: SymbolId) -> ClosureOrigin {
        for ancestor in self.scoping.scope_ancestors(self.scoping.symbol_scope_id(symbol)) {
            if let Some(&index) = self.scope_owner.get(&ancestor) {
                return match self.scan.functions[index].kind {
                    FunctionKind::Workflow => ClosureOrigin::Workflow,
                    FunctionKind::Step => ClosureOrigin::Step,
                };
            }
            if self.scoping.scope_flags(ancestor).is_function() {
                return ClosureOrigin::Function;
            }
        }
        ClosureOrigin::Module
    }

    fn is_global(&self, name: &str) -> bool {
        KNOWN_GLOBALS.contains(name) || self.known_globals.contains(name)
    }

    /// Free variables read directly in `step`'s body (not in nested tagged functions).
    fn direct_captures(&mut self, step: &TaggedFunction) -> BTreeMap<String, ClosureVariable> {
        let scan = self.scan;
        let scoping = self.scoping;
        let root = scoping.root_scope_id();
        let mut captured: BTreeMap<String, ClosureVariable> = BTreeMap::new();
        let mut unresolved: HashSet<&str> = HashSet::new();

        for site in scan.references.iter().filter(|s| s.owner == Some(step.index)) {
            let reference = scoping.get_reference(site.reference_id);
            if !reference.is_value() {
                continue;
            }

            let Some(symbol) = reference.symbol_id() else {
                if !self.is_global(&site.name) && unresolved.insert(site.name.as_str()) {
                    let message = format!(
                        "\"{}\" is not declared in any scope enclosing this step",
                        site.name
                    );
                    let diagnostic = if self.strict_globals {
                        self.source.error(ERR_UNRESOLVED_FREE_VARIABLE, &message, site.span.start)
                    } else {
                        self.source.warning(ERR_UNRESOLVED_FREE_VARIABLE, &message, site.span.start)
                    }
                    .with_hint("Declare it, or list it in knownGlobals if the runtime provides it.");
                    self.diagnostics.push(diagnostic);
                }
                continue;
            };

            if scoping.symbol_scope_id(symbol) == root
                || declared_within(scoping, symbol, step.scope_id)
            {
                continue;
            }

            if let Some(&target) = self.bindings.get(&symbol) {
                if !scan.functions[target].in_place {
                    // Rewritten to the hoisted implementation or a dispatch.
                    continue;
                }
            }

            let written = reference.is_write();
            if written && !captured.get(&site.name).is_some_and(|v| v.written) {
                let diagnostic = self
                    .source
                    .warning(
                        WARN_CAPTURED_WRITE,
                        &format!(
                            "Step assigns to captured variable \"{}\"; the enclosing scope never sees the new value",
                            site.name
                        ),
                        site.span.start,
                    )
                    .with_hint("Return the new value from the step instead.");
                self.diagnostics.push(diagnostic);
            }

            let origin = self.origin_of(symbol);
            captured
                .entry(site.name.clone())
                .and_modify(|v| v.written |= written)
                .or_insert(ClosureVariable {
                    name: site.name.clone(),
                    origin,
                    written,
                    symbol: Some(symbol),
                });
        }

        captured
    }
}

/// Fills `closure_vars` on every step record. Returns all diagnostics
/// (warnings included); the caller decides whether any of them is fatal.
pub fn extract_closure_vars(
    scan: &ModuleScan,
    scoping: &Scoping,
    records: &mut [IdentifierRecord],
    strict_globals: bool,
    known_globals: &HashSet<String>,
    source: &SourceText,
) -> Vec<Diagnostic> {
    let mut extractor = Extractor {
        scan,
        scoping,
        source,
        bindings: tagged_bindings(scan),
        scope_owner: scan.functions.iter().map(|f| (f.scope_id, f.index)).collect(),
        strict_globals,
        known_globals,
        diagnostics: Vec::new(),
    };

    let mut sets: Vec<BTreeMap<String, ClosureVariable>> = scan
        .functions
        .iter()
        .map(|f| {
            if f.is_step() {
                extractor.direct_captures(f)
            } else {
                BTreeMap::new()
            }
        })
        .collect();

    // Dispatch sites: (caller, site, target).
    let dispatches: Vec<(Option<usize>, &ReferenceSite, usize)> = scan
        .references
        .iter()
        .filter(|site| site.is_callee)
        .filter_map(|site| {
            let symbol = scoping.get_reference(site.reference_id).symbol_id()?;
            let target = *extractor.bindings.get(&symbol)?;
            is_dispatched(&scan.functions[target], site).then_some((site.owner, site, target))
        })
        .collect();

    // A step that dispatches another step must be able to supply that step's
    // captures declared outside itself.
    let mut changed = true;
    while changed {
        changed = false;
        for (caller, _, target) in &dispatches {
            let Some(caller) = *caller else { continue };
            if caller == *target || !scan.functions[caller].is_step() {
                continue;
            }
            let inherited: Vec<ClosureVariable> = sets[*target]
                .values()
                .filter(|v| {
                    v.symbol.is_some_and(|symbol| {
                        !declared_within(scoping, symbol, scan.functions[caller].scope_id)
                    })
                })
                .cloned()
                .collect();
            for var in inherited {
                if !sets[caller].contains_key(&var.name) {
                    sets[caller].insert(var.name.clone(), ClosureVariable { written: false, ..var });
                    changed = true;
                }
            }
        }
    }

    // Every dispatch site must see the same binding the step captured.
    for (_, site, target) in &dispatches {
        let call_scope = scoping.get_reference(site.reference_id).scope_id();
        for var in sets[*target].values() {
            if scoping.find_binding(call_scope, var.name.as_str()) != var.symbol {
                let diagnostic = source
                    .error(
                        ERR_SHADOWED_CAPTURE,
                        &format!(
                            "\"{}\" captures \"{}\", which is shadowed or out of scope at this call",
                            site.name, var.name
                        ),
                        site.span.start,
                    )
                    .with_hint("Rename the inner binding so the call site sees the captured variable.");
                extractor.diagnostics.push(diagnostic);
            }
        }
    }

    let mut total = 0;
    for (record, set) in records.iter_mut().zip(sets) {
        total += set.len();
        record.closure_vars = set.into_values().collect();
    }
    tracing::debug!("extracted {} closure variables", total);

    extractor.diagnostics
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::scan_module;
    use crate::naming::{allocate_identifiers, NameTable};
    use crate::parse::{analyze, parse_program};
    use oxc_allocator::Allocator;

    fn captures(source_text: &str, strict: bool) -> (Vec<IdentifierRecord>, Vec<Diagnostic>) {
        let allocator = Allocator::default();
        let source = SourceText::new(source_text, "input.js");
        let program = parse_program(&allocator, source_text, "input.js", &source.lines).unwrap();
        let semantic = analyze(&program, source_text, "input.js", &source.lines).unwrap();
        let scan = scan_module(&program, source_text, "input.js", &source.lines);
        let mut names = NameTable::new(scan.used_names.iter().cloned());
        let mut records = allocate_identifiers(&scan, "input.js", &mut names, &source).unwrap();
        let diagnostics = extract_closure_vars(
            &scan,
            semantic.scoping(),
            &mut records,
            strict,
            &HashSet::new(),
            &source,
        );
        (records, diagnostics)
    }

    fn names(record: &IdentifierRecord) -> Vec<&str> {
        record.closure_vars.iter().map(|v| v.name.as_str()).collect()
    }

    #[test]
    fn test_excludes_params_locals_and_module_bindings() {
        let (records, diagnostics) = captures(
            r#"
            import { db } from "./db";
            const LIMIT = 10;
            export async function flow(userId) {
                "use workflow";
                const count = 42;
                let unused = 1;
                async function load(page) {
                    "use step";
                    const local = page * 2;
                    const helper = () => { const deep = local; return deep + count; };
                    return db.query(userId, helper(), LIMIT);
                }
                return load(1);
            }
            "#,
            false,
        );
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert_eq!(names(&records[1]), vec!["count", "userId"]);
        assert!(records[1]
            .closure_vars
            .iter()
            .all(|v| v.origin == ClosureOrigin::Workflow));
        assert!(records[0].closure_vars.is_empty());
    }

    #[test]
    fn test_type_references_are_not_captured() {
        let allocator = Allocator::default();
        let text = r#"
            export async function flow() {
                "use workflow";
                type Row = { id: number };
                const rows: Row[] = [];
                const save = async (row: Row) => { "use step"; rows.push(row); };
                return save({ id: 1 });
            }
        "#;
        let source = SourceText::new(text, "input.ts");
        let program = parse_program(&allocator, text, "input.ts", &source.lines).unwrap();
        let semantic = analyze(&program, text, "input.ts", &source.lines).unwrap();
        let scan = scan_module(&program, text, "input.ts", &source.lines);
        let mut names_table = NameTable::new(scan.used_names.iter().cloned());
        let mut records = allocate_identifiers(&scan, "input.ts", &mut names_table, &source).unwrap();
        extract_closure_vars(&scan, semantic.scoping(), &mut records, false, &HashSet::new(), &source);
        assert_eq!(names(&records[1]), vec!["rows"]);
    }

    #[test]
    fn test_unresolved_name_warns_unless_strict() {
        let source = r#"
            async function work() { "use step"; return mystery + Math.max(1, 2); }
        "#;
        let (_, diagnostics) = captures(source, false);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, ERR_UNRESOLVED_FREE_VARIABLE);
        assert!(!diagnostics[0].is_error());

        let (_, diagnostics) = captures(source, true);
        assert!(diagnostics[0].is_error());
    }

    #[test]
    fn test_nested_step_inside_step() {
        let (records, diagnostics) = captures(
            r#"
            export async function flow(a) {
                "use workflow";
                const b = 2;
                async function outer() {
                    "use step";
                    const c = 3;
                    async function inner() { "use step"; return a + b + c; }
                    return inner();
                }
                return outer();
            }
            "#,
            false,
        );
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert_eq!(names(&records[2]), vec!["a", "b", "c"]);
        assert_eq!(records[2].closure_vars[2].origin, ClosureOrigin::Step);
        // `outer` supplies `a` and `b` to the dispatch of `inner`.
        assert_eq!(names(&records[1]), vec!["a", "b"]);
    }

    #[test]
    fn test_captured_write_warns() {
        let (records, diagnostics) = captures(
            r#"
            export async function flow() {
                "use workflow";
                let total = 0;
                const add = async (n) => { "use step"; total += n; };
                await add(1);
                return total;
            }
            "#,
            false,
        );
        assert_eq!(names(&records[1]), vec!["total"]);
        assert!(records[1].closure_vars[0].written);
        assert!(diagnostics
            .iter()
            .any(|d| d.code == WARN_CAPTURED_WRITE && !d.is_error()));
    }

    #[test]
    fn test_shadowed_capture_at_call_site() {
        let (_, diagnostics) = captures(
            r#"
            export async function flow() {
                "use workflow";
                const key = "a";
                async function read() { "use step"; return key; }
                {
                    const key = "b";
                    return read();
                }
            }
            "#,
            false,
        );
        assert!(diagnostics
            .iter()
            .any(|d| d.code == ERR_SHADOWED_CAPTURE && d.is_error()));
    }
}
