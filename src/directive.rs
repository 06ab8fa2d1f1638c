//! Directive Classifier
//!
//! Walks a module once and records every function whose body opens with
//! `"use workflow"` or `"use step"`, in source order, together with the facts
//! later stages need: how the function is hosted, its enclosing tagged
//! function, its spans, and every identifier reference in the module.
//!
//! The walk never holds on to AST nodes. Everything it records is a span,
//! a semantic ID, or an owned string.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use oxc_ast::ast::*;
use oxc_ast_visit::{walk, Visit};
use oxc_span::{GetSpan, Span};
use oxc_syntax::reference::ReferenceId;
use oxc_syntax::scope::{ScopeFlags, ScopeId};
use oxc_syntax::symbol::SymbolId;

use crate::parse::LineIndex;
use crate::validate::{
    Diagnostic, Severity, ERR_MISPLACED_DIRECTIVE, ERR_NESTED_WORKFLOW, ERR_UNSUPPORTED_HOST,
    WARN_MISSPELLED_DIRECTIVE,
};

pub const WORKFLOW_DIRECTIVE: &str = "use workflow";
pub const STEP_DIRECTIVE: &str = "use step";

// ═══════════════════════════════════════════════════════════════════════════════
// TAGGED FUNCTION MODEL
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Workflow,
    Step,
}

impl FunctionKind {
    /// Exact-literal match; anything else is not a directive.
    pub fn from_directive(value: &str) -> Option<Self> {
        match value {
            WORKFLOW_DIRECTIVE => Some(FunctionKind::Workflow),
            STEP_DIRECTIVE => Some(FunctionKind::Step),
            _ => None,
        }
    }

    pub fn directive(self) -> &'static str {
        match self {
            FunctionKind::Workflow => WORKFLOW_DIRECTIVE,
            FunctionKind::Step => STEP_DIRECTIVE,
        }
    }

    /// Prefix used in qualified IDs.
    pub fn prefix(self) -> &'static str {
        match self {
            FunctionKind::Workflow => "workflow",
            FunctionKind::Step => "step",
        }
    }

    pub fn anonymous_base(self) -> &'static str {
        match self {
            FunctionKind::Workflow => "_anonymousWorkflow",
            FunctionKind::Step => "_anonymousStep",
        }
    }
}

/// The syntactic position a tagged function occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionHost {
    /// `function f() {}` as a statement, at any depth.
    Declaration,
    /// Function or arrow initializing a plain variable binding.
    Variable,
    /// `export default async function () {}` (the declaration form).
    DefaultExport,
    /// Object literal method shorthand; `property` covers the whole `key() {}`.
    ObjectMethod {
        property: Span,
        key: Span,
        computed: bool,
    },
    /// Class method; the body is replaced by a delegation to the hoisted copy.
    ClassMethod {
        class_name: Option<String>,
        key: Option<String>,
        is_static: bool,
    },
    /// Any other function expression or arrow (call argument, property value, ...).
    Expression,
}

#[derive(Debug, Clone)]
pub struct TaggedFunction {
    /// Discovery order (source order of the function's start).
    pub index: usize,
    pub kind: FunctionKind,
    pub host: FunctionHost,
    /// Declared or inferred name, `None` for anonymous functions.
    pub name: Option<String>,
    /// Symbol other code uses to refer to this function, if any.
    pub binding: Option<SymbolId>,
    /// Own name of a named function expression, visible only inside its body.
    pub self_binding: Option<SymbolId>,
    /// Nearest enclosing tagged function.
    pub parent: Option<usize>,
    /// True when any function (tagged or not) encloses this one.
    pub nested: bool,
    /// True when this is a direct module-level declaration that stays where it is.
    pub in_place: bool,
    /// True for the anonymous `export default` function.
    pub default_export: bool,
    pub is_arrow: bool,
    pub scope_id: ScopeId,
    pub function_span: Span,
    /// Start of the type parameters or parameter list.
    pub params_start: u32,
    pub body: Span,
    pub directive: Span,
    /// The module-level statement that contains this function.
    pub statement: Span,
}

impl TaggedFunction {
    pub fn is_step(&self) -> bool {
        self.kind == FunctionKind::Step
    }
}

/// One identifier reference and the lexical facts about where it sits.
#[derive(Debug, Clone)]
pub struct ReferenceSite {
    pub reference_id: ReferenceId,
    pub span: Span,
    pub name: String,
    /// Innermost tagged function containing the reference.
    pub owner: Option<usize>,
    /// True when the reference is the bare callee of a call expression.
    pub is_callee: bool,
    /// True when the reference is a shorthand object property value.
    pub shorthand: bool,
}

#[derive(Debug, Default)]
pub struct ModuleScan {
    pub functions: Vec<TaggedFunction>,
    pub references: Vec<ReferenceSite>,
    /// Every binding and reference name anywhere in the module.
    pub used_names: HashSet<String>,
    /// Module-level local name to the names it is exported under.
    pub exports: HashMap<String, Vec<String>>,
    pub diagnostics: Vec<Diagnostic>,
    /// Where generated imports may go: after the hashbang and directive prologue.
    pub prologue_end: u32,
    /// End of the hashbang line, 0 when absent.
    pub header_start: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// NEAR-MISS DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for i in 1..=a.len() {
        let mut current = vec![i; b.len() + 1];
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            current[j] = (prev[j] + 1).min(current[j - 1] + 1).min(prev[j - 1] + cost);
        }
        prev = current;
    }
    prev[b.len()]
}

/// Returns the directive `value` was probably meant to be.
pub fn near_miss(value: &str) -> Option<&'static str> {
    [WORKFLOW_DIRECTIVE, STEP_DIRECTIVE]
        .into_iter()
        .find(|directive| {
            value != *directive
                && (value.eq_ignore_ascii_case(directive)
                    || value.trim() == *directive
                    || edit_distance(value, directive) == 1)
        })
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCANNER
// ═══════════════════════════════════════════════════════════════════════════════

enum PendingHost {
    Variable {
        name: String,
        symbol: SymbolId,
    },
    DefaultExport,
    ObjectMethod {
        property: Span,
        key: Span,
        computed: bool,
        accessor: bool,
    },
    ClassMethod {
        class_name: Option<String>,
        key: Option<String>,
        is_static: bool,
        kind: MethodDefinitionKind,
    },
}

struct Candidate {
    span: Span,
    params_start: u32,
    body: Span,
    first_directive: Option<(Span, String)>,
    extra_directives: Vec<(Span, String)>,
    is_async: bool,
    is_generator: bool,
    is_arrow: bool,
    is_declaration: bool,
    own_name: Option<String>,
    own_symbol: Option<SymbolId>,
    scope_id: ScopeId,
}

struct ModuleScanner<'s> {
    source: &'s str,
    file_path: &'s str,
    lines: &'s LineIndex,
    scan: ModuleScan,
    tagged_stack: Vec<usize>,
    function_depth: usize,
    pending_host: Option<PendingHost>,
    class_names: Vec<Option<String>>,
    module_level_hosts: HashSet<u32>,
    callee_starts: HashSet<u32>,
    shorthand_starts: HashSet<u32>,
    current_statement: Span,
}

fn is_function_like(expr: &Expression) -> bool {
    matches!(
        expr,
        Expression::ArrowFunctionExpression(_) | Expression::FunctionExpression(_)
    )
}

fn directive_entries(directives: &[Directive]) -> (Option<(Span, String)>, Vec<(Span, String)>) {
    let mut iter = directives
        .iter()
        .map(|d| (d.span, d.directive.to_string()));
    let first = iter.next();
    (first, iter.collect())
}

impl<'s> ModuleScanner<'s> {
    fn position(&self, offset: u32) -> (u32, u32) {
        self.lines.position(self.source, offset)
    }

    fn error(&mut self, code: &str, message: String, offset: u32) -> Diagnostic {
        let (line, column) = self.position(offset);
        Diagnostic::error(code, &message, self.file_path, line, column)
    }

    fn report_misplaced(&mut self, span: Span, value: &str, location: &str) {
        let diagnostic = self
            .error(
                ERR_MISPLACED_DIRECTIVE,
                format!(
                    "The \"{}\" directive must be the first statement of a function body, found {}",
                    value, location
                ),
                span.start,
            )
            .with_hint("Move the directive to the top of the function it should tag.");
        self.scan.diagnostics.push(diagnostic);
    }

    fn report_near_miss(&mut self, span: Span, value: &str) {
        if let Some(expected) = near_miss(value) {
            let (line, column) = self.position(span.start);
            self.scan.diagnostics.push(Diagnostic::with_details(
                WARN_MISSPELLED_DIRECTIVE,
                Severity::Warning,
                &format!("\"{}\" is not a supported directive", value),
                self.file_path,
                line,
                column,
                vec![format!("Did you mean \"{}\"?", expected)],
            ));
        }
    }

    fn mark_module_level_hosts(&mut self, stmt: &Statement) {
        let mark_variables = |decl: &VariableDeclaration, hosts: &mut HashSet<u32>| {
            for declarator in &decl.declarations {
                if !matches!(declarator.id, BindingPattern::BindingIdentifier(_)) {
                    continue;
                }
                match &declarator.init {
                    Some(Expression::ArrowFunctionExpression(arrow)) => {
                        hosts.insert(arrow.span.start);
                    }
                    Some(Expression::FunctionExpression(func)) => {
                        hosts.insert(func.span.start);
                    }
                    _ => {}
                }
            }
        };

        match stmt {
            Statement::FunctionDeclaration(func) => {
                self.module_level_hosts.insert(func.span.start);
            }
            Statement::VariableDeclaration(decl) => {
                mark_variables(decl, &mut self.module_level_hosts);
            }
            Statement::ExportNamedDeclaration(export) => match &export.declaration {
                Some(Declaration::FunctionDeclaration(func)) => {
                    self.module_level_hosts.insert(func.span.start);
                }
                Some(Declaration::VariableDeclaration(decl)) => {
                    mark_variables(decl, &mut self.module_level_hosts);
                }
                _ => {}
            },
            Statement::ExportDefaultDeclaration(export) => {
                if let ExportDefaultDeclarationKind::FunctionDeclaration(func) = &export.declaration {
                    self.module_level_hosts.insert(func.span.start);
                }
            }
            _ => {}
        }
    }

    fn add_export(&mut self, local: String, exported: String) {
        self.scan.exports.entry(local).or_default().push(exported);
    }

    /// Classifies a function-shaped node. Returns whether it was tagged, so the
    /// caller can pop the tagged stack after walking the body.
    fn enter(&mut self, candidate: Candidate, host: Option<PendingHost>) -> bool {
        for (span, value) in &candidate.extra_directives {
            if FunctionKind::from_directive(value).is_some() {
                self.report_misplaced(*span, value, "after another directive");
            } else {
                self.report_near_miss(*span, value);
            }
        }

        let kind = match &candidate.first_directive {
            Some((span, value)) => match FunctionKind::from_directive(value) {
                Some(kind) => Some((kind, *span)),
                None => {
                    self.report_near_miss(*span, value);
                    None
                }
            },
            None => None,
        };

        let nested = self.function_depth > 0;
        self.function_depth += 1;

        let Some((kind, directive)) = kind else {
            return false;
        };

        if let Some(reason) = unsupported_reason(&candidate, host.as_ref()) {
            let diagnostic = self.error(
                ERR_UNSUPPORTED_HOST,
                format!(
                    "Functions marked with \"{}\" cannot be {}",
                    kind.directive(),
                    reason
                ),
                candidate.span.start,
            );
            self.scan.diagnostics.push(diagnostic);
            return false;
        }

        if kind == FunctionKind::Workflow && nested {
            let diagnostic = self
                .error(
                    ERR_NESTED_WORKFLOW,
                    "Functions marked with \"use workflow\" must be declared at module scope"
                        .to_string(),
                    candidate.span.start,
                )
                .with_hint("Move the workflow out of the enclosing function.");
            self.scan.diagnostics.push(diagnostic);
            return false;
        }

        let mut default_export = false;
        let mut binding = if candidate.is_declaration {
            candidate.own_symbol
        } else {
            None
        };
        let mut name = candidate.own_name.clone();

        let host = match host {
            Some(PendingHost::Variable { name: var_name, symbol }) => {
                binding = Some(symbol);
                name = Some(var_name);
                FunctionHost::Variable
            }
            Some(PendingHost::DefaultExport) => {
                default_export = name.is_none();
                if candidate.is_declaration {
                    FunctionHost::DefaultExport
                } else {
                    FunctionHost::Expression
                }
            }
            Some(PendingHost::ObjectMethod {
                property,
                key,
                computed,
                ..
            }) => {
                name = None;
                FunctionHost::ObjectMethod {
                    property,
                    key,
                    computed,
                }
            }
            Some(PendingHost::ClassMethod {
                class_name,
                key,
                is_static,
                ..
            }) => {
                name = None;
                FunctionHost::ClassMethod {
                    class_name,
                    key,
                    is_static,
                }
            }
            None if candidate.is_declaration => FunctionHost::Declaration,
            None => FunctionHost::Expression,
        };

        let index = self.scan.functions.len();
        let in_place = !nested
            && self.module_level_hosts.contains(&candidate.span.start)
            && matches!(
                host,
                FunctionHost::Declaration | FunctionHost::Variable | FunctionHost::DefaultExport
            );

        tracing::debug!(
            "classified {} #{} {:?} (nested={}, in_place={})",
            kind.prefix(),
            index,
            name,
            nested,
            in_place
        );

        self.scan.functions.push(TaggedFunction {
            index,
            kind,
            host,
            name,
            binding,
            self_binding: if candidate.is_declaration {
                None
            } else {
                candidate.own_symbol
            },
            parent: self.tagged_stack.last().copied(),
            nested,
            in_place,
            default_export,
            is_arrow: candidate.is_arrow,
            scope_id: candidate.scope_id,
            function_span: candidate.span,
            params_start: candidate.params_start,
            body: candidate.body,
            directive,
            statement: self.current_statement,
        });
        self.tagged_stack.push(index);
        true
    }

    fn leave(&mut self, tagged: bool) {
        self.function_depth -= 1;
        if tagged {
            self.tagged_stack.pop();
        }
    }
}

fn unsupported_reason(candidate: &Candidate, host: Option<&PendingHost>) -> Option<&'static str> {
    if candidate.is_generator {
        return Some("generator functions");
    }
    match host {
        Some(PendingHost::ObjectMethod { accessor: true, .. }) => {
            return Some("getters or setters")
        }
        Some(PendingHost::ClassMethod { kind, .. }) => match kind {
            MethodDefinitionKind::Get | MethodDefinitionKind::Set => {
                return Some("getters or setters")
            }
            MethodDefinitionKind::Constructor => return Some("constructors"),
            MethodDefinitionKind::Method => {}
        },
        _ => {}
    }
    if !candidate.is_async {
        return Some("synchronous functions; they must be async");
    }
    None
}

impl<'a, 's> Visit<'a> for ModuleScanner<'s> {
    fn visit_program(&mut self, program: &Program<'a>) {
        for directive in &program.directives {
            let value = directive.directive.to_string();
            if FunctionKind::from_directive(&value).is_some() {
                self.report_misplaced(directive.span, &value, "at module scope");
            } else {
                self.report_near_miss(directive.span, &value);
            }
        }

        for stmt in &program.body {
            self.current_statement = stmt.span();
            self.mark_module_level_hosts(stmt);
            self.visit_statement(stmt);
        }
    }

    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        let host = self.pending_host.take();
        let Some(body) = &func.body else {
            walk::walk_function(self, func, flags);
            return;
        };

        let (first_directive, extra_directives) = directive_entries(&body.directives);
        let candidate = Candidate {
            span: func.span,
            params_start: func
                .type_parameters
                .as_ref()
                .map_or(func.params.span.start, |tp| tp.span.start),
            body: body.span,
            first_directive,
            extra_directives,
            is_async: func.r#async,
            is_generator: func.generator,
            is_arrow: false,
            is_declaration: func.is_declaration(),
            own_name: func.id.as_ref().map(|id| id.name.to_string()),
            own_symbol: func.id.as_ref().map(|id| id.symbol_id()),
            scope_id: func.scope_id(),
        };

        let tagged = self.enter(candidate, host);
        walk::walk_function(self, func, flags);
        self.leave(tagged);
    }

    fn visit_arrow_function_expression(&mut self, arrow: &ArrowFunctionExpression<'a>) {
        let host = self.pending_host.take();
        let (first_directive, extra_directives) = directive_entries(&arrow.body.directives);
        let candidate = Candidate {
            span: arrow.span,
            params_start: arrow
                .type_parameters
                .as_ref()
                .map_or(arrow.params.span.start, |tp| tp.span.start),
            body: arrow.body.span,
            first_directive,
            extra_directives,
            is_async: arrow.r#async,
            is_generator: false,
            is_arrow: true,
            is_declaration: false,
            own_name: None,
            own_symbol: None,
            scope_id: arrow.scope_id(),
        };

        let tagged = self.enter(candidate, host);
        walk::walk_arrow_function_expression(self, arrow);
        self.leave(tagged);
    }

    fn visit_variable_declarator(&mut self, decl: &VariableDeclarator<'a>) {
        self.visit_binding_pattern(&decl.id);
        if let Some(init) = &decl.init {
            if let BindingPattern::BindingIdentifier(id) = &decl.id {
                if is_function_like(init) {
                    self.pending_host = Some(PendingHost::Variable {
                        name: id.name.to_string(),
                        symbol: id.symbol_id(),
                    });
                }
            }
            self.visit_expression(init);
        }
    }

    fn visit_export_named_declaration(&mut self, export: &ExportNamedDeclaration<'a>) {
        if export.source.is_none() {
            for specifier in &export.specifiers {
                self.add_export(
                    specifier.local.name().to_string(),
                    specifier.exported.name().to_string(),
                );
            }
            match &export.declaration {
                Some(Declaration::FunctionDeclaration(func)) => {
                    if let Some(id) = &func.id {
                        self.add_export(id.name.to_string(), id.name.to_string());
                    }
                }
                Some(Declaration::VariableDeclaration(decl)) => {
                    for declarator in &decl.declarations {
                        if let BindingPattern::BindingIdentifier(id) = &declarator.id {
                            self.add_export(id.name.to_string(), id.name.to_string());
                        }
                    }
                }
                Some(Declaration::ClassDeclaration(class)) => {
                    if let Some(id) = &class.id {
                        self.add_export(id.name.to_string(), id.name.to_string());
                    }
                }
                _ => {}
            }
        }
        walk::walk_export_named_declaration(self, export);
    }

    fn visit_export_default_declaration(&mut self, export: &ExportDefaultDeclaration<'a>) {
        match &export.declaration {
            ExportDefaultDeclarationKind::FunctionDeclaration(func) => match &func.id {
                Some(id) => self.add_export(id.name.to_string(), "default".to_string()),
                None => self.pending_host = Some(PendingHost::DefaultExport),
            },
            ExportDefaultDeclarationKind::ArrowFunctionExpression(_)
            | ExportDefaultDeclarationKind::FunctionExpression(_) => {
                self.pending_host = Some(PendingHost::DefaultExport);
            }
            ExportDefaultDeclarationKind::Identifier(id) => {
                self.add_export(id.name.to_string(), "default".to_string());
            }
            _ => {}
        }
        walk::walk_export_default_declaration(self, export);
    }

    fn visit_object_property(&mut self, prop: &ObjectProperty<'a>) {
        if prop.shorthand {
            if let Expression::Identifier(id) = &prop.value {
                self.shorthand_starts.insert(id.span.start);
            }
        }

        let accessor = prop.kind != PropertyKind::Init;
        if (prop.method || accessor) && is_function_like(&prop.value) {
            self.visit_property_key(&prop.key);
            self.pending_host = Some(PendingHost::ObjectMethod {
                property: prop.span,
                key: prop.key.span(),
                computed: prop.computed,
                accessor,
            });
            self.visit_expression(&prop.value);
        } else {
            walk::walk_object_property(self, prop);
        }
    }

    fn visit_class(&mut self, class: &Class<'a>) {
        self.class_names
            .push(class.id.as_ref().map(|id| id.name.to_string()));
        walk::walk_class(self, class);
        self.class_names.pop();
    }

    fn visit_method_definition(&mut self, method: &MethodDefinition<'a>) {
        for decorator in &method.decorators {
            self.visit_decorator(decorator);
        }
        self.visit_property_key(&method.key);
        self.pending_host = Some(PendingHost::ClassMethod {
            class_name: self.class_names.last().cloned().flatten(),
            key: method.key.static_name().map(|name| name.to_string()),
            is_static: method.r#static,
            kind: method.kind,
        });
        self.visit_function(&method.value, ScopeFlags::Function);
    }

    fn visit_expression_statement(&mut self, stmt: &ExpressionStatement<'a>) {
        if let Expression::StringLiteral(literal) = &stmt.expression {
            let raw = literal
                .raw
                .as_ref()
                .map(|raw| raw.trim_matches(|c| c == '"' || c == '\'').to_string())
                .unwrap_or_else(|| literal.value.to_string());
            if FunctionKind::from_directive(&raw).is_some() {
                self.report_misplaced(stmt.span, &raw, "inside a nested statement");
            }
        }
        walk::walk_expression_statement(self, stmt);
    }

    fn visit_call_expression(&mut self, call: &CallExpression<'a>) {
        if let Expression::Identifier(id) = &call.callee {
            self.callee_starts.insert(id.span.start);
        }
        walk::walk_call_expression(self, call);
    }

    fn visit_binding_identifier(&mut self, ident: &BindingIdentifier<'a>) {
        self.scan.used_names.insert(ident.name.to_string());
    }

    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        let name = ident.name.to_string();
        self.scan.used_names.insert(name.clone());
        let Some(reference_id) = ident.reference_id.get() else {
            return;
        };
        self.scan.references.push(ReferenceSite {
            reference_id,
            span: ident.span,
            name,
            owner: self.tagged_stack.last().copied(),
            is_callee: self.callee_starts.contains(&ident.span.start),
            shorthand: self.shorthand_starts.contains(&ident.span.start),
        });
    }
}

/// Scans a parsed module. Error diagnostics are returned inside the scan; the
/// caller decides whether to abort.
pub fn scan_module(
    program: &Program,
    source: &str,
    file_path: &str,
    lines: &LineIndex,
) -> ModuleScan {
    let mut scanner = ModuleScanner {
        source,
        file_path,
        lines,
        scan: ModuleScan::default(),
        tagged_stack: Vec::new(),
        function_depth: 0,
        pending_host: None,
        class_names: Vec::new(),
        module_level_hosts: HashSet::new(),
        callee_starts: HashSet::new(),
        shorthand_starts: HashSet::new(),
        current_statement: Span::default(),
    };

    scanner.scan.header_start = program.hashbang.as_ref().map_or(0, |h| h.span.end);
    scanner.scan.prologue_end = program
        .directives
        .last()
        .map_or(scanner.scan.header_start, |d| d.span.end);

    scanner.visit_program(program);
    scanner.scan
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
