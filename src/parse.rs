//! Parse Module
//!
//! Turns module source text into an oxc `Program` plus the semantic facts
//! (symbols, references, scopes) the later stages resolve against.

use oxc_allocator::Allocator;
use oxc_ast::ast::Program;
use oxc_parser::Parser;
use oxc_semantic::{Semantic, SemanticBuilder};
use oxc_span::SourceType;

use crate::validate::{Diagnostic, TransformError, ERR_PARSE};

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE TYPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Picks the source type from the file extension, defaulting to TS + JSX.
pub fn source_type_for(file_path: &str) -> SourceType {
    SourceType::from_path(file_path).unwrap_or_else(|_| {
        SourceType::default()
            .with_typescript(true)
            .with_module(true)
            .with_jsx(true)
    })
}

/// Normalizes a path for use in IDs and manifest keys (forward slashes, no `./`).
pub fn normalize_path(file_path: &str) -> String {
    let normalized = file_path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(|s| s.to_string())
        .unwrap_or(normalized)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LINE INDEX
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps byte offsets to 1-based line/column pairs for diagnostics.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<u32>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push((i + 1) as u32);
            }
        }
        Self { line_starts }
    }

    pub fn position(&self, source: &str, offset: u32) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let start = self.line_starts[line] as usize;
        let end = (offset as usize).min(source.len());
        let column = source.get(start..end).map(|s| s.chars().count()).unwrap_or(0);
        (line as u32 + 1, column as u32 + 1)
    }
}

/// Module text plus the path diagnostics are reported against.
pub struct SourceText<'s> {
    pub text: &'s str,
    pub path: &'s str,
    pub lines: LineIndex,
}

impl<'s> SourceText<'s> {
    pub fn new(text: &'s str, path: &'s str) -> Self {
        Self {
            text,
            path,
            lines: LineIndex::new(text),
        }
    }

    pub fn slice(&self, start: u32, end: u32) -> &'s str {
        &self.text[start as usize..end as usize]
    }

    pub fn error(&self, code: &str, message: &str, offset: u32) -> Diagnostic {
        let (line, column) = self.lines.position(self.text, offset);
        Diagnostic::error(code, message, self.path, line, column)
    }

    pub fn warning(&self, code: &str, message: &str, offset: u32) -> Diagnostic {
        let (line, column) = self.lines.position(self.text, offset);
        Diagnostic::warning(code, message, self.path, line, column)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses `source` into a program, failing with positioned diagnostics.
pub fn parse_program<'a>(
    allocator: &'a Allocator,
    source: &'a str,
    file_path: &str,
    lines: &LineIndex,
) -> Result<Program<'a>, TransformError> {
    let ret = Parser::new(allocator, source, source_type_for(file_path)).parse();

    if ret.panicked || !ret.errors.is_empty() {
        let diagnostics = if ret.errors.is_empty() {
            vec![Diagnostic::error(ERR_PARSE, "Parser aborted", file_path, 1, 1)]
        } else {
            ret.errors
                .iter()
                .map(|error| {
                    let offset = error
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.first())
                        .map(|label| label.offset() as u32)
                        .unwrap_or(0);
                    let (line, column) = lines.position(source, offset);
                    Diagnostic::error(ERR_PARSE, &error.message, file_path, line, column)
                })
                .collect()
        };
        return Err(TransformError::Diagnostics(diagnostics));
    }

    Ok(ret.program)
}

/// Builds scope facts for a parsed program. Semantic errors (redeclarations and
/// the like) are reported the same way as parse errors.
pub fn analyze<'a>(
    program: &'a Program<'a>,
    source: &str,
    file_path: &str,
    lines: &LineIndex,
) -> Result<Semantic<'a>, TransformError> {
    let ret = SemanticBuilder::new().build(program);
    if !ret.errors.is_empty() {
        let diagnostics = ret
            .errors
            .iter()
            .map(|error| {
                let offset = error
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.first())
                    .map(|label| label.offset() as u32)
                    .unwrap_or(0);
                let (line, column) = lines.position(source, offset);
                Diagnostic::error(ERR_PARSE, &error.message, file_path, line, column)
            })
            .collect();
        return Err(TransformError::Diagnostics(diagnostics));
    }
    Ok(ret.semantic)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
