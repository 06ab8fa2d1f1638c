#[cfg(feature = "napi")]
use napi_derive::napi;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::finalize::ManifestConflict;

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_PARSE: &str = "WF-ERR-PARSE-001";
pub const ERR_MISPLACED_DIRECTIVE: &str = "WF-ERR-DIRECTIVE-001";
pub const WARN_MISSPELLED_DIRECTIVE: &str = "WF-WARN-DIRECTIVE-002";
pub const ERR_UNSUPPORTED_HOST: &str = "WF-ERR-HOST-001";
pub const ERR_NESTED_WORKFLOW: &str = "WF-ERR-HOST-002";
pub const ERR_UNRESOLVED_FREE_VARIABLE: &str = "WF-ERR-SCOPE-001";
pub const ERR_SHADOWED_CAPTURE: &str = "WF-ERR-SCOPE-002";
pub const WARN_CAPTURED_WRITE: &str = "WF-WARN-SCOPE-003";
pub const ERR_DUPLICATE_ID: &str = "WF-ERR-ID-001";
pub const ERR_HYGIENE_EXHAUSTED: &str = "WF-ERR-ID-002";
pub const ERR_DUPLICATE_MANIFEST_KEY: &str = "WF-ERR-MANIFEST-001";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_PARSE => "Only syntactically valid modules are transformed.",
        ERR_MISPLACED_DIRECTIVE => {
            "Directives are recognized only as the first statement of a function body."
        }
        WARN_MISSPELLED_DIRECTIVE => "Only the exact strings \"use workflow\" and \"use step\" tag a function.",
        ERR_UNSUPPORTED_HOST => "Every tagged function can be hoisted to module scope unchanged.",
        ERR_NESTED_WORKFLOW => "Workflows are declared at module scope.",
        ERR_UNRESOLVED_FREE_VARIABLE => {
            "Every free variable of a step is attributed to an enclosing scope or a known global."
        }
        ERR_SHADOWED_CAPTURE => {
            "A dispatch call site supplies exactly the bindings the step captured."
        }
        WARN_CAPTURED_WRITE => "Captured variables are read-only copies inside a step.",
        ERR_DUPLICATE_ID => "No two durable functions share a qualified ID.",
        ERR_HYGIENE_EXHAUSTED => "Every synthesized top-level name is unique.",
        ERR_DUPLICATE_MANIFEST_KEY => "Each (file, name) manifest key resolves to one ID.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: String,
    pub severity: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn error(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, Severity::Error, message, file, line, column, vec![])
    }

    pub fn warning(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, Severity::Warning, message, file, line, column, vec![])
    }

    pub fn with_details(
        code: &str,
        severity: Severity,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        hints: Vec<String>,
    ) -> Self {
        Diagnostic {
            code: code.to_string(),
            severity: match severity {
                Severity::Error => "error".to_string(),
                Severity::Warning => "warning".to_string(),
            },
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line,
            column,
            hints,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == "error"
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {} [{}] {}",
            self.file, self.line, self.column, self.severity, self.code, self.message
        )?;
        for hint in &self.hints {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFORM ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("{}", render_diagnostics(.0))]
    Diagnostics(Vec<Diagnostic>),

    #[error(transparent)]
    Conflict(#[from] ManifestConflict),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transform options: {0}")]
    Options(String),
}

impl TransformError {
    /// Diagnostics carried by this error, empty for I/O and option failures.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            TransformError::Diagnostics(diagnostics) => diagnostics,
            _ => &[],
        }
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits collected diagnostics into an error (if any error-severity entry exists)
/// or the warnings to carry forward.
pub fn into_result(diagnostics: Vec<Diagnostic>) -> Result<Vec<Diagnostic>, TransformError> {
    if diagnostics.iter().any(Diagnostic::is_error) {
        Err(TransformError::Diagnostics(diagnostics))
    } else {
        Ok(diagnostics)
    }
}
