//! Per-module pipeline.
//!
//! parse → classify → allocate → extract → emit manifest → rewrite, strictly
//! in sequence. Any error-severity diagnostic stops the module before output
//! is produced; warnings travel with the result.

#[cfg(feature = "napi")]
use napi_derive::napi;
use oxc_allocator::Allocator;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::codegen::{rewrite_module, RewriteInput};
use crate::directive::scan_module;
use crate::finalize::{build_manifest, Manifest, ManifestContribution};
use crate::naming::{allocate_identifiers, module_path, IdentifierRecord, NameTable};
use crate::parse::{analyze, normalize_path, parse_program, SourceText};
use crate::scope::extract_closure_vars;
use crate::validate::{into_result, Diagnostic, TransformError};

pub const DEFAULT_RUNTIME_MODULE: &str = "workflow/internal/private";

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase", default)]
pub struct TransformOptions {
    /// Path used in qualified IDs and as the manifest key.
    pub file_path: String,
    /// Replaces the file path inside qualified IDs (e.g. `pkg@1.0.0`).
    pub module_specifier: Option<String>,
    /// Module the runtime helpers are imported from.
    pub runtime_module: String,
    /// Unresolved free variables in steps become errors instead of warnings.
    pub strict_globals: bool,
    /// Extra names a step may read without a binding.
    pub known_globals: Vec<String>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        TransformOptions {
            file_path: "input.js".to_string(),
            module_specifier: None,
            runtime_module: DEFAULT_RUNTIME_MODULE.to_string(),
            strict_globals: false,
            known_globals: Vec::new(),
        }
    }
}

impl TransformOptions {
    pub fn for_file(file_path: impl Into<String>) -> Self {
        TransformOptions {
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransformError> {
        if self.file_path.trim().is_empty() {
            return Err(TransformError::Options("filePath must not be empty".to_string()));
        }
        if self.runtime_module.trim().is_empty() {
            return Err(TransformError::Options(
                "runtimeModule must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleOutput {
    pub code: String,
    pub manifest: Manifest,
    pub records: Vec<IdentifierRecord>,
    /// Warnings only; errors abort the module.
    pub diagnostics: Vec<Diagnostic>,
}

impl ModuleOutput {
    pub fn contribution(&self, source: impl Into<String>) -> ManifestContribution {
        ManifestContribution {
            source: source.into(),
            manifest: self.manifest.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

pub fn transform_module(
    source: &str,
    options: &TransformOptions,
) -> Result<ModuleOutput, TransformError> {
    options.validate()?;
    let file_path = normalize_path(&options.file_path);
    let text = SourceText::new(source, &file_path);

    let allocator = Allocator::default();
    let program = parse_program(&allocator, source, &file_path, &text.lines)?;
    let semantic = analyze(&program, source, &file_path, &text.lines)?;

    let mut scan = scan_module(&program, source, &file_path, &text.lines);
    let mut diagnostics = into_result(std::mem::take(&mut scan.diagnostics))?;
    tracing::debug!(
        "{}: {} tagged functions, {} references",
        file_path,
        scan.functions.len(),
        scan.references.len()
    );

    if scan.functions.is_empty() {
        return Ok(ModuleOutput {
            code: source.to_string(),
            manifest: Manifest::default(),
            records: Vec::new(),
            diagnostics,
        });
    }

    let module_path = module_path(options.module_specifier.as_deref(), &file_path);
    let mut names = NameTable::new(scan.used_names.iter().cloned());
    let mut records = allocate_identifiers(&scan, &module_path, &mut names, &text)
        .map_err(TransformError::Diagnostics)?;

    let known_globals: HashSet<String> = options.known_globals.iter().cloned().collect();
    diagnostics.extend(extract_closure_vars(
        &scan,
        semantic.scoping(),
        &mut records,
        options.strict_globals,
        &known_globals,
        &text,
    ));
    let diagnostics = into_result(diagnostics)?;

    let manifest = build_manifest(&file_path, &records)?;
    let annotation = manifest.annotation();

    let code = rewrite_module(
        RewriteInput {
            source: &text,
            scan: &scan,
            records: &records,
            scoping: semantic.scoping(),
            runtime_module: &options.runtime_module,
            annotation: &annotation,
        },
        &mut names,
    )
    .map_err(TransformError::Diagnostics)?;

    for diagnostic in &diagnostics {
        tracing::warn!("{}", diagnostic);
    }

    Ok(ModuleOutput {
        code,
        manifest,
        records,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_json_defaults() {
        let options: TransformOptions =
            serde_json::from_str(r#"{ "filePath": "src/a.ts", "strictGlobals": true }"#).unwrap();
        assert_eq!(options.file_path, "src/a.ts");
        assert_eq!(options.runtime_module, DEFAULT_RUNTIME_MODULE);
        assert!(options.strict_globals);
        assert!(options.known_globals.is_empty());
    }

    #[test]
    fn test_empty_file_path_rejected() {
        let options = TransformOptions::for_file("  ");
        assert!(matches!(
            transform_module("const a = 1;", &options),
            Err(TransformError::Options(_))
        ));
    }

    #[test]
    fn test_untagged_module_is_untouched() {
        let source = "// plain\nexport async function f() { return 1; }\n";
        let output = transform_module(source, &TransformOptions::default()).unwrap();
        assert_eq!(output.code, source);
        assert!(output.manifest.is_empty());
        assert!(output.records.is_empty());
    }

    #[test]
    fn test_module_specifier_used_in_ids_not_keys() {
        let options = TransformOptions {
            file_path: "./src/jobs.ts".to_string(),
            module_specifier: Some("jobs@1.2.0".to_string()),
            ..Default::default()
        };
        let output = transform_module(
            "export async function send() { \"use step\"; }\n",
            &options,
        )
        .unwrap();
        assert_eq!(
            output.manifest.steps["src/jobs.ts"]["send"].step_id,
            "step//jobs@1.2.0//send"
        );
    }
}
