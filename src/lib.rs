//! # Workflow Directive Compiler
//!
//! Static transform that makes `"use workflow"` / `"use step"` functions
//! durable: each tagged function gets a stable qualified ID, is hoisted to
//! module scope when it cannot stay where it is, receives its captured
//! variables from the runtime instead of a live closure, and is registered
//! by ID when the module loads.
//!
//! ## Pipeline Invariants
//!
//! 1. **Exact Directives**: only the literal first statement `"use workflow"`
//!    or `"use step"` of a function body tags it. Anywhere else the string is
//!    a compile error (WF-ERR-DIRECTIVE-001).
//!
//! 2. **Stable IDs**: `<kind>//<module path>//<qualified name>`, where nested
//!    functions join their parent's qualified name with `/`. Anonymous
//!    functions are numbered per kind in discovery order, from 0.
//!
//! 3. **Hygiene**: every synthesized top-level name (hoisted locals, helper
//!    imports, `__default`) is reserved through one table seeded with every
//!    name in the module. Suffixes are `$1`, `$2`, ... first free wins.
//!
//! 4. **Exact Captures**: a step's closure variables are the value references
//!    in its body that resolve to a binding declared outside the step and
//!    below module scope. Parameters, body locals, module bindings and
//!    globals never appear.
//!
//! 5. **Register Before Run**: each durable function is registered right
//!    after its declaration, so every dispatchable ID exists once the module
//!    has loaded.
//!
//! 6. **No Partial Output**: any error diagnostic aborts the module.
//!
//! 7. **Order-Free Merge**: the project manifest is an associative,
//!    commutative union; a key claimed by two modules is always an error.

#[cfg(feature = "napi")]
use napi_derive::napi;

mod cache;
mod codegen;
mod directive;
mod discovery;
mod finalize;
mod naming;
mod parse;
mod renamer;
mod scope;
mod transform;
mod validate;

#[cfg(test)]
mod pipeline_tests;

pub use cache::IncrementalCache;
pub use codegen::{GET_CLOSURE_VARS, REGISTER_STEP, REGISTER_WORKFLOW, USE_STEP};
pub use directive::{FunctionKind, STEP_DIRECTIVE, WORKFLOW_DIRECTIVE};
pub use discovery::{find_source_files, transform_project, ProjectModule, ProjectOptions, ProjectOutput};
pub use finalize::{
    extract_manifest_annotation, merge_contributions, Manifest, ManifestConflict,
    ManifestContribution, ProjectManifest, StepEntry, WorkflowEntry, MANIFEST_MARKER,
};
pub use naming::{format_name, IdentifierRecord};
pub use scope::{ClosureOrigin, ClosureVariable};
pub use transform::{transform_module, ModuleOutput, TransformOptions, DEFAULT_RUNTIME_MODULE};
pub use validate::*;

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI BRIDGE
// ═══════════════════════════════════════════════════════════════════════════════

/// Transforms one module; returns `ModuleOutput` as JSON.
#[cfg(feature = "napi")]
#[napi]
pub fn transform_module_native(source: String, options: TransformOptions) -> napi::Result<String> {
    let output = transform_module(&source, &options)
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    serde_json::to_string(&output).map_err(|e| napi::Error::from_reason(e.to_string()))
}

/// Merges a JSON array of manifest contributions into a project manifest.
#[cfg(feature = "napi")]
#[napi]
pub fn merge_manifests_native(contributions_json: String) -> napi::Result<String> {
    let contributions: Vec<ManifestContribution> = serde_json::from_str(&contributions_json)
        .map_err(|e| napi::Error::from_reason(format!("invalid contributions: {}", e)))?;
    let project = merge_contributions(&contributions)
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    serde_json::to_string(&project.into_manifest())
        .map_err(|e| napi::Error::from_reason(e.to_string()))
}

/// Recovers the manifest annotation from transformed code, if present.
#[cfg(feature = "napi")]
#[napi]
pub fn extract_manifest_native(code: String) -> Option<String> {
    extract_manifest_annotation(&code).and_then(|m| serde_json::to_string(&m).ok())
}
