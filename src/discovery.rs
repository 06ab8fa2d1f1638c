//! Project runner
//!
//! Walks a source tree, transforms every module in parallel and reduces the
//! per-module manifests into the project manifest. Modules share nothing
//! while they are transformed; the only join point is the manifest merge.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::cache::IncrementalCache;
use crate::finalize::{Manifest, ProjectManifest};
use crate::parse::normalize_path;
use crate::transform::{transform_module, ModuleOutput, TransformOptions};
use crate::validate::{Diagnostic, TransformError};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectOptions {
    pub root: PathBuf,
    /// Template options; `filePath` is replaced per module.
    pub transform: TransformOptions,
    pub cache_dir: Option<PathBuf>,
    pub extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        ProjectOptions {
            root: PathBuf::from("."),
            transform: TransformOptions::default(),
            cache_dir: None,
            extensions: ["js", "mjs", "cjs", "jsx", "ts", "mts", "cts", "tsx"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_dirs: ["node_modules", ".git", "dist", ".next"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectModule {
    /// Path relative to the project root, forward slashes.
    pub path: String,
    pub output: ModuleOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOutput {
    pub modules: Vec<ProjectModule>,
    pub manifest: Manifest,
}

impl ProjectOutput {
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.modules.iter().flat_map(|m| m.output.diagnostics.iter())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

fn is_declaration_file(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".d.ts") || name.ends_with(".d.mts") || name.ends_with(".d.cts")
}

/// Source files under `root`, sorted, skipping ignored directories and
/// declaration files.
pub fn find_source_files(root: &Path, options: &ProjectOptions) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !options
                    .ignore_dirs
                    .iter()
                    .any(|ignored| entry.file_name() == ignored.as_str())
        })
        .filter_map(Result::ok)
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && !is_declaration_file(path))
        .filter(|path| {
            path.extension()
                .map(|ext| options.extensions.iter().any(|e| ext == e.as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

fn transform_file(
    root: &Path,
    path: &Path,
    template: &TransformOptions,
    cache: Option<&IncrementalCache>,
) -> Result<ProjectModule, TransformError> {
    let source = fs::read_to_string(path).map_err(|source| TransformError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let relative = normalize_path(&path.strip_prefix(root).unwrap_or(path).to_string_lossy());
    let options = TransformOptions {
        file_path: relative.clone(),
        ..template.clone()
    };

    if let Some(output) = cache.and_then(|c| c.get(&relative, &source, &options)) {
        return Ok(ProjectModule {
            path: relative,
            output,
        });
    }

    let output = transform_module(&source, &options)?;
    if let Some(cache) = cache {
        cache.set(&relative, &source, &options, &output);
    }
    Ok(ProjectModule {
        path: relative,
        output,
    })
}

/// Failed modules are reported together, in path order, so the outcome does
/// not depend on which worker finished first.
fn collect_modules(
    results: Vec<Result<ProjectModule, TransformError>>,
) -> Result<Vec<ProjectModule>, TransformError> {
    let mut modules = Vec::with_capacity(results.len());
    let mut diagnostics = Vec::new();
    for result in results {
        match result {
            Ok(module) => modules.push(module),
            Err(TransformError::Diagnostics(found)) => diagnostics.extend(found),
            Err(other) => return Err(other),
        }
    }
    if diagnostics.is_empty() {
        Ok(modules)
    } else {
        Err(TransformError::Diagnostics(diagnostics))
    }
}

pub fn transform_project(options: &ProjectOptions) -> Result<ProjectOutput, TransformError> {
    options.transform.validate()?;
    let root = options.root.as_path();
    let files = find_source_files(root, options);
    tracing::info!("transforming {} modules under {}", files.len(), root.display());

    let cache = options
        .cache_dir
        .as_ref()
        .map(IncrementalCache::new)
        .transpose()?;

    let results: Vec<Result<ProjectModule, TransformError>> = files
        .par_iter()
        .map(|path| transform_file(root, path, &options.transform, cache.as_ref()))
        .collect();
    let modules = collect_modules(results)?;

    let project = modules
        .par_iter()
        .map(|module| ProjectManifest::from_contribution(&module.output.contribution(&module.path)))
        .reduce(ProjectManifest::default, ProjectManifest::merge)
        .verified()?;

    let manifest = project.into_manifest();
    tracing::info!(
        "project manifest: {} workflows, {} steps",
        manifest.workflows.values().map(|m| m.len()).sum::<usize>(),
        manifest.steps.values().map(|m| m.len()).sum::<usize>()
    );

    Ok(ProjectOutput { modules, manifest })
}
