//! Manifest Emitter
//!
//! Builds the per-module manifest from identifier records, renders it as the
//! one-line annotation at the top of transformed output, recovers it from
//! text, and merges per-module contributions into the project manifest.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::directive::FunctionKind;
use crate::naming::IdentifierRecord;
use crate::validate::ERR_DUPLICATE_MANIFEST_KEY;

/// Greppable marker that prefixes the annotation JSON.
pub const MANIFEST_MARKER: &str = "__internal_workflows";

lazy_static::lazy_static! {
    static ref ANNOTATION_RE: Regex =
        Regex::new(r"/\*\*__internal_workflows(\{.*?\})\*/").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANIFEST SHAPE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEntry {
    pub workflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    pub step_id: String,
}

/// file path -> name -> entry, for both kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, BTreeMap<String, WorkflowEntry>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<String, BTreeMap<String, StepEntry>>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.steps.is_empty()
    }

    /// Every `(kind, file, name, id)` entry in key order.
    pub fn entries(&self) -> impl Iterator<Item = (FunctionKind, &str, &str, &str)> {
        let workflows = self.workflows.iter().flat_map(|(file, names)| {
            names.iter().map(move |(name, entry)| {
                (FunctionKind::Workflow, file.as_str(), name.as_str(), entry.workflow_id.as_str())
            })
        });
        let steps = self.steps.iter().flat_map(|(file, names)| {
            names.iter().map(move |(name, entry)| {
                (FunctionKind::Step, file.as_str(), name.as_str(), entry.step_id.as_str())
            })
        });
        workflows.chain(steps)
    }

    fn insert(&mut self, kind: FunctionKind, file: &str, name: &str, id: &str) -> Option<String> {
        match kind {
            FunctionKind::Workflow => self
                .workflows
                .entry(file.to_string())
                .or_default()
                .insert(
                    name.to_string(),
                    WorkflowEntry {
                        workflow_id: id.to_string(),
                    },
                )
                .map(|previous| previous.workflow_id),
            FunctionKind::Step => self
                .steps
                .entry(file.to_string())
                .or_default()
                .insert(
                    name.to_string(),
                    StepEntry {
                        step_id: id.to_string(),
                    },
                )
                .map(|previous| previous.step_id),
        }
    }

    /// `/**__internal_workflows{...}*/;`
    pub fn annotation(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("/**{}{}*/;", MANIFEST_MARKER, json)
    }
}

/// Two contributions claimed the same `(kind, file, name)` key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "[{code}] duplicate {label} manifest key \"{name}\" in {file}, contributed by {first} and {second}",
    code = ERR_DUPLICATE_MANIFEST_KEY,
    label = .kind.prefix()
)]
pub struct ManifestConflict {
    pub kind: FunctionKind,
    pub file: String,
    pub name: String,
    pub first: String,
    pub second: String,
}

impl ManifestConflict {
    fn new(kind: FunctionKind, file: &str, name: &str, a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            kind,
            file: file.to_string(),
            name: name.to_string(),
            first: first.to_string(),
            second: second.to_string(),
        }
    }
}

/// Per-module manifest. Workflows are keyed by export name (or by qualified
/// name when not exported); steps by qualified name.
pub fn build_manifest(
    file_key: &str,
    records: &[IdentifierRecord],
) -> Result<Manifest, ManifestConflict> {
    let mut manifest = Manifest::default();
    for record in records {
        let keys: Vec<&str> = match record.kind {
            FunctionKind::Workflow if !record.export_names.is_empty() => {
                record.export_names.iter().map(String::as_str).collect()
            }
            _ => vec![record.qualified_name.as_str()],
        };
        for key in keys {
            if let Some(previous) = manifest.insert(record.kind, file_key, key, &record.qualified_id) {
                return Err(ManifestConflict::new(
                    record.kind,
                    file_key,
                    key,
                    &previous,
                    &record.qualified_id,
                ));
            }
        }
    }
    Ok(manifest)
}

/// Recovers a module's manifest from transformed text without parsing it.
pub fn extract_manifest_annotation(code: &str) -> Option<Manifest> {
    let captures = ANNOTATION_RE.captures(code)?;
    serde_json::from_str(captures.get(1)?.as_str()).ok()
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROJECT MANIFEST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestContribution {
    /// Source file the contribution came from.
    pub source: String,
    pub manifest: Manifest,
}

type EntryKey = (FunctionKind, String, String);

/// Union of module manifests that remembers every `(source, id)` claim on
/// each key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectManifest {
    claims: BTreeMap<EntryKey, BTreeSet<(String, String)>>,
}

impl ProjectManifest {
    pub fn from_contribution(contribution: &ManifestContribution) -> Self {
        let mut project = ProjectManifest::default();
        for (kind, file, name, id) in contribution.manifest.entries() {
            project
                .claims
                .entry((kind, file.to_string(), name.to_string()))
                .or_default()
                .insert((contribution.source.clone(), id.to_string()));
        }
        project
    }

    /// Associative and commutative union of claims. Conflicts are kept, not
    /// resolved; `conflict` reports them once every contribution is in.
    pub fn merge(mut self, other: ProjectManifest) -> ProjectManifest {
        for (key, claims) in other.claims {
            self.claims.entry(key).or_default().extend(claims);
        }
        self
    }

    /// The smallest key claimed more than once, with its two smallest sources.
    pub fn conflict(&self) -> Option<ManifestConflict> {
        self.claims.iter().find_map(|((kind, file, name), claims)| {
            let mut sources = claims.iter().map(|(source, _)| source.as_str());
            let first = sources.next()?;
            let second = sources.next()?;
            Some(ManifestConflict::new(*kind, file, name, first, second))
        })
    }

    /// Fails with `conflict` if there is one.
    pub fn verified(self) -> Result<ProjectManifest, ManifestConflict> {
        match self.conflict() {
            Some(conflict) => Err(conflict),
            None => Ok(self),
        }
    }

    pub fn source_of(&self, kind: FunctionKind, file: &str, name: &str) -> Option<&str> {
        self.claims
            .get(&(kind, file.to_string(), name.to_string()))
            .and_then(|claims| claims.first())
            .map(|(source, _)| source.as_str())
    }

    pub fn into_manifest(self) -> Manifest {
        let mut manifest = Manifest::default();
        for ((kind, file, name), claims) in &self.claims {
            if let Some((_, id)) = claims.first() {
                manifest.insert(*kind, file, name, id);
            }
        }
        manifest
    }
}

pub fn merge_contributions<'c>(
    contributions: impl IntoIterator<Item = &'c ManifestContribution>,
) -> Result<ProjectManifest, ManifestConflict> {
    contributions
        .into_iter()
        .map(ProjectManifest::from_contribution)
        .fold(ProjectManifest::default(), ProjectManifest::merge)
        .verified()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
