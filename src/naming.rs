//! Identifier Allocator
//!
//! Assigns each tagged function its qualified ID and a collision-free local
//! name. All synthesized top-level names go through one `NameTable`, so the
//! runtime helper imports added later can never collide with a hoisted step.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use crate::directive::{FunctionHost, FunctionKind, ModuleScan, TaggedFunction};
use crate::parse::SourceText;
use crate::scope::ClosureVariable;
use crate::validate::{Diagnostic, ERR_DUPLICATE_ID, ERR_HYGIENE_EXHAUSTED};

pub const DEFAULT_EXPORT_BASE: &str = "__default";

/// `"<kind>//<module path>//<name>"`.
pub fn format_name(prefix: &str, module_path: &str, identifier: impl Display) -> String {
    format!("{prefix}//{module_path}//{identifier}")
}

/// The module specifier wins over the file path when one is configured.
pub fn module_path(module_specifier: Option<&str>, file_path: &str) -> String {
    match module_specifier {
        Some(specifier) if !specifier.is_empty() => specifier.to_string(),
        _ => file_path.to_string(),
    }
}

/// First free name among `base`, `base$1`, `base$2`, ...; `None` only when
/// every suffix is taken.
fn first_free(base: &str, taken: &HashSet<String>) -> Option<String> {
    if !taken.contains(base) {
        return Some(base.to_string());
    }
    (1..=u32::MAX)
        .map(|n| format!("{}${}", base, n))
        .find(|candidate| !taken.contains(candidate))
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESERVATION TABLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Names already bound (or referenced) anywhere in the module, plus every
/// name handed out so far.
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    taken: HashSet<String>,
}

impl NameTable {
    pub fn new<I, S>(used: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            taken: used.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.taken.contains(name)
    }

    /// Reserves the first free variant of `base`. The result is taken
    /// immediately, so no later caller can receive it.
    pub fn reserve(&mut self, base: &str) -> Option<String> {
        let name = first_free(base, &self.taken)?;
        self.taken.insert(name.clone());
        Some(name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIER RECORD
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierRecord {
    pub kind: FunctionKind,
    pub qualified_id: String,
    /// Top-level binding the implementation lives under after the rewrite.
    pub local_name: String,
    /// `/`-joined nesting path, the manifest key for steps.
    pub qualified_name: String,
    /// Names this function is exported under (`default` for default exports).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub export_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub closure_vars: Vec<ClosureVariable>,
}

struct Segment {
    /// Manifest / ID path segment.
    qualified: String,
    /// Base for the hoisted local name.
    local_base: String,
}

fn segment_for(function: &TaggedFunction, anonymous: &mut HashMap<FunctionKind, u32>) -> Segment {
    if function.default_export {
        return Segment {
            qualified: DEFAULT_EXPORT_BASE.to_string(),
            local_base: DEFAULT_EXPORT_BASE.to_string(),
        };
    }

    if let FunctionHost::ClassMethod {
        class_name: Some(class_name),
        key: Some(key),
        is_static,
    } = &function.host
    {
        let separator = if *is_static { "." } else { "#" };
        return Segment {
            qualified: format!("{}{}{}", class_name, separator, key),
            local_base: format!("{}${}", class_name, key),
        };
    }

    match &function.name {
        Some(name) => Segment {
            qualified: name.clone(),
            local_base: name.clone(),
        },
        None => {
            let counter = anonymous.entry(function.kind).or_insert(0);
            let name = format!("{}{}", function.kind.anonymous_base(), counter);
            *counter += 1;
            Segment {
                qualified: name.clone(),
                local_base: name,
            }
        }
    }
}

/// Produces one record per tagged function, in discovery order.
pub fn allocate_identifiers(
    scan: &ModuleScan,
    module_path: &str,
    names: &mut NameTable,
    source: &SourceText,
) -> Result<Vec<IdentifierRecord>, Vec<Diagnostic>> {
    let mut records: Vec<IdentifierRecord> = Vec::with_capacity(scan.functions.len());
    let mut anonymous: HashMap<FunctionKind, u32> = HashMap::new();
    let mut segments: HashMap<Option<usize>, HashSet<String>> = HashMap::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut diagnostics = Vec::new();

    // In-place names occupy the root level before anything is suffixed.
    for function in scan.functions.iter().filter(|f| f.in_place && !f.default_export) {
        if let Some(name) = &function.name {
            segments.entry(None).or_default().insert(name.clone());
        }
    }

    for function in &scan.functions {
        let segment = segment_for(function, &mut anonymous);
        let parent = function.parent.map(|p| &records[p]);

        let local_name = if function.in_place && !function.default_export {
            segment.local_base.clone()
        } else {
            let base = match parent {
                Some(parent) => format!("{}${}", parent.local_name, segment.local_base),
                None => segment.local_base.clone(),
            };
            match names.reserve(&base) {
                Some(name) => name,
                None => {
                    diagnostics.push(source.error(
                        ERR_HYGIENE_EXHAUSTED,
                        &format!("No free local name derived from \"{}\"", base),
                        function.function_span.start,
                    ));
                    return Err(diagnostics);
                }
            }
        };

        let qualified_segment = if function.default_export {
            local_name.clone()
        } else if function.in_place {
            segment.qualified
        } else {
            let siblings = segments.entry(function.parent).or_default();
            let Some(unique) = first_free(&segment.qualified, siblings) else {
                diagnostics.push(source.error(
                    ERR_HYGIENE_EXHAUSTED,
                    &format!("No free name derived from \"{}\"", segment.qualified),
                    function.function_span.start,
                ));
                return Err(diagnostics);
            };
            siblings.insert(unique.clone());
            unique
        };

        let qualified_name = match parent {
            Some(parent) => format!("{}/{}", parent.qualified_name, qualified_segment),
            None => qualified_segment,
        };
        let qualified_id = format_name(function.kind.prefix(), module_path, &qualified_name);

        if !seen_ids.insert(qualified_id.clone()) {
            diagnostics.push(source.error(
                ERR_DUPLICATE_ID,
                &format!("Qualified ID \"{}\" is assigned twice", qualified_id),
                function.function_span.start,
            ));
        }

        let mut export_names = Vec::new();
        if function.default_export {
            export_names.push("default".to_string());
        } else if function.in_place {
            if let Some(exported) = function.name.as_ref().and_then(|n| scan.exports.get(n)) {
                export_names.extend(exported.iter().cloned());
            }
        }

        records.push(IdentifierRecord {
            kind: function.kind,
            qualified_id,
            local_name,
            qualified_name,
            export_names,
            closure_vars: Vec::new(),
        });
    }

    if diagnostics.is_empty() {
        tracing::debug!("allocated {} identifiers for {}", records.len(), module_path);
        Ok(records)
    } else {
        Err(diagnostics)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
