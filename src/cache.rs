use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::transform::{ModuleOutput, TransformOptions};
use crate::validate::TransformError;

#[derive(Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub output: ModuleOutput,
}

/// Transformed modules on disk, keyed by file and invalidated by a hash over
/// the source text and the options that produced them.
pub struct IncrementalCache {
    cache_dir: PathBuf,
}

impl IncrementalCache {
    pub fn new(cache_dir: impl AsRef<Path>) -> Result<Self, TransformError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).map_err(|source| TransformError::Io {
            path: cache_dir.display().to_string(),
            source,
        })?;
        Ok(Self { cache_dir })
    }

    pub fn compute_hash(source: &str, options: &TransformOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_string(options).unwrap_or_default().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn get_cache_path(&self, file_path: &str) -> PathBuf {
        let safe_name = file_path
            .replace("/", "_")
            .replace("\\", "_")
            .replace(":", "_");
        self.cache_dir.join(format!("{}.json", safe_name))
    }

    pub fn get(&self, file_path: &str, source: &str, options: &TransformOptions) -> Option<ModuleOutput> {
        let cache_path = self.get_cache_path(file_path);
        let data = fs::read_to_string(&cache_path).ok()?;

        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("discarding corrupt cache entry for {}: {}", file_path, e);
                fs::remove_file(cache_path).ok();
                return None;
            }
        };

        if entry.hash == Self::compute_hash(source, options) {
            tracing::debug!("cache hit for {}", file_path);
            Some(entry.output)
        } else {
            None
        }
    }

    pub fn set(&self, file_path: &str, source: &str, options: &TransformOptions, output: &ModuleOutput) {
        let cache_path = self.get_cache_path(file_path);
        let entry = CacheEntry {
            hash: Self::compute_hash(source, options),
            output: output.clone(),
        };

        match serde_json::to_string(&entry) {
            Ok(data) => {
                if let Err(e) = fs::write(&cache_path, data) {
                    tracing::warn!("failed to write cache entry {}: {}", cache_path.display(), e);
                }
            }
            Err(e) => tracing::warn!("failed to serialize cache entry for {}: {}", file_path, e),
        }
    }
}
