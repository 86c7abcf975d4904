//! On-disk build manifests (`<output>.manifest`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Bumped whenever the layout changes; other versions read as unreadable.
pub const MANIFEST_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("manifest format {found} is not supported (expected {MANIFEST_FORMAT})")]
    UnsupportedFormat { found: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub format: u32,
    /// Identifies the toolchain + configuration the output was built with.
    pub config_hash: String,
    pub hash: u64,
    pub dependencies: BTreeMap<String, u64>,
}

impl BuildManifest {
    pub fn new(config_hash: impl Into<String>, hash: u64) -> Self {
        Self {
            format: MANIFEST_FORMAT,
            config_hash: config_hash.into(),
            hash,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)?;
        let manifest: BuildManifest = serde_json::from_str(&content)?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(ManifestError::UnsupportedFormat {
                found: manifest.format,
            });
        }
        Ok(manifest)
    }

    pub fn store(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
