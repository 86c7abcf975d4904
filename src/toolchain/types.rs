use crate::config::{Language, Platform};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("no available {language} toolchain on {platform}")]
    NotFound {
        language: Language,
        platform: Platform,
    },
    #[error("toolchain '{name}' cannot build {language} on {platform}")]
    UnknownToolchain {
        name: String,
        language: Language,
        platform: Platform,
    },
}

/// Resolved executables of one toolchain. Missing tools stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub compiler: Option<PathBuf>,
    pub linker: Option<PathBuf>,
    pub archiver: Option<PathBuf>,
    pub resource_compiler: Option<PathBuf>,
}

impl ToolPaths {
    /// Every recorded path still exists on disk.
    pub fn still_exist(&self) -> bool {
        [
            &self.compiler,
            &self.linker,
            &self.archiver,
            &self.resource_compiler,
        ]
        .into_iter()
        .flatten()
        .all(|p| p.exists())
    }
}

/// Where a precompiled header is built from and what it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledHeader {
    pub header: PathBuf,
    /// File handed to the compiler: the header itself, or a dedicated translation unit.
    pub input: PathBuf,
    /// The compiled header image.
    pub output: PathBuf,
    /// Object that must be linked in (MSVC `/Yc` produces one).
    pub link_object: Option<PathBuf>,
}
