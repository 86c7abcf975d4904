//! Project configuration (`kiln.toml`).
//!
//! The raw TOML sections deserialize into [`KilnConfig`]. The builder never reads
//! those directly; it works on a [`ResolvedProject`], the read-only record for one
//! configuration + platform pair produced by [`KilnConfig::resolve`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

pub const CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse kiln.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown configuration '{0}' (define it under [configurations.{0}])")]
    UnknownConfiguration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    #[default]
    Executable,
    Console,
    StaticLib,
    SharedLib,
    /// A container that only groups member projects.
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    #[default]
    Cpp,
    #[serde(rename = "csharp")]
    CSharp,
}

impl Language {
    /// Extensions picked up when a source entry is a directory.
    pub fn source_extensions(&self) -> &'static [&'static str] {
        match self {
            Language::C => &["c"],
            Language::Cpp => &["cpp", "cc", "cxx", "c"],
            Language::CSharp => &["cs"],
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::C => write!(f, "C"),
            Language::Cpp => write!(f, "C++"),
            Language::CSharp => write!(f, "C#"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    #[serde(rename = "macos")]
    MacOs,
    Windows,
}

impl Platform {
    /// Platform of the running host.
    pub fn host() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "macos" | "ios" => Platform::MacOs,
            _ => Platform::Linux,
        }
    }

    pub fn executable_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::MacOs => write!(f, "macos"),
            Platform::Windows => write!(f, "windows"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PchConfig {
    pub header: PathBuf,
    /// Translation unit that instantiates the header (MSVC-style toolchains).
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionInfo {
    pub product: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceleratorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_accelerator_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_accelerator_program(),
            args: Vec::new(),
            min_batch: default_min_batch(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct KilnConfig {
    pub project: ProjectSection,
    #[serde(default)]
    pub scripts: ScriptsSection,
    #[serde(default)]
    pub configurations: BTreeMap<String, ConfigurationSection>,
    pub accelerator: Option<AcceleratorConfig>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ProjectSection {
    pub name: String,
    #[serde(default)]
    pub output: OutputType,
    #[serde(default)]
    pub language: Language,
    pub standard: Option<String>,
    #[serde(default = "default_sources")]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub includes: Vec<PathBuf>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub link_flags: Vec<String>,
    #[serde(default)]
    pub lib_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub libs: Vec<String>,
    pub toolset: Option<String>,
    #[serde(default)]
    pub members: Vec<PathBuf>,
    pub intermediate_dir: Option<PathBuf>,
    pub pch: Option<PchConfig>,
    pub version_info: Option<VersionInfo>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ScriptsSection {
    #[serde(default)]
    pub pre_build: Vec<String>,
    #[serde(default)]
    pub pre_link: Vec<String>,
    #[serde(default)]
    pub post_build: Vec<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ConfigurationSection {
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub link_flags: Vec<String>,
    pub optimize: Option<bool>,
    pub debug_info: Option<bool>,
}

fn default_sources() -> Vec<PathBuf> {
    vec![PathBuf::from("src")]
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_accelerator_program() -> String {
    "sh".to_string()
}

fn default_min_batch() -> usize {
    2
}

/// One project, one configuration, one platform. Paths are absolute.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub name: String,
    pub root: PathBuf,
    pub configuration: String,
    pub platform: Platform,
    pub output_type: OutputType,
    pub language: Language,
    pub standard: Option<String>,
    pub sources: Vec<PathBuf>,
    pub includes: Vec<PathBuf>,
    pub defines: Vec<String>,
    pub flags: Vec<String>,
    pub link_flags: Vec<String>,
    pub lib_dirs: Vec<PathBuf>,
    pub libs: Vec<String>,
    pub optimize: bool,
    pub debug_info: bool,
    pub pch: Option<PchConfig>,
    pub version_info: Option<VersionInfo>,
    pub pre_build: Vec<String>,
    pub pre_link: Vec<String>,
    pub post_build: Vec<String>,
    pub toolset: Option<String>,
    pub members: Vec<PathBuf>,
    /// Objects, manifests and generated files.
    pub intermediate_dir: PathBuf,
    /// Final link/archive output.
    pub output_dir: PathBuf,
    pub accelerator: AcceleratorConfig,
}

impl KilnConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Flattens the project section and the named configuration into a
    /// [`ResolvedProject`] rooted at `root`.
    pub fn resolve(
        &self,
        root: &Path,
        configuration: &str,
        platform: Platform,
    ) -> Result<ResolvedProject, ConfigError> {
        let section = match self.configurations.get(configuration) {
            Some(section) => section.clone(),
            None => builtin_configuration(configuration)
                .ok_or_else(|| ConfigError::UnknownConfiguration(configuration.to_string()))?,
        };
        let project = &self.project;
        let optimize = section.optimize.unwrap_or(configuration == "release");
        let debug_info = section.debug_info.unwrap_or(!optimize);

        let pch = project.pch.as_ref().map(|pch| PchConfig {
            header: root.join(&pch.header),
            source: pch.source.as_ref().map(|s| root.join(s)),
        });
        let pch_source = pch.as_ref().and_then(|p| p.source.clone());

        let sources = if project.output == OutputType::Aggregate {
            Vec::new()
        } else {
            collect_sources(root, &project.sources, project.language)
                .into_iter()
                .filter(|s| Some(s) != pch_source.as_ref())
                .collect()
        };

        let build_root = root.join(
            project
                .intermediate_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("build")),
        );
        let output_dir = build_root.join(configuration);

        Ok(ResolvedProject {
            name: project.name.clone(),
            root: root.to_path_buf(),
            configuration: configuration.to_string(),
            platform,
            output_type: project.output,
            language: project.language,
            standard: project.standard.clone(),
            sources,
            includes: project.includes.iter().map(|p| root.join(p)).collect(),
            defines: project
                .defines
                .iter()
                .chain(&section.defines)
                .cloned()
                .collect(),
            flags: project.flags.iter().chain(&section.flags).cloned().collect(),
            link_flags: project
                .link_flags
                .iter()
                .chain(&section.link_flags)
                .cloned()
                .collect(),
            lib_dirs: project.lib_dirs.iter().map(|p| root.join(p)).collect(),
            libs: project.libs.clone(),
            optimize,
            debug_info,
            pch,
            version_info: project.version_info.clone(),
            pre_build: self.scripts.pre_build.clone(),
            pre_link: self.scripts.pre_link.clone(),
            post_build: self.scripts.post_build.clone(),
            toolset: project.toolset.clone(),
            members: project.members.iter().map(|p| root.join(p)).collect(),
            intermediate_dir: output_dir.join("obj"),
            output_dir,
            accelerator: self.accelerator.clone().unwrap_or_default(),
        })
    }
}

fn builtin_configuration(name: &str) -> Option<ConfigurationSection> {
    match name {
        "debug" => Some(ConfigurationSection {
            defines: vec!["DEBUG".to_string()],
            optimize: Some(false),
            debug_info: Some(true),
            ..Default::default()
        }),
        "release" => Some(ConfigurationSection {
            defines: vec!["NDEBUG".to_string()],
            optimize: Some(true),
            debug_info: Some(false),
            ..Default::default()
        }),
        _ => None,
    }
}

/// Expands directory entries into the files they contain, sorted for stable builds.
fn collect_sources(root: &Path, entries: &[PathBuf], language: Language) -> Vec<PathBuf> {
    let extensions = language.source_extensions();
    let mut sources = Vec::new();
    for entry in entries {
        let path = root.join(entry);
        if path.is_dir() {
            for file in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
                let file = file.path();
                if file.is_file()
                    && file
                        .extension()
                        .is_some_and(|ext| extensions.contains(&ext.to_string_lossy().as_ref()))
                {
                    sources.push(file.to_path_buf());
                }
            }
        } else if path.is_file() {
            sources.push(path);
        } else {
            warn!(path = %path.display(), "source entry does not exist");
        }
    }
    sources.sort();
    sources.dedup();
    sources
}
