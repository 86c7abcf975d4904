//! Executable discovery: PATH search, Visual Studio lookup, and the per-user cache
//! at `~/.kiln/toolchains.toml`.

use super::types::ToolPaths;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use tracing::{debug, warn};

const VSWHERE_PATHS: &[&str] = &[
    r"C:\Program Files (x86)\Microsoft Visual Studio\Installer\vswhere.exe",
    r"C:\Program Files\Microsoft Visual Studio\Installer\vswhere.exe",
];

/// Looks `name` up in every `PATH` entry, also trying the host executable suffix.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    find_in_dirs(name, env::split_paths(&path))
}

fn find_in_dirs(name: &str, dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    let suffix = env::consts::EXE_SUFFIX;
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !suffix.is_empty() && !name.ends_with(suffix) {
            let candidate = dir.join(format!("{name}{suffix}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Candidate executable names per tool role, in preference order.
#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    pub compiler: Vec<&'static str>,
    pub linker: Vec<&'static str>,
    pub archiver: Vec<&'static str>,
    pub resource_compiler: Vec<&'static str>,
    /// Also search the newest Visual Studio installation's MSVC bin directory.
    pub visual_studio: bool,
}

impl ToolLocator {
    pub fn locate(&self) -> ToolPaths {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(path) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&path));
        }
        if self.visual_studio
            && let Some(bin) = msvc_bin_dir()
        {
            debug!(dir = %bin.display(), "found MSVC tools via vswhere");
            dirs.push(bin);
        }

        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| find_in_dirs(name, dirs.iter().cloned()))
        };
        ToolPaths {
            compiler: first(&self.compiler),
            linker: first(&self.linker),
            archiver: first(&self.archiver),
            resource_compiler: first(&self.resource_compiler),
        }
    }
}

fn find_vswhere() -> Option<PathBuf> {
    VSWHERE_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
}

/// `VC\Tools\MSVC\<newest>\bin\Host*\*` of the latest installation with the C++ tools.
fn msvc_bin_dir() -> Option<PathBuf> {
    let vswhere = find_vswhere()?;
    let output = Command::new(vswhere)
        .args([
            "-latest",
            "-products",
            "*",
            "-requires",
            "Microsoft.VisualStudio.Component.VC.Tools.x86.x64",
            "-property",
            "installationPath",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let install = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    let toolset = newest_subdir(&install.join("VC").join("Tools").join("MSVC"))?;

    for host in ["Hostx64", "Hostx86"] {
        for target in ["x64", "x86"] {
            let bin = toolset.join("bin").join(host).join(target);
            if bin.join("cl.exe").exists() {
                return Some(bin);
            }
        }
    }
    None
}

fn newest_subdir(dir: &Path) -> Option<PathBuf> {
    let mut versions: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    versions.sort();
    versions.pop()
}

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version regex is valid"));

/// Runs `tool args...` and returns the first meaningful line of its banner.
pub fn query_banner(tool: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .ok()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    banner_line(&text)
}

fn banner_line(text: &str) -> Option<String> {
    let lines = || {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("Copyright") && !l.starts_with("usage:"))
    };
    lines()
        .find(|l| l.contains("Version") || l.contains("version"))
        .or_else(|| lines().next())
        .map(str::to_string)
}

/// First `major.minor[.patch]` in a banner.
pub fn parse_version(banner: &str) -> Option<Version> {
    let caps = VERSION_RE.captures(banner)?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    Some(Version::new(part(1), part(2), part(3)))
}

/// Detected tool paths keyed by toolchain name and language.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ToolCache {
    #[serde(default)]
    pub toolchains: BTreeMap<String, ToolPaths>,
    #[serde(skip)]
    path: PathBuf,
}

impl ToolCache {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiln")
            .join("toolchains.toml")
    }

    /// Reads the cache; a missing or corrupt file yields an empty cache.
    pub fn load(path: &Path) -> Self {
        let mut cache = fs::read_to_string(path)
            .ok()
            .and_then(|content| match toml::from_str::<ToolCache>(&content) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!(path = %path.display(), "ignoring corrupt tool cache: {e}");
                    None
                }
            })
            .unwrap_or_default();
        cache.path = path.to_path_buf();
        cache
    }

    /// Cached paths for `key`, as long as none of them vanished.
    pub fn get(&self, key: &str) -> Option<&ToolPaths> {
        self.toolchains
            .get(key)
            .filter(|paths| paths.compiler.is_some() && paths.still_exist())
    }

    pub fn insert(&mut self, key: &str, paths: ToolPaths) {
        self.toolchains.insert(key.to_string(), paths);
    }

    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(&self.path, content)
    }
}

pub fn clear_tool_cache(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join(format!("fakecc{}", env::consts::EXE_SUFFIX));
        fs::write(&tool, "").unwrap();

        let found = find_in_dirs("fakecc", vec![PathBuf::from("/nonexistent"), dir.path().into()]);
        assert_eq!(found, Some(tool));
        assert_eq!(find_in_dirs("nothing-here", vec![dir.path().into()]), None);
    }

    #[test]
    fn test_parse_version_from_banners() {
        assert_eq!(
            parse_version("g++ (Ubuntu 13.2.0-4ubuntu3) 13.2.0"),
            Some(Version::new(13, 2, 0))
        );
        assert_eq!(
            parse_version("Microsoft (R) C/C++ Optimizing Compiler Version 19.38.33133 for x64"),
            Some(Version::new(19, 38, 33133))
        );
        assert_eq!(
            parse_version("Mono C# compiler version 6.12"),
            Some(Version::new(6, 12, 0))
        );
        assert_eq!(parse_version("unknown"), None);
    }

    #[test]
    fn test_banner_skips_noise() {
        let text = "\nCopyright (C) Microsoft\nusage: cl [ option... ]\nMicrosoft (R) C/C++ Version 19.1\n";
        assert_eq!(banner_line(text).as_deref(), Some("Microsoft (R) C/C++ Version 19.1"));
        assert_eq!(banner_line("clang version 17.0.6\nTarget: x86_64").as_deref(), Some("clang version 17.0.6"));
    }

    #[test]
    fn test_tool_cache_round_trip_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".kiln").join("toolchains.toml");
        let compiler = dir.path().join("cc");
        fs::write(&compiler, "").unwrap();

        let mut cache = ToolCache::load(&cache_path);
        assert!(cache.toolchains.is_empty());
        cache.insert(
            "gcc-cpp",
            ToolPaths {
                compiler: Some(compiler.clone()),
                ..Default::default()
            },
        );
        cache.save().unwrap();

        let cache = ToolCache::load(&cache_path);
        assert!(cache.get("gcc-cpp").is_some());

        fs::remove_file(&compiler).unwrap();
        assert!(cache.get("gcc-cpp").is_none());

        clear_tool_cache(&cache_path).unwrap();
        clear_tool_cache(&cache_path).unwrap();
        assert!(!cache_path.exists());
    }

    #[test]
    fn test_corrupt_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolchains.toml");
        fs::write(&path, "not = [valid").unwrap();
        assert!(ToolCache::load(&path).toolchains.is_empty());
    }
}
