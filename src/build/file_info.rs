//! Per-file build state and staleness decisions.
//!
//! A file's change-hash is xxh3 over its path and modification time. That is a cheap
//! proxy: a touch without edits still counts as a change, and a copy that preserves
//! timestamps does not.

use super::manifest::{BuildManifest, ManifestError};
use crate::toolchain::parser::{Diagnostic, Severity};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::trace;
use xxhash_rust::xxh3::Xxh3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderDependencyInfo {
    pub path: PathBuf,
    pub hash: u64,
}

/// Why a file has to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    MissingOutput,
    MissingManifest,
    UnreadableManifest,
    ConfigurationChanged,
    SourceChanged,
    InputsChanged,
    DependencyMissing(PathBuf),
    DependencyChanged(PathBuf),
    Forced,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::MissingOutput => write!(f, "output is missing"),
            StaleReason::MissingManifest => write!(f, "no manifest"),
            StaleReason::UnreadableManifest => write!(f, "manifest is unreadable"),
            StaleReason::ConfigurationChanged => write!(f, "configuration changed"),
            StaleReason::SourceChanged => write!(f, "source changed"),
            StaleReason::InputsChanged => write!(f, "input set changed"),
            StaleReason::DependencyMissing(p) => write!(f, "{} is gone", p.display()),
            StaleReason::DependencyChanged(p) => write!(f, "{} changed", p.display()),
            StaleReason::Forced => write!(f, "precompiled header is rebuilt"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    pub messages: Vec<Diagnostic>,
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

impl DiagnosticLog {
    pub fn record(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Info => self.infos += 1,
        }
        self.messages.push(diagnostic);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
pub struct BuilderFileInfo {
    pub source: PathBuf,
    pub output: PathBuf,
    pub manifest: PathBuf,
    pub hash: u64,
    pub config_hash: String,
    pub out_of_date: bool,
    pub stale_reason: Option<StaleReason>,
    /// Dependencies recorded by the last successful build, replaced after the next one.
    pub dependencies: Vec<BuilderDependencyInfo>,
    /// Paths reported by the tool during the current run.
    pub discovered: Vec<PathBuf>,
    pub diagnostics: DiagnosticLog,
    /// Tool output with dependency chatter removed, ready to echo.
    pub clean_output: String,
}

impl BuilderFileInfo {
    pub fn new(source: PathBuf, output: PathBuf, config_hash: impl Into<String>) -> Self {
        let manifest = manifest_path_for(&output);
        let hash = calculate_file_hash(&source).unwrap_or(0);
        Self {
            source,
            output,
            manifest,
            hash,
            config_hash: config_hash.into(),
            out_of_date: true,
            stale_reason: None,
            dependencies: Vec::new(),
            discovered: Vec::new(),
            diagnostics: DiagnosticLog::default(),
            clean_output: String::new(),
        }
    }

    pub fn load_manifest(&self) -> Result<BuildManifest, ManifestError> {
        BuildManifest::load(&self.manifest)
    }

    pub fn store_manifest(&self) -> Result<(), ManifestError> {
        let mut manifest = BuildManifest::new(self.config_hash.clone(), self.hash);
        for dependency in &self.dependencies {
            manifest
                .dependencies
                .insert(dependency.path.to_string_lossy().into_owned(), dependency.hash);
        }
        manifest.store(&self.manifest)
    }

    /// Re-hashes the source and re-evaluates staleness against the stored manifest.
    /// The recorded dependency list is loaded from the manifest when it is readable.
    pub fn refresh(&mut self) -> bool {
        self.hash = calculate_file_hash(&self.source).unwrap_or(0);
        let manifest = self.load_manifest();
        self.stale_reason = evaluate(self, manifest.as_ref().ok(), manifest.is_err());
        if let Ok(manifest) = manifest {
            self.dependencies = manifest
                .dependencies
                .into_iter()
                .map(|(path, hash)| BuilderDependencyInfo {
                    path: PathBuf::from(path),
                    hash,
                })
                .collect();
        }
        self.out_of_date = self.stale_reason.is_some();
        trace!(
            source = %self.source.display(),
            reason = ?self.stale_reason,
            "staleness evaluated"
        );
        self.out_of_date
    }

    pub fn mark_stale(&mut self, reason: StaleReason) {
        if !self.out_of_date {
            self.out_of_date = true;
            self.stale_reason = Some(reason);
        }
    }

    /// Replaces the dependency set, hashing every path now.
    pub fn set_dependencies<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut seen = BTreeMap::new();
        for path in paths {
            if seen.contains_key(&path) {
                continue;
            }
            let hash = calculate_file_hash(&path).unwrap_or(0);
            seen.insert(path, hash);
        }
        self.dependencies = seen
            .into_iter()
            .map(|(path, hash)| BuilderDependencyInfo { path, hash })
            .collect();
    }

    pub fn dependency_paths(&self) -> impl Iterator<Item = &Path> {
        self.dependencies.iter().map(|d| d.path.as_path())
    }
}

/// xxh3 over the path and its modification time. `None` when the file is missing.
pub fn calculate_file_hash(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Xxh3::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(&nanos.to_le_bytes());
    Some(hasher.digest())
}

/// Reads the manifest from disk and decides whether `info` must be rebuilt.
pub fn check_out_of_date(info: &BuilderFileInfo) -> bool {
    out_of_date_reason(info).is_some()
}

pub fn out_of_date_reason(info: &BuilderFileInfo) -> Option<StaleReason> {
    let manifest = info.load_manifest();
    evaluate(info, manifest.as_ref().ok(), manifest.is_err())
}

fn evaluate(
    info: &BuilderFileInfo,
    manifest: Option<&BuildManifest>,
    manifest_failed: bool,
) -> Option<StaleReason> {
    if !info.output.exists() {
        return Some(StaleReason::MissingOutput);
    }
    if !info.manifest.exists() {
        return Some(StaleReason::MissingManifest);
    }
    let Some(manifest) = manifest.filter(|_| !manifest_failed) else {
        return Some(StaleReason::UnreadableManifest);
    };
    if manifest.config_hash != info.config_hash {
        return Some(StaleReason::ConfigurationChanged);
    }
    if manifest.hash != info.hash {
        return Some(StaleReason::SourceChanged);
    }
    for (path, stored) in &manifest.dependencies {
        let path = Path::new(path);
        match calculate_file_hash(path) {
            None => return Some(StaleReason::DependencyMissing(path.to_path_buf())),
            Some(hash) if hash != *stored => {
                return Some(StaleReason::DependencyChanged(path.to_path_buf()));
            }
            Some(_) => {}
        }
    }
    None
}

/// `<output>.manifest`
pub fn manifest_path_for(output: &Path) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(".manifest");
    PathBuf::from(path)
}

/// Mirrors `source` under `out_dir` (relative to `root`) and appends `.<extension>` to
/// the full file name, so `foo.c` and `foo.cpp` get distinct outputs.
pub fn output_path_for(source: &Path, root: &Path, out_dir: &Path, extension: &str) -> PathBuf {
    let relative = source.strip_prefix(root).unwrap_or(source);
    let mut path = out_dir.to_path_buf();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            path.push(part);
        }
    }
    if path == out_dir {
        path.push("unnamed");
    }
    let mut name = path.into_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Builds a [`BuilderFileInfo`] for every path and evaluates its staleness.
pub fn get_multiple_file_infos(
    paths: &[PathBuf],
    root: &Path,
    out_dir: &Path,
    extension: &str,
    config_hash: &str,
) -> std::io::Result<Vec<BuilderFileInfo>> {
    fs::create_dir_all(out_dir)?;
    paths
        .par_iter()
        .map(|source| {
            let output = output_path_for(source, root, out_dir, extension);
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut info = BuilderFileInfo::new(source.clone(), output, config_hash);
            info.refresh();
            Ok(info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn touch(path: &Path, offset_secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
            .unwrap();
    }

    /// Source + output on disk, manifest written as if the last build succeeded.
    fn built_file(dir: &Path, deps: &[PathBuf]) -> BuilderFileInfo {
        let source = dir.join("main.cpp");
        let output = dir.join("main.o");
        fs::write(&source, "int main() {}").unwrap();
        fs::write(&output, "obj").unwrap();

        let mut info = BuilderFileInfo::new(source, output, "cfg");
        info.set_dependencies(deps.iter().cloned());
        info.store_manifest().unwrap();
        info
    }

    #[test]
    fn test_hash_depends_on_mtime_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.h");
        let b = dir.path().join("b.h");
        fs::write(&a, "x").unwrap();
        fs::write(&b, "x").unwrap();

        let first = calculate_file_hash(&a).unwrap();
        assert_eq!(first, calculate_file_hash(&a).unwrap());
        assert_ne!(first, calculate_file_hash(&b).unwrap());

        touch(&a, 30);
        assert_ne!(first, calculate_file_hash(&a).unwrap());
        assert_eq!(calculate_file_hash(&dir.path().join("missing.h")), None);
    }

    #[test]
    fn test_fresh_manifest_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("util.h");
        fs::write(&header, "").unwrap();
        let mut info = built_file(dir.path(), &[header]);

        assert!(!info.refresh());
        assert_eq!(info.dependencies.len(), 1);
    }

    #[test]
    fn test_missing_manifest_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = built_file(dir.path(), &[]);
        fs::remove_file(&info.manifest).unwrap();

        assert!(info.refresh());
        assert_eq!(info.stale_reason, Some(StaleReason::MissingManifest));
    }

    #[test]
    fn test_missing_output_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let info = built_file(dir.path(), &[]);
        fs::remove_file(&info.output).unwrap();
        assert_eq!(out_of_date_reason(&info), Some(StaleReason::MissingOutput));
    }

    #[test]
    fn test_corrupt_manifest_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = built_file(dir.path(), &[]);
        fs::write(&info.manifest, "garbage").unwrap();

        assert!(info.refresh());
        assert_eq!(info.stale_reason, Some(StaleReason::UnreadableManifest));
    }

    #[test]
    fn test_touched_source_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = built_file(dir.path(), &[]);
        touch(&info.source, 30);

        assert!(info.refresh());
        assert_eq!(info.stale_reason, Some(StaleReason::SourceChanged));
    }

    #[test]
    fn test_touched_dependency_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("util.h");
        fs::write(&header, "").unwrap();
        let mut info = built_file(dir.path(), std::slice::from_ref(&header));
        touch(&header, 30);

        assert!(info.refresh());
        assert_eq!(info.stale_reason, Some(StaleReason::DependencyChanged(header)));
    }

    #[test]
    fn test_removed_dependency_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("gone.h");
        fs::write(&header, "").unwrap();
        let info = built_file(dir.path(), std::slice::from_ref(&header));
        fs::remove_file(&header).unwrap();

        assert!(check_out_of_date(&info));
        assert_eq!(
            out_of_date_reason(&info),
            Some(StaleReason::DependencyMissing(header))
        );
    }

    #[test]
    fn test_configuration_change_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = built_file(dir.path(), &[]);
        info.config_hash = "other".to_string();
        assert!(info.refresh());
        assert_eq!(info.stale_reason, Some(StaleReason::ConfigurationChanged));
    }

    #[test]
    fn test_output_path_mirrors_source_tree() {
        let out = output_path_for(
            Path::new("/proj/src/net/socket.cpp"),
            Path::new("/proj"),
            Path::new("/proj/build/debug/obj"),
            "o",
        );
        assert_eq!(out, PathBuf::from("/proj/build/debug/obj/src/net/socket.cpp.o"));
        assert_eq!(
            manifest_path_for(&out),
            PathBuf::from("/proj/build/debug/obj/src/net/socket.cpp.o.manifest")
        );
    }

    #[test]
    fn test_same_stem_sources_do_not_collide() {
        let root = Path::new("/proj");
        let out_dir = Path::new("/proj/obj");
        let c = output_path_for(Path::new("/proj/src/foo.c"), root, out_dir, "o");
        let cpp = output_path_for(Path::new("/proj/src/foo.cpp"), root, out_dir, "o");
        assert_eq!(c, PathBuf::from("/proj/obj/src/foo.c.o"));
        assert_eq!(cpp, PathBuf::from("/proj/obj/src/foo.cpp.o"));
        assert_ne!(manifest_path_for(&c), manifest_path_for(&cpp));
    }

    #[test]
    fn test_get_multiple_file_infos_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src").join("deep");
        fs::create_dir_all(&src).unwrap();
        let file = src.join("a.c");
        fs::write(&file, "").unwrap();
        let out = dir.path().join("obj");

        let infos = get_multiple_file_infos(&[file], dir.path(), &out, "o", "cfg").unwrap();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].out_of_date);
        assert!(out.join("src").join("deep").is_dir());
        assert_eq!(infos[0].output, out.join("src").join("deep").join("a.c.o"));
    }
}
