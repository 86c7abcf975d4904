//! A [`Toolchain`] assembled from three strategies: an [`ArgumentStyle`] (flag syntax),
//! a [`ToolchainOutputParser`] (diagnostic table) and a [`ToolLocator`] (where the
//! executables live).

use super::Toolchain;
use super::finder::{ToolCache, ToolLocator, parse_version, query_banner};
use super::parser::ToolchainOutputParser;
use super::types::{PrecompiledHeader, ToolPaths};
use crate::build::action::BuildAction;
use crate::build::file_info::BuilderFileInfo;
use crate::config::{Language, OutputType, Platform, ResolvedProject, VersionInfo};
use semver::Version;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How one line of tool output is treated before diagnostic parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass<'l> {
    /// A header the translation unit pulled in.
    Dependency(&'l str),
    /// Chatter that never reaches the console.
    Skip,
    /// Starts a run of bare path lines that are dropped until a normal line shows up.
    SkipBlock,
    Text,
}

/// Flag syntax and tool conventions of one compiler family.
pub trait ArgumentStyle: Send + Sync {
    fn object_extension(&self) -> &'static str;

    fn requires_compile_step(&self) -> bool {
        true
    }

    fn supports_version_info(&self, _platform: Platform) -> bool {
        false
    }

    fn version_args(&self) -> &'static [&'static str] {
        &["--version"]
    }

    /// File name (no directory) of the final artifact.
    fn output_file_name(&self, project: &ResolvedProject) -> String;

    fn precompiled_header(&self, project: &ResolvedProject) -> Option<PrecompiledHeader>;

    fn compile_args(
        &self,
        project: &ResolvedProject,
        source: &Path,
        output: &Path,
        pch: Option<&PrecompiledHeader>,
    ) -> Vec<String>;

    fn pch_args(&self, project: &ResolvedProject, pch: &PrecompiledHeader) -> Vec<String>;

    fn archive_args(&self, inputs: &[PathBuf], output: &Path) -> Vec<String>;

    fn link_args(&self, project: &ResolvedProject, inputs: &[PathBuf], output: &Path)
    -> Vec<String>;

    fn version_info_args(&self, _script: &Path, _output: &Path) -> Vec<String> {
        Vec::new()
    }

    fn version_info_extension(&self) -> &'static str {
        "res"
    }

    fn classify_line<'l>(&self, line: &'l str, source: &Path) -> LineClass<'l>;

    fn is_internal_error(&self, line: &str) -> bool;

    fn system_includes(&self, _paths: &ToolPaths, _language: Language) -> Vec<PathBuf> {
        Vec::new()
    }

    /// The archiver for static libraries; the linker otherwise.
    fn link_tool<'p>(&self, paths: &'p ToolPaths, output: OutputType) -> Option<&'p Path> {
        let tool = if output == OutputType::StaticLib {
            paths.archiver.as_ref()
        } else {
            paths.linker.as_ref().or(paths.compiler.as_ref())
        };
        tool.map(PathBuf::as_path)
    }
}

pub struct ComposedToolchain {
    name: &'static str,
    language: Language,
    style: Box<dyn ArgumentStyle>,
    parser: &'static ToolchainOutputParser,
    locator: ToolLocator,
    cache_path: Option<PathBuf>,
    refresh_cache: bool,
    paths: ToolPaths,
    system_includes: Vec<PathBuf>,
    version: Option<Version>,
    banner: String,
    available: bool,
    root: PathBuf,
    config_hash: String,
}

impl ComposedToolchain {
    pub fn new(
        name: &'static str,
        language: Language,
        style: Box<dyn ArgumentStyle>,
        parser: &'static ToolchainOutputParser,
        locator: ToolLocator,
    ) -> Self {
        Self {
            name,
            language,
            style,
            parser,
            locator,
            cache_path: None,
            refresh_cache: false,
            paths: ToolPaths::default(),
            system_includes: Vec::new(),
            version: None,
            banner: String::new(),
            available: false,
            root: PathBuf::new(),
            config_hash: String::new(),
        }
    }

    /// Reads and records detected paths in the tool cache at `path`.
    pub fn with_cache(mut self, path: PathBuf, refresh: bool) -> Self {
        self.cache_path = Some(path);
        self.refresh_cache = refresh;
        self
    }

    /// Skips discovery and uses these paths as-is.
    pub fn with_paths(mut self, paths: ToolPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn cache_key(&self) -> String {
        format!("{}-{}", self.name, language_key(self.language))
    }

    fn discover(&mut self) -> ToolPaths {
        let Some(cache_path) = self.cache_path.clone() else {
            return self.locator.locate();
        };
        let mut cache = ToolCache::load(&cache_path);
        let key = self.cache_key();
        if !self.refresh_cache
            && let Some(paths) = cache.get(&key)
        {
            debug!(toolchain = %key, "using cached tool paths");
            return paths.clone();
        }
        let paths = self.locator.locate();
        if paths.compiler.is_some() {
            cache.insert(&key, paths.clone());
            if let Err(e) = cache.save() {
                warn!("could not write tool cache {}: {e}", cache_path.display());
            }
        }
        paths
    }

    fn is_system_header(&self, path: &Path) -> bool {
        self.system_includes.iter().any(|dir| path.starts_with(dir))
    }

    fn compiler(&self) -> PathBuf {
        self.paths.compiler.clone().unwrap_or_default()
    }
}

fn language_key(language: Language) -> &'static str {
    match language {
        Language::C => "c",
        Language::Cpp => "cpp",
        Language::CSharp => "csharp",
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl Toolchain for ComposedToolchain {
    fn name(&self) -> &str {
        self.name
    }

    fn init(&mut self) -> bool {
        if self.paths.compiler.is_none() {
            self.paths = self.discover();
        }
        let Some(compiler) = self.paths.compiler.clone() else {
            self.available = false;
            self.banner = format!("{} (not found)", self.name);
            return false;
        };

        let banner = query_banner(&compiler, self.style.version_args()).unwrap_or_default();
        self.version = parse_version(&banner);
        self.system_includes = self.style.system_includes(&self.paths, self.language);
        self.available = true;
        self.banner = match &self.version {
            Some(version) => format!("{} {version}", self.name),
            None => self.name.to_string(),
        };
        debug!(
            toolchain = self.name,
            compiler = %compiler.display(),
            system_includes = self.system_includes.len(),
            "toolchain initialised"
        );
        true
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn description(&self) -> String {
        self.banner.clone()
    }

    fn configure(&mut self, project: &ResolvedProject) {
        self.root = project.root.clone();

        let mut hasher = Sha256::new();
        let mut feed = |part: &str| {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        };
        feed(self.name);
        feed(&format!("{:?}", self.paths));
        feed(&self.version.as_ref().map(|v| v.to_string()).unwrap_or_default());
        feed(&format!("{:?}", project.output_type));
        feed(project.standard.as_deref().unwrap_or(""));
        feed(&format!("opt={} dbg={}", project.optimize, project.debug_info));
        for define in &project.defines {
            feed(define);
        }
        for flag in project.flags.iter().chain(&project.link_flags) {
            feed(flag);
        }
        for include in &project.includes {
            feed(&include.to_string_lossy());
        }
        for lib in &project.libs {
            feed(lib);
        }
        self.config_hash = format!("{:x}", hasher.finalize());
    }

    fn configuration_hash(&self) -> &str {
        &self.config_hash
    }

    fn object_extension(&self) -> &str {
        self.style.object_extension()
    }

    fn output_file_name(&self, project: &ResolvedProject) -> PathBuf {
        project.output_dir.join(self.style.output_file_name(project))
    }

    fn requires_compile_step(&self) -> bool {
        self.style.requires_compile_step()
    }

    fn requires_version_info(&self, project: &ResolvedProject) -> bool {
        project.version_info.is_some()
            && self.paths.resource_compiler.is_some()
            && self.style.supports_version_info(project.platform)
    }

    fn version_info_script(&self, project: &ResolvedProject) -> PathBuf {
        project.intermediate_dir.join(format!("{}.rc", project.name))
    }

    fn version_info_output(&self, project: &ResolvedProject) -> PathBuf {
        self.version_info_script(project)
            .with_extension(self.style.version_info_extension())
    }

    fn precompiled_header(&self, project: &ResolvedProject) -> Option<PrecompiledHeader> {
        self.style.precompiled_header(project)
    }

    fn compile_action(
        &self,
        project: &ResolvedProject,
        file: &BuilderFileInfo,
        pch: Option<&PrecompiledHeader>,
    ) -> BuildAction {
        BuildAction::new(
            self.compiler(),
            self.style
                .compile_args(project, &file.source, &file.output, pch),
            &project.root,
            format!("Compiling {}", file_label(&file.source)),
        )
    }

    fn compile_pch_action(
        &self,
        project: &ResolvedProject,
        pch: &PrecompiledHeader,
    ) -> BuildAction {
        BuildAction::new(
            self.compiler(),
            self.style.pch_args(project, pch),
            &project.root,
            format!("Precompiling {}", file_label(&pch.header)),
        )
    }

    fn archive_action(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> BuildAction {
        let tool = self
            .style
            .link_tool(&self.paths, OutputType::StaticLib)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let args = if self.style.requires_compile_step() {
            self.style.archive_args(inputs, output)
        } else {
            self.style.link_args(project, inputs, output)
        };
        BuildAction::new(
            tool,
            args,
            &project.root,
            format!("Archiving {}", file_label(output)),
        )
    }

    fn link_action(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> BuildAction {
        let tool = self
            .style
            .link_tool(&self.paths, project.output_type)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        BuildAction::new(
            tool,
            self.style.link_args(project, inputs, output),
            &project.root,
            format!("Linking {}", file_label(output)),
        )
    }

    fn compile_version_info_action(
        &self,
        project: &ResolvedProject,
        script: &Path,
        output: &Path,
    ) -> Option<BuildAction> {
        let tool = self.paths.resource_compiler.clone()?;
        Some(BuildAction::new(
            tool,
            self.style.version_info_args(script, output),
            &project.root,
            format!("Compiling {}", file_label(script)),
        ))
    }

    fn parse_output(&self, info: &mut BuilderFileInfo, raw: &str) -> bool {
        info.diagnostics.clear();
        info.discovered.clear();

        let mut clean = String::new();
        let mut healthy = true;
        let mut skipping = false;
        for line in raw.lines() {
            if skipping {
                if !line.contains(": ") {
                    continue;
                }
                skipping = false;
            }
            match self.style.classify_line(line, &info.source) {
                LineClass::Dependency(path) => {
                    let path = self.root.join(path.trim());
                    if !self.is_system_header(&path) {
                        info.discovered.push(path);
                    }
                    continue;
                }
                LineClass::Skip => continue,
                LineClass::SkipBlock => {
                    skipping = true;
                    continue;
                }
                LineClass::Text => {}
            }
            if self.style.is_internal_error(line) {
                healthy = false;
            }
            if let Some(diagnostic) = self.parser.parse_line(line) {
                info.diagnostics.record(diagnostic);
            }
            clean.push_str(line);
            clean.push('\n');
        }
        info.clean_output = clean;
        healthy
    }
}

/// Windows `VERSIONINFO` resource script for `info`.
pub fn render_version_rc(project: &ResolvedProject, info: &VersionInfo) -> String {
    let version = Version::parse(&info.version).unwrap_or_else(|_| {
        parse_version(&info.version).unwrap_or_else(|| Version::new(0, 0, 0))
    });
    let numeric = format!("{},{},{},0", version.major, version.minor, version.patch);
    let dotted = format!("{}.{}.{}.0", version.major, version.minor, version.patch);
    let file_type = match project.output_type {
        OutputType::SharedLib => "0x2L",
        OutputType::StaticLib => "0x7L",
        _ => "0x1L",
    };
    let mut strings = vec![
        ("ProductName", info.product.clone()),
        ("ProductVersion", dotted.clone()),
        ("FileVersion", dotted),
        ("InternalName", project.name.clone()),
    ];
    if let Some(company) = &info.company {
        strings.push(("CompanyName", company.clone()));
    }
    strings.push((
        "FileDescription",
        info.description.clone().unwrap_or_else(|| info.product.clone()),
    ));

    let mut rc = String::new();
    rc.push_str("#include <winver.h>\n\n");
    rc.push_str("VS_VERSION_INFO VERSIONINFO\n");
    rc.push_str(&format!(" FILEVERSION {numeric}\n PRODUCTVERSION {numeric}\n"));
    rc.push_str(" FILEFLAGSMASK 0x3fL\n FILEOS 0x40004L\n");
    rc.push_str(&format!(" FILETYPE {file_type}\n FILESUBTYPE 0x0L\n"));
    rc.push_str("BEGIN\n  BLOCK \"StringFileInfo\"\n  BEGIN\n    BLOCK \"040904b0\"\n    BEGIN\n");
    for (key, value) in strings {
        rc.push_str(&format!(
            "      VALUE \"{key}\", \"{}\"\n",
            value.replace('"', "\"\"")
        ));
    }
    rc.push_str("    END\n  END\n");
    rc.push_str("  BLOCK \"VarFileInfo\"\n  BEGIN\n    VALUE \"Translation\", 0x409, 1200\n  END\n");
    rc.push_str("END\n");
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KilnConfig;
    use crate::toolchain::gcc::{GccFlavor, GccStyle};
    use crate::toolchain::parser::GCC_PATTERNS;

    fn project(toml: &str) -> ResolvedProject {
        KilnConfig::parse(toml)
            .unwrap()
            .resolve(Path::new("/proj"), "debug", Platform::Linux)
            .unwrap()
    }

    fn gcc() -> ComposedToolchain {
        ComposedToolchain::new(
            "gcc",
            Language::Cpp,
            Box::new(GccStyle::new(GccFlavor::Gnu)),
            &GCC_PATTERNS,
            ToolLocator::default(),
        )
        .with_paths(ToolPaths {
            compiler: Some(PathBuf::from("/usr/bin/g++")),
            archiver: Some(PathBuf::from("/usr/bin/ar")),
            ..Default::default()
        })
    }

    #[test]
    fn test_configuration_hash_tracks_flags() {
        let mut toolchain = gcc();
        toolchain.configure(&project("[project]\nname = \"a\"\n"));
        let first = toolchain.configuration_hash().to_string();
        assert_eq!(first.len(), 64);

        toolchain.configure(&project("[project]\nname = \"a\"\n"));
        assert_eq!(toolchain.configuration_hash(), first);

        toolchain.configure(&project("[project]\nname = \"a\"\ndefines = [\"X\"]\n"));
        assert_ne!(toolchain.configuration_hash(), first);
    }

    #[test]
    fn test_parse_output_extracts_headers_and_counts() {
        let mut toolchain = gcc();
        toolchain.system_includes = vec![PathBuf::from("/usr/include")];
        toolchain.configure(&project("[project]\nname = \"a\"\n"));

        let mut info = BuilderFileInfo::new(
            PathBuf::from("/proj/src/main.cpp"),
            PathBuf::from("/proj/build/debug/obj/src/main.o"),
            "h",
        );
        let raw = "\
. src/util.h
.. /usr/include/stdio.h
src/main.cpp:3:1: warning: unused variable 'x'
src/main.cpp:9:5: error: 'foo' was not declared in this scope
Multiple include guards may be useful for:
/usr/include/wchar.h
src/util.h
";
        assert!(toolchain.parse_output(&mut info, raw));
        assert_eq!(info.discovered, vec![PathBuf::from("/proj/src/util.h")]);
        assert_eq!(info.diagnostics.errors, 1);
        assert_eq!(info.diagnostics.warnings, 1);
        assert!(!info.clean_output.contains("util.h"));
        assert_eq!(info.clean_output.lines().count(), 2);
    }

    #[test]
    fn test_parse_output_drops_pch_markers() {
        let mut toolchain = gcc();
        toolchain.configure(&project("[project]\nname = \"a\"\n"));
        let mut info = BuilderFileInfo::new(
            PathBuf::from("/proj/src/main.cpp"),
            PathBuf::from("/proj/build/debug/obj/src/main.cpp.o"),
            "h",
        );
        let raw = "\
! /proj/build/debug/obj/pch/pch.h.gch
x /proj/build/debug/obj/pch/old.h.gch
. src/util.h
src/main.cpp:3:1: warning: unused variable 'x'
";
        assert!(toolchain.parse_output(&mut info, raw));
        assert_eq!(info.discovered, vec![PathBuf::from("/proj/src/util.h")]);
        assert!(!info.clean_output.contains(".gch"));
        assert_eq!(info.clean_output.lines().count(), 1);
    }

    #[test]
    fn test_internal_compiler_error_is_reported() {
        let toolchain = gcc();
        let mut info = BuilderFileInfo::new(PathBuf::from("/a.c"), PathBuf::from("/a.o"), "h");
        let raw = "a.c: In function 'f':\na.c:2:1: internal compiler error: Segmentation fault\n";
        assert!(!toolchain.parse_output(&mut info, raw));
    }

    #[test]
    fn test_actions_use_resolved_tools() {
        let mut toolchain = gcc();
        let project = project("[project]\nname = \"app\"\noutput = \"static-lib\"\n");
        toolchain.configure(&project);

        let output = toolchain.output_file_name(&project);
        assert_eq!(output, PathBuf::from("/proj/build/debug/libapp.a"));

        let action = toolchain.archive_action(&project, &[PathBuf::from("a.o")], &output);
        assert_eq!(action.tool, PathBuf::from("/usr/bin/ar"));
        assert_eq!(action.status, "Archiving libapp.a");
    }

    #[test]
    fn test_render_version_rc() {
        let project = project(
            "[project]\nname = \"app\"\n[project.version_info]\nproduct = \"App \\\"X\\\"\"\nversion = \"1.2.3\"\n",
        );
        let rc = render_version_rc(&project, project.version_info.as_ref().unwrap());
        assert!(rc.contains("FILEVERSION 1,2,3,0"));
        assert!(rc.contains("VALUE \"ProductName\", \"App \"\"X\"\"\""));
        assert!(rc.contains("VALUE \"FileDescription\", \"App \"\"X\"\"\""));
    }
}
