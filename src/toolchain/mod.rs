//! Toolchain abstraction.
//!
//! A [`Toolchain`] turns files into [`BuildAction`]s and reads the tool output back
//! into diagnostics and dependency paths. It never runs anything itself. Concrete
//! toolchains are [`ComposedToolchain`]s registered per `(language, platform)` in the
//! [`ToolchainRegistry`].

pub mod composed;
pub mod csharp;
pub mod finder;
pub mod gcc;
pub mod msvc;
pub mod parser;
pub mod registry;
pub mod types;

pub use composed::{ArgumentStyle, ComposedToolchain, LineClass, render_version_rc};
pub use registry::ToolchainRegistry;
pub use types::{PrecompiledHeader, ToolPaths, ToolchainError};

use crate::build::action::BuildAction;
use crate::build::file_info::BuilderFileInfo;
use crate::build::manifest::ManifestError;
use crate::config::ResolvedProject;
use std::path::{Path, PathBuf};

pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;

    /// Locates executables and standard search paths. Returns availability.
    fn init(&mut self) -> bool;

    fn is_available(&self) -> bool;

    /// Name and version, e.g. `gcc 13.2.0`.
    fn description(&self) -> String;

    /// Binds a project configuration and recomputes the configuration hash.
    fn configure(&mut self, project: &ResolvedProject);

    fn configuration_hash(&self) -> &str;

    fn object_extension(&self) -> &str;

    /// Full path of the final artifact.
    fn output_file_name(&self, project: &ResolvedProject) -> PathBuf;

    /// `false` when sources go straight to the link step.
    fn requires_compile_step(&self) -> bool;

    fn requires_version_info(&self, project: &ResolvedProject) -> bool;

    fn version_info_script(&self, project: &ResolvedProject) -> PathBuf;

    fn version_info_output(&self, project: &ResolvedProject) -> PathBuf;

    fn precompiled_header(&self, project: &ResolvedProject) -> Option<PrecompiledHeader>;

    fn compile_action(
        &self,
        project: &ResolvedProject,
        file: &BuilderFileInfo,
        pch: Option<&PrecompiledHeader>,
    ) -> BuildAction;

    fn compile_pch_action(&self, project: &ResolvedProject, pch: &PrecompiledHeader)
    -> BuildAction;

    fn archive_action(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> BuildAction;

    fn link_action(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> BuildAction;

    fn compile_version_info_action(
        &self,
        project: &ResolvedProject,
        script: &Path,
        output: &Path,
    ) -> Option<BuildAction>;

    /// Fills `info` with the cleaned output, discovered headers and diagnostic counts.
    /// Returns `false` when the tool itself crashed.
    fn parse_output(&self, info: &mut BuilderFileInfo, raw: &str) -> bool;

    /// Records `dependencies` (plus everything `inherit_from` depends on, including its
    /// source) as the file's dependency set and persists its manifest.
    fn update_dependency_manifest(
        &self,
        info: &mut BuilderFileInfo,
        dependencies: &[PathBuf],
        inherit_from: Option<&BuilderFileInfo>,
    ) -> Result<(), ManifestError> {
        let mut all: Vec<PathBuf> = dependencies.to_vec();
        if let Some(parent) = inherit_from {
            all.push(parent.source.clone());
            all.extend(parent.dependency_paths().map(Path::to_path_buf));
        }
        all.retain(|path| path != &info.source);
        info.set_dependencies(all);
        info.config_hash = self.configuration_hash().to_string();
        info.store_manifest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::manifest::BuildManifest;
    use crate::config::Language;
    use crate::toolchain::finder::ToolLocator;
    use crate::toolchain::gcc::{GccFlavor, GccStyle};
    use crate::toolchain::parser::GCC_PATTERNS;
    use std::fs;

    #[test]
    fn test_update_dependency_manifest_inherits_pch_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let path = |name: &str| {
            let path = dir.path().join(name);
            fs::write(&path, "").unwrap();
            path
        };
        let main = path("main.cpp");
        let pch = path("pch.h");
        let inner = path("inner.h");
        let own = path("own.h");
        let toolchain = ComposedToolchain::new(
            "gcc",
            Language::Cpp,
            Box::new(GccStyle::new(GccFlavor::Gnu)),
            &GCC_PATTERNS,
            ToolLocator::default(),
        );

        let mut parent = BuilderFileInfo::new(pch.clone(), dir.path().join("pch.h.gch"), "");
        parent.set_dependencies([inner.clone(), main.clone()]);
        let mut info = BuilderFileInfo::new(main.clone(), dir.path().join("main.cpp.o"), "");
        let discovered = [own.clone(), inner.clone(), main.clone(), own.clone()];
        toolchain
            .update_dependency_manifest(&mut info, &discovered, Some(&parent))
            .unwrap();

        let mut expected = vec![inner, own, pch];
        expected.sort();
        let recorded: Vec<PathBuf> = info.dependency_paths().map(Path::to_path_buf).collect();
        assert_eq!(recorded, expected);

        let stored = BuildManifest::load(&info.manifest).unwrap();
        let stored: Vec<PathBuf> = stored.dependencies.keys().map(PathBuf::from).collect();
        assert_eq!(stored, expected);
        assert!(!stored.contains(&main));
    }
}
