//! MSVC (`cl`, `link`, `lib`, `rc`) flag syntax.

use super::composed::{ArgumentStyle, LineClass};
use super::types::{PrecompiledHeader, ToolPaths};
use crate::config::{Language, OutputType, ResolvedProject};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

const INCLUDE_NOTE: &str = "Note: including file:";

#[derive(Debug, Clone, Default)]
pub struct MsvcStyle;

impl MsvcStyle {
    fn common_args(&self, project: &ResolvedProject) -> Vec<String> {
        let mut args = vec![
            "/nologo".to_string(),
            "/c".to_string(),
            "/showIncludes".to_string(),
        ];
        if project.language == Language::Cpp {
            args.push("/EHsc".to_string());
        }
        if let Some(standard) = &project.standard {
            args.push(get_std_flag_msvc(standard));
        }
        args.push(if project.optimize { "/O2" } else { "/Od" }.to_string());
        if project.debug_info {
            // Embedded debug info; parallel compiles never contend for a shared .pdb.
            args.push("/Z7".to_string());
        }
        args.push("/W3".to_string());
        args.extend(project.defines.iter().map(|d| format!("/D{d}")));
        args.extend(
            project
                .includes
                .iter()
                .map(|i| format!("/I{}", i.display())),
        );
        args.extend(project.flags.iter().cloned());
        args
    }
}

fn header_name(pch: &PrecompiledHeader) -> String {
    pch.header
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl ArgumentStyle for MsvcStyle {
    fn object_extension(&self) -> &'static str {
        "obj"
    }

    fn supports_version_info(&self, _platform: crate::config::Platform) -> bool {
        true
    }

    fn version_args(&self) -> &'static [&'static str] {
        &[]
    }

    fn output_file_name(&self, project: &ResolvedProject) -> String {
        match project.output_type {
            OutputType::StaticLib => format!("{}.lib", project.name),
            OutputType::SharedLib => format!("{}.dll", project.name),
            _ => format!("{}.exe", project.name),
        }
    }

    fn precompiled_header(&self, project: &ResolvedProject) -> Option<PrecompiledHeader> {
        let config = project.pch.as_ref()?;
        let Some(source) = config.source.clone() else {
            warn!(
                header = %config.header.display(),
                "MSVC needs [project.pch] source; building without a precompiled header"
            );
            return None;
        };
        let stem = source.file_stem()?.to_string_lossy().into_owned();
        let dir = project.intermediate_dir.join("pch");
        Some(PrecompiledHeader {
            header: config.header.clone(),
            input: source,
            output: dir.join(format!("{stem}.pch")),
            link_object: Some(dir.join(format!("{stem}.obj"))),
        })
    }

    fn compile_args(
        &self,
        project: &ResolvedProject,
        source: &Path,
        output: &Path,
        pch: Option<&PrecompiledHeader>,
    ) -> Vec<String> {
        let mut args = self.common_args(project);
        if let Some(pch) = pch {
            args.push(format!("/Yu{}", header_name(pch)));
            args.push(format!("/Fp{}", pch.output.display()));
        }
        args.push(source.display().to_string());
        args.push(format!("/Fo{}", output.display()));
        args
    }

    fn pch_args(&self, project: &ResolvedProject, pch: &PrecompiledHeader) -> Vec<String> {
        let mut args = self.common_args(project);
        args.push(format!("/Yc{}", header_name(pch)));
        args.push(format!("/Fp{}", pch.output.display()));
        args.push(pch.input.display().to_string());
        if let Some(object) = &pch.link_object {
            args.push(format!("/Fo{}", object.display()));
        }
        args
    }

    fn archive_args(&self, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = vec!["/nologo".to_string(), format!("/OUT:{}", output.display())];
        args.extend(inputs.iter().map(|i| i.display().to_string()));
        args
    }

    fn link_args(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Vec<String> {
        let mut args = vec!["/nologo".to_string(), format!("/OUT:{}", output.display())];
        match project.output_type {
            OutputType::SharedLib => args.push("/DLL".to_string()),
            OutputType::Executable => args.push("/SUBSYSTEM:WINDOWS".to_string()),
            OutputType::Console => args.push("/SUBSYSTEM:CONSOLE".to_string()),
            _ => {}
        }
        if project.debug_info {
            args.push("/DEBUG".to_string());
        }
        args.extend(
            project
                .lib_dirs
                .iter()
                .map(|d| format!("/LIBPATH:{}", d.display())),
        );
        args.extend(inputs.iter().map(|i| i.display().to_string()));
        args.extend(project.libs.iter().map(|lib| {
            if Path::new(lib).extension().is_some() {
                lib.clone()
            } else {
                format!("{lib}.lib")
            }
        }));
        args.extend(project.link_flags.iter().cloned());
        args
    }

    fn version_info_args(&self, script: &Path, output: &Path) -> Vec<String> {
        vec![
            "/nologo".to_string(),
            format!("/fo{}", output.display()),
            script.display().to_string(),
        ]
    }

    fn classify_line<'l>(&self, line: &'l str, source: &Path) -> LineClass<'l> {
        if let Some(path) = line.strip_prefix(INCLUDE_NOTE) {
            return LineClass::Dependency(path.trim());
        }
        // cl echoes the name of every file it compiles
        if source
            .file_name()
            .is_some_and(|name| line.trim() == name.to_string_lossy())
        {
            return LineClass::Skip;
        }
        LineClass::Text
    }

    fn is_internal_error(&self, line: &str) -> bool {
        line.contains("INTERNAL COMPILER ERROR") || line.contains("C1001")
    }

    fn system_includes(&self, _paths: &ToolPaths, _language: Language) -> Vec<PathBuf> {
        env::var_os("INCLUDE")
            .map(|value| env::split_paths(&value).collect())
            .unwrap_or_default()
    }

    fn link_tool<'p>(&self, paths: &'p ToolPaths, output: OutputType) -> Option<&'p Path> {
        let tool = if output == OutputType::StaticLib {
            paths.archiver.as_ref()
        } else {
            paths.linker.as_ref()
        };
        tool.map(PathBuf::as_path)
    }
}

/// Maps a language standard name to the closest `/std:` switch MSVC accepts.
pub fn get_std_flag_msvc(edition: &str) -> String {
    if edition.starts_with("/std:") {
        return edition.to_string();
    }
    let lower = edition.to_lowercase();
    let is_c = lower.starts_with('c') && !lower.contains("++");
    let number = lower.trim_start_matches("c++").trim_start_matches('c');

    let flag = match (is_c, number) {
        (true, "89" | "90" | "99" | "11") => "c11",
        (true, "17" | "18") => "c17",
        (true, "23" | "2x") => "clatest",
        (false, "98" | "03" | "11" | "14") => "c++14",
        (false, "17") => "c++17",
        (false, "20") => "c++20",
        (false, "23" | "26" | "2c" | "latest") => "c++latest",
        _ => return format!("/std:{edition}"),
    };
    format!("/std:{flag}")
}
