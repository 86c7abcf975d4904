//! C# compilers (`mcs`, `csc`). Sources go straight to the compiler in one invocation.

use super::composed::{ArgumentStyle, LineClass};
use super::types::{PrecompiledHeader, ToolPaths};
use crate::config::{OutputType, ResolvedProject};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CSharpStyle;

impl ArgumentStyle for CSharpStyle {
    fn object_extension(&self) -> &'static str {
        "cs"
    }

    fn requires_compile_step(&self) -> bool {
        false
    }

    fn output_file_name(&self, project: &ResolvedProject) -> String {
        match project.output_type {
            OutputType::StaticLib | OutputType::SharedLib => format!("{}.dll", project.name),
            _ => format!("{}.exe", project.name),
        }
    }

    fn precompiled_header(&self, _project: &ResolvedProject) -> Option<PrecompiledHeader> {
        None
    }

    fn compile_args(
        &self,
        project: &ResolvedProject,
        _source: &Path,
        output: &Path,
        _pch: Option<&PrecompiledHeader>,
    ) -> Vec<String> {
        self.link_args(project, &[], output)
    }

    fn pch_args(&self, _project: &ResolvedProject, _pch: &PrecompiledHeader) -> Vec<String> {
        Vec::new()
    }

    fn archive_args(&self, _inputs: &[PathBuf], _output: &Path) -> Vec<String> {
        Vec::new()
    }

    fn link_args(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Vec<String> {
        let target = match project.output_type {
            OutputType::Executable => "winexe",
            OutputType::StaticLib | OutputType::SharedLib => "library",
            _ => "exe",
        };
        let mut args = vec![
            "-nologo".to_string(),
            format!("-out:{}", output.display()),
            format!("-target:{target}"),
        ];
        if !project.defines.is_empty() {
            args.push(format!("-define:{}", project.defines.join(";")));
        }
        if project.debug_info {
            args.push("-debug".to_string());
        }
        if project.optimize {
            args.push("-optimize+".to_string());
        }
        args.extend(
            project
                .lib_dirs
                .iter()
                .map(|d| format!("-lib:{}", d.display())),
        );
        args.extend(project.libs.iter().map(|lib| {
            if lib.ends_with(".dll") {
                format!("-r:{lib}")
            } else {
                format!("-r:{lib}.dll")
            }
        }));
        args.extend(project.flags.iter().chain(&project.link_flags).cloned());
        args.extend(inputs.iter().map(|i| i.display().to_string()));
        args
    }

    fn classify_line<'l>(&self, line: &'l str, _source: &Path) -> LineClass<'l> {
        if line.starts_with("Compilation succeeded") || line.starts_with("Compilation failed") {
            LineClass::Skip
        } else {
            LineClass::Text
        }
    }

    fn is_internal_error(&self, line: &str) -> bool {
        line.contains("Internal compiler error") || line.contains("error CS8078")
    }

    fn link_tool<'p>(&self, paths: &'p ToolPaths, _output: OutputType) -> Option<&'p Path> {
        paths.compiler.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KilnConfig, Platform};

    #[test]
    fn test_link_args_build_library() {
        let project = KilnConfig::parse(
            "[project]\nname = \"Tool\"\nlanguage = \"csharp\"\noutput = \"shared-lib\"\nlibs = [\"System.Xml\"]\n",
        )
        .unwrap()
        .resolve(Path::new("/proj"), "debug", Platform::Linux)
        .unwrap();

        let style = CSharpStyle;
        assert!(!style.requires_compile_step());
        assert_eq!(style.output_file_name(&project), "Tool.dll");

        let args = style.link_args(&project, &[PathBuf::from("A.cs")], Path::new("Tool.dll"));
        assert_eq!(
            args,
            vec![
                "-nologo",
                "-out:Tool.dll",
                "-target:library",
                "-define:DEBUG",
                "-debug",
                "-r:System.Xml.dll",
                "A.cs",
            ]
        );
    }

    #[test]
    fn test_compilation_summary_is_skipped() {
        let style = CSharpStyle;
        assert_eq!(
            style.classify_line("Compilation succeeded - 2 warning(s)", Path::new("A.cs")),
            LineClass::Skip
        );
    }
}
