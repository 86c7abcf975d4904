//! GCC and Clang flag syntax.

use super::composed::{ArgumentStyle, LineClass};
use super::types::{PrecompiledHeader, ToolPaths};
use crate::config::{Language, OutputType, Platform, ResolvedProject};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GccFlavor {
    Gnu,
    Clang,
}

#[derive(Debug, Clone)]
pub struct GccStyle {
    flavor: GccFlavor,
}

impl GccStyle {
    pub fn new(flavor: GccFlavor) -> Self {
        Self { flavor }
    }

    /// Flags shared by translation units and the precompiled header.
    fn common_args(&self, project: &ResolvedProject) -> Vec<String> {
        let mut args = vec!["-fdiagnostics-color=never".to_string(), "-H".to_string()];
        if let Some(standard) = &project.standard {
            args.push(get_std_flag_gcc(standard));
        }
        args.push(if project.optimize { "-O2" } else { "-O0" }.to_string());
        if project.debug_info {
            args.push("-g".to_string());
        }
        args.push("-Wall".to_string());
        if project.output_type == OutputType::SharedLib && project.platform != Platform::Windows {
            args.push("-fPIC".to_string());
        }
        args.extend(project.defines.iter().map(|d| format!("-D{d}")));
        args.extend(
            project
                .includes
                .iter()
                .map(|i| format!("-I{}", i.display())),
        );
        args.extend(project.flags.iter().cloned());
        args
    }
}

impl ArgumentStyle for GccStyle {
    fn object_extension(&self) -> &'static str {
        "o"
    }

    fn supports_version_info(&self, platform: Platform) -> bool {
        platform == Platform::Windows
    }

    fn output_file_name(&self, project: &ResolvedProject) -> String {
        let name = &project.name;
        match (project.output_type, project.platform) {
            (OutputType::StaticLib, _) => format!("lib{name}.a"),
            (OutputType::SharedLib, Platform::Windows) => format!("{name}.dll"),
            (OutputType::SharedLib, Platform::MacOs) => format!("lib{name}.dylib"),
            (OutputType::SharedLib, Platform::Linux) => format!("lib{name}.so"),
            (_, platform) => format!("{name}{}", platform.executable_suffix()),
        }
    }

    fn precompiled_header(&self, project: &ResolvedProject) -> Option<PrecompiledHeader> {
        let header = project.pch.as_ref()?.header.clone();
        let file_name = header.file_name()?.to_string_lossy().into_owned();
        let dir = project.intermediate_dir.join("pch");
        let output = match self.flavor {
            // `-include <dir>/pch.h` picks up the neighbouring .gch
            GccFlavor::Gnu => dir.join(format!("{file_name}.gch")),
            GccFlavor::Clang => dir.join(format!("{file_name}.pch")),
        };
        Some(PrecompiledHeader {
            input: header.clone(),
            header,
            output,
            link_object: None,
        })
    }

    fn compile_args(
        &self,
        project: &ResolvedProject,
        source: &Path,
        output: &Path,
        pch: Option<&PrecompiledHeader>,
    ) -> Vec<String> {
        let mut args = vec!["-c".to_string()];
        if let Some(pch) = pch {
            match self.flavor {
                GccFlavor::Gnu => {
                    args.push("-include".to_string());
                    args.push(pch.output.with_extension("").display().to_string());
                }
                GccFlavor::Clang => {
                    args.push("-include-pch".to_string());
                    args.push(pch.output.display().to_string());
                }
            }
        }
        args.extend(self.common_args(project));
        args.push(source.display().to_string());
        args.push("-o".to_string());
        args.push(output.display().to_string());
        args
    }

    fn pch_args(&self, project: &ResolvedProject, pch: &PrecompiledHeader) -> Vec<String> {
        let kind = match project.language {
            Language::C => "c-header",
            _ => "c++-header",
        };
        let mut args = vec!["-x".to_string(), kind.to_string()];
        args.extend(self.common_args(project));
        args.push(pch.input.display().to_string());
        args.push("-o".to_string());
        args.push(pch.output.display().to_string());
        args
    }

    fn archive_args(&self, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = vec!["rcs".to_string(), output.display().to_string()];
        args.extend(inputs.iter().map(|i| i.display().to_string()));
        args
    }

    fn link_args(
        &self,
        project: &ResolvedProject,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = inputs.iter().map(|i| i.display().to_string()).collect();
        args.push("-o".to_string());
        args.push(output.display().to_string());
        match project.output_type {
            OutputType::SharedLib => args.push("-shared".to_string()),
            OutputType::Executable if project.platform == Platform::Windows => {
                args.push("-mwindows".to_string())
            }
            _ => {}
        }
        if project.debug_info {
            args.push("-g".to_string());
        }
        args.extend(
            project
                .lib_dirs
                .iter()
                .map(|d| format!("-L{}", d.display())),
        );
        args.extend(project.libs.iter().map(|l| format!("-l{l}")));
        args.extend(project.link_flags.iter().cloned());
        args
    }

    fn version_info_args(&self, script: &Path, output: &Path) -> Vec<String> {
        vec![
            script.display().to_string(),
            "-O".to_string(),
            "coff".to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ]
    }

    fn version_info_extension(&self) -> &'static str {
        "res.o"
    }

    fn classify_line<'l>(&self, line: &'l str, _source: &Path) -> LineClass<'l> {
        // `-H` prints one dot per nesting level, a space, then the header path.
        let dots = line.bytes().take_while(|b| *b == b'.').count();
        if dots > 0 && line[dots..].starts_with(' ') {
            return LineClass::Dependency(&line[dots + 1..]);
        }
        // `!` marks a precompiled header that was used, `x` one that was rejected.
        if let Some(path) = line.strip_prefix("! ").or_else(|| line.strip_prefix("x "))
            && path.trim_end().ends_with(".gch")
        {
            return LineClass::Skip;
        }
        if line.starts_with("Multiple include guards may be useful for:") {
            return LineClass::SkipBlock;
        }
        LineClass::Text
    }

    fn is_internal_error(&self, line: &str) -> bool {
        line.contains("internal compiler error")
    }

    fn system_includes(&self, paths: &ToolPaths, language: Language) -> Vec<PathBuf> {
        let Some(compiler) = &paths.compiler else {
            return Vec::new();
        };
        let lang = if language == Language::C { "c" } else { "c++" };
        Command::new(compiler)
            .args(["-x", lang, "-E", "-v", "-"])
            .stdin(Stdio::null())
            .output()
            .map(|out| parse_search_list(&String::from_utf8_lossy(&out.stderr)))
            .unwrap_or_default()
    }
}

/// Directories between `#include <...> search starts here:` and `End of search list.`
pub fn parse_search_list(text: &str) -> Vec<PathBuf> {
    text.lines()
        .skip_while(|l| !l.starts_with("#include <...> search starts here:"))
        .skip(1)
        .take_while(|l| !l.starts_with("End of search list."))
        .map(|l| l.trim().trim_end_matches(" (framework directory)"))
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Maps a language standard name to the GCC/Clang `-std=` flag.
pub fn get_std_flag_gcc(edition: &str) -> String {
    let normalized = edition.to_lowercase();
    let edition = normalized.strip_prefix("-std=").unwrap_or(&normalized);

    let canonical = match edition {
        "c89" | "c90" => "c89",
        "c17" | "c18" => "c17",
        "c23" | "c2x" => "c23",
        "c++98" | "c++03" => "c++03",
        "c++11" | "c++0x" => "c++11",
        "c++14" | "c++1y" => "c++14",
        "c++17" | "c++1z" => "c++17",
        "c++20" | "c++2a" => "c++20",
        "c++23" | "c++2b" => "c++23",
        "c++26" | "c++2c" => "c++26",
        "gnu89" | "gnu90" => "gnu89",
        "gnu17" | "gnu18" => "gnu17",
        "gnu23" | "gnu2x" => "gnu23",
        "gnu++98" | "gnu++03" => "gnu++03",
        "gnu++11" | "gnu++0x" => "gnu++11",
        "gnu++14" | "gnu++1y" => "gnu++14",
        "gnu++17" | "gnu++1z" => "gnu++17",
        "gnu++20" | "gnu++2a" => "gnu++20",
        "gnu++23" | "gnu++2b" => "gnu++23",
        "gnu++26" | "gnu++2c" => "gnu++26",
        other => other,
    };
    format!("-std={canonical}")
}
