use crate::toolchain::parser::{Diagnostic, Severity};
use colored::*;

/// Turns common failure patterns into a hint pointing at the relevant `kiln.toml` key.
pub struct FeedbackAnalyzer;

impl FeedbackAnalyzer {
    pub fn analyze(diagnostics: &[Diagnostic], output: &str) -> Option<String> {
        let errors = || {
            diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Error)
                .map(|d| d.message.as_str())
        };

        if output.contains("undefined reference to `main'")
            || output.contains("entry point must be defined")
            || errors().any(|m| m.contains("unresolved external symbol main"))
        {
            return Some(format!(
                "The program has no {} function.\nAdd an entry point, or set {} if this is a library.",
                "main()".bold().yellow(),
                "output = \"static-lib\"".bold().green()
            ));
        }

        if errors().any(|m| m.contains("undefined reference to") || m.contains("unresolved external"))
            || output.contains("LNK2019")
        {
            return Some(format!(
                "This is a {} error.\nA library is probably missing from {} or {} in kiln.toml.",
                "linker".bold().red(),
                "libs".bold().yellow(),
                "lib_dirs".bold().yellow()
            ));
        }

        if errors().any(|m| m.contains("No such file or directory") || m.contains("cannot open include file"))
            || output.contains("cannot open include file")
        {
            return Some(format!(
                "A {} could not be found.\nCheck {} in kiln.toml.",
                "header".bold().red(),
                "includes".bold().yellow()
            ));
        }

        None
    }
}
