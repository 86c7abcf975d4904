//! Table-driven parsing of compiler and linker diagnostics.
//!
//! Every toolchain registers an ordered list of [`OutputPattern`]s. A pattern is a
//! regex plus [`CaptureRoles`] telling which capture group holds which part of the
//! diagnostic. Lines that contain none of a pattern's prefilter substrings never reach
//! its regex. The first matching pattern wins; lines nothing matches are plain output.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "error" | "fatal error" | "fatal" => Some(Severity::Error),
            "warning" => Some(Severity::Warning),
            "note" | "info" | "remark" | "message" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "note"),
        }
    }
}

/// One structured message extracted from tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub origin: Option<String>,
    pub severity: Severity,
    pub code: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(origin) = &self.origin {
            write!(f, "{origin}")?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
                if let Some(column) = self.column {
                    write!(f, ":{column}")?;
                }
            }
            write!(f, ": ")?;
        }
        write!(f, "{}", self.severity)?;
        if let Some(code) = &self.code {
            write!(f, " {code}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Capture group index for each diagnostic field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureRoles {
    pub origin: Option<usize>,
    pub severity: Option<usize>,
    pub code: Option<usize>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub message: Option<usize>,
}

#[derive(Debug)]
pub struct OutputPattern {
    regex: Regex,
    prefilter: &'static [&'static str],
    roles: CaptureRoles,
    /// Used when the pattern has no severity group.
    fixed_severity: Option<Severity>,
}

impl OutputPattern {
    pub fn new(
        pattern: &str,
        prefilter: &'static [&'static str],
        roles: CaptureRoles,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            prefilter,
            roles,
            fixed_severity: None,
        })
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.fixed_severity = Some(severity);
        self
    }

    fn passes_prefilter(&self, line: &str) -> bool {
        self.prefilter.is_empty() || self.prefilter.iter().any(|needle| line.contains(needle))
    }

    fn parse(&self, line: &str) -> Option<Diagnostic> {
        let captures = self.regex.captures(line)?;
        let group = |index: Option<usize>| {
            index
                .and_then(|i| captures.get(i))
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let severity = match group(self.roles.severity) {
            Some(token) => match Severity::from_token(&token) {
                Some(severity) => severity,
                None => {
                    debug_assert!(false, "pattern captured unknown severity '{token}'");
                    return None;
                }
            },
            None => self.fixed_severity?,
        };

        Some(Diagnostic {
            origin: group(self.roles.origin),
            severity,
            code: group(self.roles.code),
            line: group(self.roles.line).and_then(|s| s.parse().ok()),
            column: group(self.roles.column).and_then(|s| s.parse().ok()),
            message: group(self.roles.message).unwrap_or_else(|| line.trim().to_string()),
        })
    }
}

#[derive(Debug, Default)]
pub struct ToolchainOutputParser {
    patterns: Vec<OutputPattern>,
}

impl ToolchainOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pattern; patterns are tried in registration order.
    pub fn register(&mut self, pattern: OutputPattern) -> &mut Self {
        self.patterns.push(pattern);
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn parse_line(&self, line: &str) -> Option<Diagnostic> {
        self.patterns
            .iter()
            .filter(|pattern| pattern.passes_prefilter(line))
            .find_map(|pattern| pattern.parse(line))
    }

    pub fn parse(&self, output: &str) -> Vec<Diagnostic> {
        output.lines().filter_map(|line| self.parse_line(line)).collect()
    }
}

const SEVERITY_WORDS: &[&str] = &["error", "warning", "note"];

fn table(entries: Vec<OutputPattern>) -> ToolchainOutputParser {
    let mut parser = ToolchainOutputParser::new();
    for entry in entries {
        parser.register(entry);
    }
    parser
}

fn pattern(regex: &str, prefilter: &'static [&'static str], roles: CaptureRoles) -> OutputPattern {
    OutputPattern::new(regex, prefilter, roles).expect("built-in diagnostic pattern is valid")
}

/// GCC and Clang: `file:line:col: severity: message` and the driver/linker forms.
pub static GCC_PATTERNS: LazyLock<ToolchainOutputParser> = LazyLock::new(|| {
    table(vec![
        pattern(
            r"^(.+?):(\d+):(\d+): (fatal error|error|warning|note): (.*)$",
            SEVERITY_WORDS,
            CaptureRoles {
                origin: Some(1),
                line: Some(2),
                column: Some(3),
                severity: Some(4),
                message: Some(5),
                ..Default::default()
            },
        ),
        pattern(
            r"^(.+?):(\d+): (fatal error|error|warning|note): (.*)$",
            SEVERITY_WORDS,
            CaptureRoles {
                origin: Some(1),
                line: Some(2),
                severity: Some(3),
                message: Some(4),
                ..Default::default()
            },
        ),
        pattern(
            r"^([\w.+-]+): (fatal error|error|warning|note): (.*)$",
            SEVERITY_WORDS,
            CaptureRoles {
                origin: Some(1),
                severity: Some(2),
                message: Some(3),
                ..Default::default()
            },
        ),
        pattern(
            r"^(.*?):?\s*(undefined reference to .*)$",
            &["undefined reference"],
            CaptureRoles {
                origin: Some(1),
                message: Some(2),
                ..Default::default()
            },
        )
        .with_severity(Severity::Error),
    ])
});

/// MSVC compiler, linker and librarian diagnostics.
pub static MSVC_PATTERNS: LazyLock<ToolchainOutputParser> = LazyLock::new(|| {
    table(vec![
        pattern(
            r"^(.+?)\((\d+)(?:,(\d+))?\)\s*: (fatal error|error|warning|note) ([A-Z]+\d+): (.*)$",
            SEVERITY_WORDS,
            CaptureRoles {
                origin: Some(1),
                line: Some(2),
                column: Some(3),
                severity: Some(4),
                code: Some(5),
                message: Some(6),
            },
        ),
        pattern(
            r"^(.+?) : (fatal error|error|warning) ((?:LNK|LIB|RC|C|D)\d+)\s*: (.*)$",
            &["error", "warning"],
            CaptureRoles {
                origin: Some(1),
                severity: Some(2),
                code: Some(3),
                message: Some(4),
                ..Default::default()
            },
        ),
    ])
});

/// Mono `mcs` and Roslyn `csc`.
pub static CSHARP_PATTERNS: LazyLock<ToolchainOutputParser> = LazyLock::new(|| {
    table(vec![
        pattern(
            r"^(.+?)\((\d+),(\d+)\): (error|warning) (CS\d+): (.*)$",
            &["error", "warning"],
            CaptureRoles {
                origin: Some(1),
                line: Some(2),
                column: Some(3),
                severity: Some(4),
                code: Some(5),
                message: Some(6),
            },
        ),
        pattern(
            r"^(error|warning) (CS\d+): (.*)$",
            &["error", "warning"],
            CaptureRoles {
                severity: Some(1),
                code: Some(2),
                message: Some(3),
                ..Default::default()
            },
        ),
    ])
});
