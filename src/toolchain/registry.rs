use super::Toolchain;
use super::composed::ComposedToolchain;
use super::csharp::CSharpStyle;
use super::finder::ToolLocator;
use super::gcc::{GccFlavor, GccStyle};
use super::msvc::MsvcStyle;
use super::parser::{CSHARP_PATTERNS, GCC_PATTERNS, MSVC_PATTERNS};
use super::types::ToolchainError;
use crate::config::{Language, Platform};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

pub type ToolchainFactory = Box<dyn Fn(Language) -> Box<dyn Toolchain> + Send + Sync>;

struct Entry {
    name: String,
    factory: ToolchainFactory,
}

/// Toolchain factories per `(language, platform)`, in preference order.
#[derive(Default)]
pub struct ToolchainRegistry {
    entries: HashMap<(Language, Platform), Vec<Entry>>,
}

impl ToolchainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// GCC, Clang, MSVC and the C# compilers. Discovered paths go through the tool
    /// cache at `cache` when given.
    pub fn with_defaults(cache: Option<PathBuf>, refresh: bool) -> Self {
        let mut registry = Self::new();
        let native = [Language::C, Language::Cpp];

        let order: [(Platform, &'static [&'static str]); 3] = [
            (Platform::Linux, &["gcc", "clang"]),
            (Platform::MacOs, &["clang", "gcc"]),
            (Platform::Windows, &["msvc", "gcc", "clang"]),
        ];
        for (platform, names) in order {
            for &name in names {
                let cache = cache.clone();
                registry.register_shared(&native, platform, name, move |language| {
                    native_toolchain(name, language, cache.clone(), refresh)
                });
            }
        }

        let order: [(Platform, &'static [&'static str]); 3] = [
            (Platform::Linux, &["mono"]),
            (Platform::MacOs, &["mono"]),
            (Platform::Windows, &["csc", "mono"]),
        ];
        for (platform, names) in order {
            for &name in names {
                let cache = cache.clone();
                registry.register(Language::CSharp, platform, name, move |language| {
                    csharp_toolchain(name, language, cache.clone(), refresh)
                });
            }
        }
        registry
    }

    pub fn register<F>(&mut self, language: Language, platform: Platform, name: &str, factory: F)
    where
        F: Fn(Language) -> Box<dyn Toolchain> + Send + Sync + 'static,
    {
        self.entries
            .entry((language, platform))
            .or_default()
            .push(Entry {
                name: name.to_string(),
                factory: Box::new(factory),
            });
    }

    fn register_shared<F>(&mut self, languages: &[Language], platform: Platform, name: &str, factory: F)
    where
        F: Fn(Language) -> Box<dyn Toolchain> + Clone + Send + Sync + 'static,
    {
        for &language in languages {
            self.register(language, platform, name, factory.clone());
        }
    }

    /// Registered toolchain names for a language/platform, in preference order.
    pub fn candidates(&self, language: Language, platform: Platform) -> Vec<&str> {
        self.entries
            .get(&(language, platform))
            .map(|entries| entries.iter().map(|e| e.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Initialises candidates in order and returns the first available one. With
    /// `preferred`, only that toolchain is considered.
    pub fn resolve(
        &self,
        language: Language,
        platform: Platform,
        preferred: Option<&str>,
    ) -> Result<Box<dyn Toolchain>, ToolchainError> {
        let entries = self
            .entries
            .get(&(language, platform))
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut considered = entries
            .iter()
            .filter(|e| preferred.is_none_or(|name| e.name == name))
            .peekable();
        if considered.peek().is_none()
            && let Some(name) = preferred
        {
            return Err(ToolchainError::UnknownToolchain {
                name: name.to_string(),
                language,
                platform,
            });
        }

        for entry in considered {
            let mut toolchain = (entry.factory)(language);
            if toolchain.init() {
                debug!(toolchain = %toolchain.description(), "toolchain selected");
                return Ok(toolchain);
            }
            debug!(toolchain = %entry.name, "toolchain unavailable");
        }
        Err(ToolchainError::NotFound { language, platform })
    }

    /// Every registered toolchain for the pair, initialised, available or not.
    pub fn detect_all(&self, language: Language, platform: Platform) -> Vec<Box<dyn Toolchain>> {
        self.entries
            .get(&(language, platform))
            .into_iter()
            .flatten()
            .map(|entry| {
                let mut toolchain = (entry.factory)(language);
                toolchain.init();
                toolchain
            })
            .collect()
    }
}

fn with_cache(toolchain: ComposedToolchain, cache: Option<PathBuf>, refresh: bool) -> ComposedToolchain {
    match cache {
        Some(path) => toolchain.with_cache(path, refresh),
        None => toolchain,
    }
}

fn native_toolchain(
    name: &'static str,
    language: Language,
    cache: Option<PathBuf>,
    refresh: bool,
) -> Box<dyn Toolchain> {
    let cpp = language != Language::C;
    let toolchain = match name {
        "msvc" => ComposedToolchain::new(
            name,
            language,
            Box::new(MsvcStyle),
            &MSVC_PATTERNS,
            ToolLocator {
                compiler: vec!["cl"],
                linker: vec!["link"],
                archiver: vec!["lib"],
                resource_compiler: vec!["rc"],
                visual_studio: true,
            },
        ),
        "clang" => {
            let compiler = if cpp { "clang++" } else { "clang" };
            ComposedToolchain::new(
                name,
                language,
                Box::new(GccStyle::new(GccFlavor::Clang)),
                &GCC_PATTERNS,
                ToolLocator {
                    compiler: vec![compiler],
                    linker: vec![compiler],
                    archiver: vec!["llvm-ar", "ar"],
                    resource_compiler: vec!["llvm-windres", "windres"],
                    visual_studio: false,
                },
            )
        }
        _ => {
            let compiler = if cpp { "g++" } else { "gcc" };
            ComposedToolchain::new(
                name,
                language,
                Box::new(GccStyle::new(GccFlavor::Gnu)),
                &GCC_PATTERNS,
                ToolLocator {
                    compiler: vec![compiler],
                    linker: vec![compiler],
                    archiver: vec!["ar"],
                    resource_compiler: vec!["windres"],
                    visual_studio: false,
                },
            )
        }
    };
    Box::new(with_cache(toolchain, cache, refresh))
}

fn csharp_toolchain(
    name: &'static str,
    language: Language,
    cache: Option<PathBuf>,
    refresh: bool,
) -> Box<dyn Toolchain> {
    let compilers = if name == "csc" { vec!["csc"] } else { vec!["mcs", "csc"] };
    let toolchain = ComposedToolchain::new(
        name,
        language,
        Box::new(CSharpStyle),
        &CSHARP_PATTERNS,
        ToolLocator {
            compiler: compilers,
            ..Default::default()
        },
    );
    Box::new(with_cache(toolchain, cache, refresh))
}
