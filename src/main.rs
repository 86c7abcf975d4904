//! # kiln CLI Entry Point
//!
//! Parses arguments with clap and routes them to the library:
//! - **Build**: `build`, `watch`, `clean`
//! - **Toolchain**: `toolchain list`
//! - **Shell**: `completion`

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::*;
use std::path::{Path, PathBuf};

use kiln::build::{self, BuildOptions};
use kiln::config::{Language, Platform};
use kiln::logging::init_tracing;
use kiln::toolchain::ToolchainRegistry;
use kiln::toolchain::finder::ToolCache;

#[cfg(windows)]
#[link(name = "kernel32")]
unsafe extern "system" {
    fn SetConsoleOutputCP(wCodePageID: u32) -> i32;
}

#[cfg(windows)]
fn enable_windows_utf8_console() {
    unsafe {
        SetConsoleOutputCP(65001);
    }
}

#[cfg(not(windows))]
fn enable_windows_utf8_console() {}

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Incremental C/C++/C# build driver", version = env!("CARGO_PKG_VERSION"))]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to the nearest kiln.toml above the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct BuildArgs {
    /// Build the release configuration
    #[arg(long, conflicts_with = "configuration")]
    release: bool,
    /// Configuration to build (see [configurations.*] in kiln.toml)
    #[arg(short, long)]
    configuration: Option<String>,
    /// Number of worker threads
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Show detailed build commands and decisions
    #[arg(short, long)]
    verbose: bool,
    /// Print the commands instead of running them
    #[arg(long)]
    dry_run: bool,
    /// Use a specific toolchain (gcc, clang, msvc, mono, csc)
    #[arg(long)]
    toolchain: Option<String>,
    /// Compile everything locally even if an accelerator is configured
    #[arg(long)]
    no_accelerator: bool,
}

impl BuildArgs {
    fn options(&self) -> BuildOptions {
        let configuration = match (&self.configuration, self.release) {
            (Some(name), _) => name.clone(),
            (None, true) => "release".to_string(),
            (None, false) => "debug".to_string(),
        };
        BuildOptions {
            configuration,
            jobs: self.jobs,
            verbose: self.verbose,
            dry_run: self.dry_run,
            use_accelerator: !self.no_accelerator,
            toolchain: self.toolchain.clone(),
            ..BuildOptions::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the current project
    Build(BuildArgs),
    /// Rebuild whenever a source file changes
    Watch(BuildArgs),
    /// Remove build artifacts
    Clean {
        /// Also forget cached toolchain locations
        #[arg(long)]
        toolchains: bool,
    },
    /// Inspect available toolchains
    Toolchain {
        #[command(subcommand)]
        op: ToolchainOp,
    },
    /// Generate shell completion scripts
    Completion { shell: Shell },
}

#[derive(Subcommand)]
enum ToolchainOp {
    /// List toolchains for every language on this host
    List {
        /// Re-detect tools instead of trusting the cache
        #[arg(long)]
        refresh: bool,
    },
}

fn main() -> Result<()> {
    enable_windows_utf8_console();
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Build(args) | Commands::Watch(args) => args.verbose,
        _ => false,
    };
    init_tracing(verbose);

    match &cli.command {
        Commands::Build(args) => {
            let root = project_root(cli.project.as_deref())?;
            let config = build::load_config(&root)?;
            let reports = build::build_project(&config, &root, &args.options())?;
            reports.iter().for_each(build::print_report);
            Ok(())
        }
        Commands::Watch(args) => {
            let root = project_root(cli.project.as_deref())?;
            build::watch(&root, &args.options())
        }
        Commands::Clean { toolchains } => {
            let root = project_root(cli.project.as_deref())?;
            build::clean(&root, *toolchains)
        }
        Commands::Toolchain {
            op: ToolchainOp::List { refresh },
        } => list_toolchains(*refresh),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, bin_name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn project_root(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => path
            .canonicalize()
            .with_context(|| format!("Project directory {} not found", path.display())),
        None => build::find_project_root(&std::env::current_dir()?),
    }
}

fn list_toolchains(refresh: bool) -> Result<()> {
    let platform = Platform::host();
    let registry = ToolchainRegistry::with_defaults(Some(ToolCache::default_path()), refresh);

    println!("{} Toolchains on {}", "*".cyan(), platform.to_string().bold());
    for language in [Language::C, Language::Cpp, Language::CSharp] {
        println!("\n  {}", language.to_string().bold());
        let detected = registry.detect_all(language, platform);
        if detected.is_empty() {
            println!("    {} none registered", "-".dimmed());
        }
        for toolchain in detected {
            if toolchain.is_available() {
                println!("    {} {}", "✓".green(), toolchain.description());
            } else {
                println!("    {} {} (not found)", "x".red(), toolchain.name());
            }
        }
    }
    Ok(())
}
