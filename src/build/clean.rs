//! `kiln clean`: removes build outputs.
//!
//! - `kiln clean` removes the build directory and `compile_commands.json`
//! - `kiln clean --toolchains` also forgets the cached tool locations

use super::core::COMPILE_COMMANDS;
use super::utils::load_config;
use crate::toolchain::finder::{ToolCache, clear_tool_cache};
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};

pub fn clean(root: &Path, toolchains: bool) -> Result<()> {
    let config = load_config(root)?;
    let mut cleaned = false;

    let build_dir = root.join(
        config
            .project
            .intermediate_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("build")),
    );
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir)
            .with_context(|| format!("Failed to remove {}", build_dir.display()))?;
        cleaned = true;
    }

    let commands = root.join(COMPILE_COMMANDS);
    if commands.exists() {
        fs::remove_file(&commands).context("Failed to remove compile commands")?;
        cleaned = true;
    }

    if toolchains {
        let cache = ToolCache::default_path();
        if cache.exists() {
            clear_tool_cache(&cache).context("Failed to clear the toolchain cache")?;
            println!("{} Cleared toolchain cache ({})", "x".red(), cache.display());
            cleaned = true;
        }
    }

    if cleaned {
        println!("{} Clean complete.", "✓".green());
    } else {
        println!("{} Nothing to clean", "!".yellow());
    }
    Ok(())
}
