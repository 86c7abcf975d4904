//! # kiln - incremental C/C++/C# build driver
//!
//! kiln turns a `kiln.toml` project into a graph of compile and link jobs, runs them on a
//! fixed worker pool and skips everything whose inputs did not change since the last
//! successful build.
//!
//! ## Module Organization
//!
//! - [`jobs`] - Dependency-aware job scheduler
//! - [`build`] - Staleness tracking, build tasks and the [`build::Builder`]
//! - [`toolchain`] - Compiler detection, command lines and output parsing
//! - [`accelerator`] - Batch execution hooks for distributed builds
//! - [`config`] - Configuration parsing (`kiln.toml`)

/// Batch executors for stale compile actions.
pub mod accelerator;

/// Build orchestration with incremental rebuilds.
pub mod build;

/// Configuration file parsing (`kiln.toml`).
pub mod config;

/// Fixed worker pool with job dependencies.
pub mod jobs;

/// Tracing subscriber setup.
pub mod logging;

/// Toolchain detection and selection.
pub mod toolchain;
