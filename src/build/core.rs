//! Project build orchestration.
//!
//! [`Builder::build`] walks `Idle → ComputeStaleSet → BuildTaskGraph → Execute →
//! PersistManifests → Done | Failed`. The job graph is a chain of stage barriers
//! (pre-compile, precompiled header, compile, pre-link, link, post-build); every task
//! hangs off the barrier of the stage before it, and one host job waits on them all.

use super::file_info::{
    BuilderFileInfo, StaleReason, get_multiple_file_infos, out_of_date_reason,
};
use super::manifest::ManifestError;
use super::task::{
    AcceleratedBatchTask, BuildContext, BuildStage, BuildTask, CommandTask, CompileTask,
    LinkTask, VersionInfoTask, into_job,
};
use super::utils::load_config;
use crate::accelerator::{Accelerator, ScriptAccelerator};
use crate::config::{KilnConfig, OutputType, Platform, ResolvedProject};
use crate::jobs::{JobError, JobHandle, JobScheduler};
use crate::toolchain::finder::ToolCache;
use crate::toolchain::{
    PrecompiledHeader, Toolchain, ToolchainError, ToolchainRegistry, render_version_rc,
};
use anyhow::Context;
use colored::*;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub configuration: String,
    /// Worker threads; host parallelism when `None`.
    pub jobs: Option<usize>,
    pub verbose: bool,
    pub quiet: bool,
    pub dry_run: bool,
    pub use_accelerator: bool,
    /// Overrides `project.toolset`.
    pub toolchain: Option<String>,
    pub refresh_toolchains: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            configuration: "debug".to_string(),
            jobs: None,
            verbose: false,
            quiet: false,
            dry_run: false,
            use_accelerator: true,
            toolchain: None,
            refresh_toolchains: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub project: String,
    pub configuration: String,
    pub platform: Platform,
    pub toolchain: String,
    pub compiled: usize,
    pub linked: usize,
    pub up_to_date: bool,
    pub errors: usize,
    pub warnings: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("project '{project}': {source}")]
    ToolchainUnavailable {
        project: String,
        #[source]
        source: ToolchainError,
    },
    #[error("project '{project}' has no source files")]
    NoSources { project: String },
    #[error("job scheduler: {0}")]
    Scheduler(#[from] JobError),
    #[error("pre-build command '{command}' failed for project '{project}'")]
    PreBuildFailed { project: String, command: String },
    #[error(
        "build of '{project}' ({configuration}, {platform}) failed: {errors} error(s), {warnings} warning(s)"
    )]
    BuildFailed {
        project: String,
        configuration: String,
        platform: Platform,
        errors: usize,
        warnings: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Idle,
    ComputeStaleSet,
    BuildTaskGraph,
    Execute,
    PersistManifests,
    Done,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct StateMachine<'a> {
    project: &'a str,
    state: BuildState,
}

impl StateMachine<'_> {
    fn enter(&mut self, next: BuildState) {
        debug!(project = self.project, from = %self.state, to = %next, "build state");
        self.state = next;
    }
}

/// Per-file staleness of one project, computed before the graph is wired.
struct BuildPlan {
    files: Vec<BuilderFileInfo>,
    pch: Option<(PrecompiledHeader, BuilderFileInfo)>,
    version_info: Option<BuilderFileInfo>,
    link: BuilderFileInfo,
    link_inputs: Vec<PathBuf>,
}

impl BuildPlan {
    fn stale_files(&self) -> usize {
        self.files.iter().filter(|f| f.out_of_date).count()
    }

    fn pch_stale(&self) -> bool {
        self.pch.as_ref().is_some_and(|(_, info)| info.out_of_date)
    }

    fn version_info_stale(&self) -> bool {
        self.version_info.as_ref().is_some_and(|info| info.out_of_date)
    }

    /// Jobs that advance the progress bar.
    fn tracked_jobs(&self) -> usize {
        self.stale_files() + usize::from(self.pch_stale()) + usize::from(self.version_info_stale())
    }

    fn up_to_date(&self) -> bool {
        self.stale_files() == 0
            && !self.pch_stale()
            && !self.version_info_stale()
            && !self.link.out_of_date
    }
}

/// Tracks every job created for one build so a half-built graph can be drained.
struct GraphBuilder<'s> {
    scheduler: &'s JobScheduler,
    ctx: Arc<BuildContext>,
    created: Vec<JobHandle>,
}

impl<'s> GraphBuilder<'s> {
    fn barrier(&mut self) -> Result<JobHandle, JobError> {
        let job = self.scheduler.create_barrier()?;
        self.created.push(job);
        Ok(job)
    }

    fn task(&mut self, task: Arc<dyn BuildTask>) -> Result<JobHandle, JobError> {
        let job = self
            .scheduler
            .create_job(Some(into_job(task, Arc::clone(&self.ctx))))?;
        self.created.push(job);
        Ok(job)
    }

    fn depend(&self, job: JobHandle, on: JobHandle) -> Result<(), JobError> {
        self.scheduler.add_dependency(job, on)
    }

    /// Chains `commands` after `after`; returns the last job of the chain.
    fn commands(
        &mut self,
        stage: BuildStage,
        commands: &[String],
        root: &Path,
        after: JobHandle,
    ) -> Result<JobHandle, JobError> {
        let mut last = after;
        for command in commands {
            let job = self.task(Arc::new(CommandTask::new(stage, command.clone(), root)))?;
            self.depend(job, last)?;
            last = job;
        }
        Ok(last)
    }

    /// Lets every created job run to completion so the arena slots come back. Tasks
    /// see the failure flag and do nothing.
    fn drain(self) {
        self.ctx.failure.fail(BuildStage::PreBuild);
        for &job in &self.created {
            if let Err(e) = self.scheduler.enqueue(job) {
                debug!("not enqueued while draining: {e}");
            }
        }
        for &job in &self.created {
            let _ = self.scheduler.wait(job);
        }
    }
}

pub struct Builder {
    scheduler: Arc<JobScheduler>,
    accelerator: Option<Arc<dyn Accelerator>>,
    options: BuildOptions,
}

impl Builder {
    pub fn new(scheduler: Arc<JobScheduler>, options: BuildOptions) -> Self {
        Self {
            scheduler,
            accelerator: None,
            options,
        }
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(accelerator);
        self
    }

    pub fn build(
        &self,
        project: &ResolvedProject,
        mut toolchain: Box<dyn Toolchain>,
    ) -> Result<BuildReport, BuildError> {
        let start = Instant::now();
        let mut machine = StateMachine {
            project: &project.name,
            state: BuildState::Idle,
        };
        let report = |ctx: Option<&BuildContext>, up_to_date: bool, toolchain: &dyn Toolchain| {
            BuildReport {
                project: project.name.clone(),
                configuration: project.configuration.clone(),
                platform: project.platform,
                toolchain: toolchain.description(),
                compiled: ctx.map_or(0, BuildContext::compiled),
                linked: ctx.map_or(0, BuildContext::linked),
                up_to_date,
                errors: ctx.map_or(0, BuildContext::errors),
                warnings: ctx.map_or(0, BuildContext::warnings),
                elapsed: start.elapsed(),
            }
        };

        if project.output_type == OutputType::Aggregate {
            machine.enter(BuildState::Done);
            return Ok(report(None, true, toolchain.as_ref()));
        }
        if !toolchain.is_available() {
            return Err(BuildError::ToolchainUnavailable {
                project: project.name.clone(),
                source: ToolchainError::NotFound {
                    language: project.language,
                    platform: project.platform,
                },
            });
        }
        if project.sources.is_empty() {
            return Err(BuildError::NoSources {
                project: project.name.clone(),
            });
        }
        toolchain.configure(project);
        let toolchain: Arc<dyn Toolchain> = Arc::from(toolchain);

        machine.enter(BuildState::ComputeStaleSet);
        fs::create_dir_all(&project.intermediate_dir)?;
        let plan = self.plan(project, toolchain.as_ref())?;
        if !self.options.dry_run {
            write_compile_commands(project, toolchain.as_ref(), &plan)?;
        }
        if plan.up_to_date() {
            info!(project = %project.name, "up to date");
            machine.enter(BuildState::Done);
            return Ok(report(None, true, toolchain.as_ref()));
        }

        let ctx = Arc::new(BuildContext::new(
            0,
            self.options.quiet,
            self.options.verbose,
            self.options.dry_run,
        ));
        for command in &project.pre_build {
            let task = CommandTask::new(BuildStage::PreBuild, command.clone(), &project.root);
            if !task.run(&ctx) {
                ctx.failure.fail(BuildStage::PreBuild);
                machine.enter(BuildState::Failed);
                return Err(BuildError::PreBuildFailed {
                    project: project.name.clone(),
                    command: command.clone(),
                });
            }
        }
        let plan = if project.pre_build.is_empty() {
            plan
        } else {
            self.plan(project, toolchain.as_ref())?
        };
        ctx.progress.set_length(plan.tracked_jobs() as u64);

        machine.enter(BuildState::BuildTaskGraph);
        let mut graph = GraphBuilder {
            scheduler: &self.scheduler,
            ctx: Arc::clone(&ctx),
            created: Vec::new(),
        };
        let host = match self.wire(&mut graph, project, &toolchain, &plan) {
            Ok(host) => host,
            Err(e) => {
                machine.enter(BuildState::Failed);
                graph.drain();
                return Err(e.into());
            }
        };

        machine.enter(BuildState::Execute);
        self.scheduler.enqueue(host)?;
        self.scheduler.wait(host)?;
        ctx.progress.finish_and_clear();

        if let Some(stage) = ctx.failure.failed_stage() {
            machine.enter(BuildState::Failed);
            debug!(project = %project.name, %stage, files = ?ctx.failed_files(), "build failed");
            return Err(BuildError::BuildFailed {
                project: project.name.clone(),
                configuration: project.configuration.clone(),
                platform: project.platform,
                errors: ctx.errors().max(1),
                warnings: ctx.warnings(),
            });
        }

        machine.enter(BuildState::PersistManifests);
        if !self.options.dry_run {
            let BuildPlan {
                mut link,
                link_inputs,
                version_info,
                ..
            } = plan;
            if let Some(mut info) = version_info {
                info.set_dependencies(Vec::new());
                info.store_manifest()?;
            }
            link.set_dependencies(link_inputs);
            link.store_manifest()?;
        }
        machine.enter(BuildState::Done);
        Ok(report(Some(&ctx), false, toolchain.as_ref()))
    }

    fn plan(
        &self,
        project: &ResolvedProject,
        toolchain: &dyn Toolchain,
    ) -> Result<BuildPlan, BuildError> {
        let config_hash = toolchain.configuration_hash();
        let output = toolchain.output_file_name(project);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut link_inputs = Vec::new();
        let mut files = Vec::new();
        let mut pch = None;

        if toolchain.requires_compile_step() {
            files = get_multiple_file_infos(
                &project.sources,
                &project.root,
                &project.intermediate_dir,
                toolchain.object_extension(),
                config_hash,
            )?;

            if let Some(header) = toolchain.precompiled_header(project) {
                if let Some(parent) = header.output.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut info =
                    BuilderFileInfo::new(header.input.clone(), header.output.clone(), config_hash);
                if info.refresh() {
                    for file in &mut files {
                        file.mark_stale(StaleReason::Forced);
                    }
                }
                pch = Some((header, info));
            }

            link_inputs.extend(files.iter().map(|f| f.output.clone()));
            if let Some(object) = pch.as_ref().and_then(|(h, _)| h.link_object.clone()) {
                link_inputs.push(object);
            }
        } else {
            link_inputs.extend(project.sources.iter().cloned());
        }

        let version_info = if toolchain.requires_version_info(project) {
            let script = toolchain.version_info_script(project);
            let object = toolchain.version_info_output(project);
            if let Some(info) = &project.version_info {
                let content = render_version_rc(project, info);
                let current = fs::read_to_string(&script).ok();
                if !self.options.dry_run && current.as_deref() != Some(content.as_str()) {
                    fs::write(&script, content)?;
                }
            }
            let mut info = BuilderFileInfo::new(script, object.clone(), config_hash);
            info.refresh();
            link_inputs.push(object);
            Some(info)
        } else {
            None
        };

        let mut link = BuilderFileInfo::new(output.clone(), output, config_hash);
        link.hash = input_set_hash(&link_inputs);
        link.stale_reason = match out_of_date_reason(&link) {
            Some(StaleReason::SourceChanged) => Some(StaleReason::InputsChanged),
            reason => reason,
        };
        link.out_of_date = link.stale_reason.is_some();

        for file in files.iter().filter(|f| f.out_of_date) {
            debug!(
                source = %file.source.display(),
                reason = %file.stale_reason.as_ref().map(ToString::to_string).unwrap_or_default(),
                "stale"
            );
        }

        Ok(BuildPlan {
            files,
            pch,
            version_info,
            link,
            link_inputs,
        })
    }

    /// Creates barriers and task jobs; returns the host job.
    fn wire(
        &self,
        graph: &mut GraphBuilder<'_>,
        project: &ResolvedProject,
        toolchain: &Arc<dyn Toolchain>,
        plan: &BuildPlan,
    ) -> Result<JobHandle, JobError> {
        let project_arc = Arc::new(project.clone());
        let ctx = Arc::clone(&graph.ctx);

        let pre_compile = graph.barrier()?;
        let pch_compile = graph.barrier()?;
        let compile = graph.barrier()?;
        let pre_link = graph.barrier()?;
        let link = graph.barrier()?;
        let post_build = graph.barrier()?;
        graph.depend(pch_compile, pre_compile)?;
        graph.depend(compile, pch_compile)?;

        // Precompiled header.
        let mut pch_header = None;
        let mut pch_info = None;
        if let Some((header, info)) = &plan.pch {
            let shared = Arc::new(Mutex::new(info.clone()));
            if info.out_of_date {
                let task = CompileTask::precompiled_header(
                    Arc::clone(toolchain),
                    Arc::clone(&project_arc),
                    Arc::clone(&ctx),
                    Arc::clone(&shared),
                    header.clone(),
                );
                let job = graph.task(Arc::new(task))?;
                graph.depend(job, pre_compile)?;
                graph.depend(pch_compile, job)?;
            }
            pch_header = Some(header.clone());
            pch_info = Some(shared);
        }

        // Translation units.
        let compile_tasks: Vec<Arc<CompileTask>> = plan
            .files
            .iter()
            .filter(|f| f.out_of_date)
            .map(|file| {
                Arc::new(CompileTask::new(
                    Arc::clone(toolchain),
                    Arc::clone(&project_arc),
                    Arc::clone(&ctx),
                    Arc::new(Mutex::new(file.clone())),
                    pch_header.clone(),
                    pch_info.clone(),
                ))
            })
            .collect();

        let accelerator = self
            .accelerator
            .as_ref()
            .filter(|a| compile_tasks.len() >= a.min_batch());
        if let Some(accelerator) = accelerator {
            let batch = AcceleratedBatchTask::new(
                Arc::clone(accelerator),
                Arc::clone(toolchain),
                Arc::clone(&project_arc),
                compile_tasks,
            );
            let job = graph.task(Arc::new(batch))?;
            graph.depend(job, pch_compile)?;
            graph.depend(compile, job)?;
        } else {
            for task in compile_tasks {
                let job = graph.task(task)?;
                graph.depend(job, pch_compile)?;
                graph.depend(compile, job)?;
            }
        }

        if let Some(info) = plan.version_info.as_ref().filter(|i| i.out_of_date)
            && let Some(action) =
                toolchain.compile_version_info_action(project, &info.source, &info.output)
        {
            let task = VersionInfoTask::new(Arc::clone(toolchain), action, info.source.clone());
            let job = graph.task(Arc::new(task))?;
            graph.depend(job, pch_compile)?;
            graph.depend(compile, job)?;
        }

        // Pre-link commands, link, post-build commands.
        let last = graph.commands(BuildStage::PreLink, &project.pre_link, &project.root, compile)?;
        graph.depend(pre_link, last)?;

        let output = plan.link.output.clone();
        let action = if project.output_type == OutputType::StaticLib {
            toolchain.archive_action(project, &plan.link_inputs, &output)
        } else {
            toolchain.link_action(project, &plan.link_inputs, &output)
        };
        let job = graph.task(Arc::new(LinkTask::new(Arc::clone(toolchain), action, output)))?;
        graph.depend(job, pre_link)?;
        graph.depend(link, job)?;

        let last = graph.commands(BuildStage::PostBuild, &project.post_build, &project.root, link)?;
        graph.depend(post_build, last)?;

        let host = graph.barrier()?;
        for barrier in [pre_compile, pch_compile, compile, pre_link, link, post_build] {
            graph.depend(host, barrier)?;
        }
        Ok(host)
    }
}

fn input_set_hash(inputs: &[PathBuf]) -> u64 {
    let mut hasher = Xxh3::new();
    for input in inputs {
        hasher.update(input.as_os_str().as_encoded_bytes());
        hasher.update(&[0]);
    }
    hasher.digest()
}

/// Compilation database written next to `kiln.toml`.
pub(crate) const COMPILE_COMMANDS: &str = "compile_commands.json";

/// Rewrites the compilation database only when an entry changed, so a no-op build
/// leaves the project tree untouched.
fn write_compile_commands(
    project: &ResolvedProject,
    toolchain: &dyn Toolchain,
    plan: &BuildPlan,
) -> std::io::Result<()> {
    if plan.files.is_empty() {
        return Ok(());
    }
    let pch = plan.pch.as_ref().map(|(header, _)| header);
    let entries: Vec<serde_json::Value> = plan
        .files
        .iter()
        .map(|file| {
            let action = toolchain.compile_action(project, file, pch);
            json!({
                "directory": project.root.to_string_lossy(),
                "command": action.command_line(),
                "file": file.source.to_string_lossy(),
                "output": file.output.to_string_lossy(),
            })
        })
        .collect();
    let content = serde_json::to_string_pretty(&entries).map_err(std::io::Error::other)?;
    let path = project.root.join(COMPILE_COMMANDS);
    if fs::read_to_string(&path).ok().as_deref() == Some(content.as_str()) {
        return Ok(());
    }
    fs::write(path, content)
}

/// Resolves, configures and builds the project in `root` (members first for an
/// aggregate). One report per built project.
pub fn build_project(
    config: &KilnConfig,
    root: &Path,
    options: &BuildOptions,
) -> anyhow::Result<Vec<BuildReport>> {
    let threads = options.jobs.unwrap_or_else(JobScheduler::default_threads);
    let scheduler = Arc::new(JobScheduler::new(threads).context("failed to start worker pool")?);
    let registry = ToolchainRegistry::with_defaults(
        Some(ToolCache::default_path()),
        options.refresh_toolchains,
    );
    let mut reports = Vec::new();
    build_tree(config, root, options, &scheduler, &registry, &mut reports)?;
    Ok(reports)
}

fn build_tree(
    config: &KilnConfig,
    root: &Path,
    options: &BuildOptions,
    scheduler: &Arc<JobScheduler>,
    registry: &ToolchainRegistry,
    reports: &mut Vec<BuildReport>,
) -> anyhow::Result<()> {
    let project = config
        .resolve(root, &options.configuration, Platform::host())
        .with_context(|| format!("failed to resolve {}", root.display()))?;

    if project.output_type == OutputType::Aggregate {
        for member in &project.members {
            let member_config = load_config(member)?;
            build_tree(&member_config, member, options, scheduler, registry, reports)?;
        }
        return Ok(());
    }

    let preferred = options.toolchain.as_deref().or(project.toolset.as_deref());
    let toolchain = registry
        .resolve(project.language, project.platform, preferred)
        .map_err(|source| BuildError::ToolchainUnavailable {
            project: project.name.clone(),
            source,
        })?;

    let mut builder = Builder::new(Arc::clone(scheduler), options.clone());
    if options.use_accelerator && project.accelerator.enabled {
        let mut accelerator = ScriptAccelerator::from_config(&project.accelerator);
        if accelerator.init() {
            builder = builder.with_accelerator(Arc::new(accelerator));
        } else {
            println!(
                "{} Accelerator '{}' not found; compiling locally",
                "!".yellow(),
                project.accelerator.program
            );
        }
    }

    if !options.quiet {
        println!(
            "{} Building {} ({}, {}) with {}",
            "*".cyan(),
            project.name.bold(),
            project.configuration,
            project.platform,
            toolchain.description()
        );
    }
    reports.push(builder.build(&project, toolchain)?);
    Ok(())
}

pub fn print_report(report: &BuildReport) {
    if report.up_to_date {
        println!("{} {} is up to date", "✓".green(), report.project);
        return;
    }
    let mut summary = format!(
        "{} Built {} in {:.2?} ({} compiled",
        "✓".green(),
        report.project,
        report.elapsed,
        report.compiled
    );
    if report.warnings > 0 {
        summary.push_str(&format!(", {} warning(s)", report.warnings));
    }
    summary.push(')');
    println!("{summary}");
}
