//! Schedulable build steps.
//!
//! A [`BuildTask`] owns one [`BuildAction`] (or a script) and knows its [`BuildStage`].
//! Tasks are wrapped into scheduler jobs by [`into_job`]; ordering comes only from the
//! job graph the builder wires up.

use super::action::{ActionOutput, BuildAction};
use super::feedback::FeedbackAnalyzer;
use super::file_info::BuilderFileInfo;
use crate::accelerator::Accelerator;
use crate::config::ResolvedProject;
use crate::jobs::JobFn;
use crate::toolchain::{PrecompiledHeader, Toolchain};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BuildStage {
    PreBuild,
    PreCompile,
    PchCompile,
    Compile,
    PreLink,
    Link,
    PostBuild,
}

impl BuildStage {
    pub const ALL: [BuildStage; 7] = [
        BuildStage::PreBuild,
        BuildStage::PreCompile,
        BuildStage::PchCompile,
        BuildStage::Compile,
        BuildStage::PreLink,
        BuildStage::Link,
        BuildStage::PostBuild,
    ];

    fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::PreBuild => "pre-build",
            BuildStage::PreCompile => "pre-compile",
            BuildStage::PchCompile => "precompiled header",
            BuildStage::Compile => "compile",
            BuildStage::PreLink => "pre-link",
            BuildStage::Link => "link",
            BuildStage::PostBuild => "post-build",
        };
        f.write_str(name)
    }
}

/// Earliest stage that failed during this build.
#[derive(Debug)]
pub struct FailureFlag(AtomicU8);

const NO_FAILURE: u8 = u8::MAX;

impl Default for FailureFlag {
    fn default() -> Self {
        Self(AtomicU8::new(NO_FAILURE))
    }
}

impl FailureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, stage: BuildStage) {
        self.0.fetch_min(stage as u8, Ordering::SeqCst);
    }

    pub fn failed_stage(&self) -> Option<BuildStage> {
        BuildStage::from_index(self.0.load(Ordering::SeqCst))
    }

    /// A stage strictly before `stage` failed; work in `stage` must not start.
    pub fn blocks(&self, stage: BuildStage) -> bool {
        self.failed_stage().is_some_and(|failed| failed < stage)
    }
}

/// Shared state of one build: failure flag, console output and counters.
pub struct BuildContext {
    pub failure: FailureFlag,
    pub progress: ProgressBar,
    pub quiet: bool,
    pub verbose: bool,
    pub dry_run: bool,
    compiled: AtomicUsize,
    linked: AtomicUsize,
    errors: AtomicUsize,
    warnings: AtomicUsize,
    failed_files: Mutex<Vec<PathBuf>>,
}

impl BuildContext {
    pub fn new(compile_jobs: usize, quiet: bool, verbose: bool, dry_run: bool) -> Self {
        let progress = if quiet || dry_run {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(compile_jobs as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        };
        Self {
            failure: FailureFlag::new(),
            progress,
            quiet,
            verbose,
            dry_run,
            compiled: AtomicUsize::new(0),
            linked: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            warnings: AtomicUsize::new(0),
            failed_files: Mutex::new(Vec::new()),
        }
    }

    /// Prints above the progress bar.
    pub fn println(&self, message: impl AsRef<str>) {
        if self.quiet && !self.verbose && !self.dry_run {
            return;
        }
        self.progress.suspend(|| println!("{}", message.as_ref()));
    }

    pub fn compiled(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }

    pub fn linked(&self) -> usize {
        self.linked.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn failed_files(&self) -> Vec<PathBuf> {
        self.failed_files.lock().clone()
    }

    /// Counts a finished tool run and echoes its output.
    fn report(&self, file: &BuilderFileInfo, success: bool, what: &str) {
        self.errors
            .fetch_add(file.diagnostics.errors, Ordering::SeqCst);
        self.warnings
            .fetch_add(file.diagnostics.warnings, Ordering::SeqCst);
        if !success && file.diagnostics.errors == 0 {
            // Non-zero exit without a recognised diagnostic still counts.
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        let output = file.clean_output.trim_end();
        if !success {
            self.failed_files.lock().push(file.source.clone());
            let mut message = format!("{} Error {what} {}", "x".red(), file.source.display());
            if !output.is_empty() {
                message.push_str(":\n");
                message.push_str(output);
            }
            if let Some(hint) = FeedbackAnalyzer::analyze(&file.diagnostics.messages, output) {
                message.push_str(&format!("\n{} {hint}", "?".cyan()));
            }
            self.println(message);
        } else if !output.is_empty() && (file.diagnostics.warnings > 0 || self.verbose) {
            self.println(format!(
                "{} Warning in {}:\n{output}",
                "!".yellow(),
                file.source.display()
            ));
        }
    }
}

pub trait BuildTask: Send + Sync {
    fn stage(&self) -> BuildStage;

    fn describe(&self) -> String;

    /// The process this task runs, if any. Post-process callbacks are attached.
    fn action(&self) -> Option<BuildAction>;

    /// Runs the task locally. A dry run prints the command instead.
    fn run(&self, ctx: &BuildContext) -> bool {
        match self.action() {
            Some(action) if ctx.dry_run => {
                ctx.println(action.command_line());
                true
            }
            Some(action) => {
                ctx.progress.set_message(action.status.clone());
                action.run()
            }
            None => true,
        }
    }
}

/// Runs `task` unless an earlier stage already failed.
pub fn execute(task: &dyn BuildTask, ctx: &BuildContext) {
    let stage = task.stage();
    if ctx.failure.blocks(stage) {
        trace!(task = %task.describe(), "skipped after earlier failure");
        return;
    }
    debug!(task = %task.describe(), %stage, "running");
    if !task.run(ctx) {
        debug!(task = %task.describe(), %stage, "failed");
        ctx.failure.fail(stage);
    }
}

pub fn into_job(task: Arc<dyn BuildTask>, ctx: Arc<BuildContext>) -> JobFn {
    Box::new(move || execute(task.as_ref(), &ctx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileKind {
    Source,
    PrecompiledHeader,
}

/// State shared between a compile task and the post-process callback of its action.
struct CompileState {
    toolchain: Arc<dyn Toolchain>,
    ctx: Arc<BuildContext>,
    file: Arc<Mutex<BuilderFileInfo>>,
    /// The precompiled header this file inherits dependencies from.
    inherit: Option<Arc<Mutex<BuilderFileInfo>>>,
}

impl CompileState {
    fn finish(&self, output: &ActionOutput) -> bool {
        let inherited = self.inherit.as_ref().map(|info| info.lock().clone());
        let mut file = self.file.lock();
        let healthy = self.toolchain.parse_output(&mut file, &output.output);
        if !healthy {
            warn!(source = %file.source.display(), "compiler crashed");
        }
        let success = output.success() && healthy;

        if success {
            let discovered = std::mem::take(&mut file.discovered);
            if let Err(e) =
                self.toolchain
                    .update_dependency_manifest(&mut file, &discovered, inherited.as_ref())
            {
                warn!(manifest = %file.manifest.display(), "could not write manifest: {e}");
            }
            file.discovered = discovered;
            file.out_of_date = false;
            self.ctx.compiled.fetch_add(1, Ordering::SeqCst);
        }
        self.ctx.report(&file, success, "compiling");
        self.ctx.progress.inc(1);
        success
    }
}

pub struct CompileTask {
    kind: CompileKind,
    project: Arc<ResolvedProject>,
    pch: Option<PrecompiledHeader>,
    state: Arc<CompileState>,
}

impl CompileTask {
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        project: Arc<ResolvedProject>,
        ctx: Arc<BuildContext>,
        file: Arc<Mutex<BuilderFileInfo>>,
        pch: Option<PrecompiledHeader>,
        inherit: Option<Arc<Mutex<BuilderFileInfo>>>,
    ) -> Self {
        Self {
            kind: CompileKind::Source,
            project,
            pch,
            state: Arc::new(CompileState {
                toolchain,
                ctx,
                file,
                inherit,
            }),
        }
    }

    /// Builds the precompiled header itself.
    pub fn precompiled_header(
        toolchain: Arc<dyn Toolchain>,
        project: Arc<ResolvedProject>,
        ctx: Arc<BuildContext>,
        file: Arc<Mutex<BuilderFileInfo>>,
        pch: PrecompiledHeader,
    ) -> Self {
        Self {
            kind: CompileKind::PrecompiledHeader,
            project,
            pch: Some(pch),
            state: Arc::new(CompileState {
                toolchain,
                ctx,
                file,
                inherit: None,
            }),
        }
    }

    pub fn source(&self) -> PathBuf {
        self.state.file.lock().source.clone()
    }
}

impl BuildTask for CompileTask {
    fn stage(&self) -> BuildStage {
        match self.kind {
            CompileKind::Source => BuildStage::Compile,
            CompileKind::PrecompiledHeader => BuildStage::PchCompile,
        }
    }

    fn describe(&self) -> String {
        format!("compile {}", self.source().display())
    }

    fn action(&self) -> Option<BuildAction> {
        let toolchain = &self.state.toolchain;
        let action = {
            let file = self.state.file.lock();
            match (self.kind, &self.pch) {
                (CompileKind::PrecompiledHeader, Some(pch)) => {
                    toolchain.compile_pch_action(&self.project, pch)
                }
                _ => toolchain.compile_action(&self.project, &file, self.pch.as_ref()),
            }
        };
        let state = Arc::clone(&self.state);
        Some(action.with_post_process(Arc::new(move |output: &ActionOutput| {
            state.finish(output)
        })))
    }
}

/// Runs the toolchain on an action whose output is not tracked per file.
fn run_untracked(
    ctx: &BuildContext,
    toolchain: &dyn Toolchain,
    action: &BuildAction,
    subject: &Path,
    what: &str,
) -> bool {
    if ctx.dry_run {
        ctx.println(action.command_line());
        return true;
    }
    ctx.progress.set_message(action.status.clone());
    let output = action.execute();
    let mut info = BuilderFileInfo::new(subject.to_path_buf(), subject.to_path_buf(), "");
    let healthy = toolchain.parse_output(&mut info, &output.output);
    let success = output.success() && healthy;
    ctx.report(&info, success, what);
    success
}

/// Link or archive step producing the final artifact.
pub struct LinkTask {
    toolchain: Arc<dyn Toolchain>,
    action: BuildAction,
    output: PathBuf,
}

impl LinkTask {
    pub fn new(toolchain: Arc<dyn Toolchain>, action: BuildAction, output: PathBuf) -> Self {
        Self {
            toolchain,
            action,
            output,
        }
    }
}

impl BuildTask for LinkTask {
    fn stage(&self) -> BuildStage {
        BuildStage::Link
    }

    fn describe(&self) -> String {
        format!("link {}", self.output.display())
    }

    fn action(&self) -> Option<BuildAction> {
        Some(self.action.clone())
    }

    fn run(&self, ctx: &BuildContext) -> bool {
        let ok = run_untracked(ctx, self.toolchain.as_ref(), &self.action, &self.output, "linking");
        if ok && !ctx.dry_run {
            ctx.linked.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }
}

/// Compiles the generated version resource script.
pub struct VersionInfoTask {
    toolchain: Arc<dyn Toolchain>,
    action: BuildAction,
    script: PathBuf,
}

impl VersionInfoTask {
    pub fn new(toolchain: Arc<dyn Toolchain>, action: BuildAction, script: PathBuf) -> Self {
        Self {
            toolchain,
            action,
            script,
        }
    }
}

impl BuildTask for VersionInfoTask {
    fn stage(&self) -> BuildStage {
        BuildStage::Compile
    }

    fn describe(&self) -> String {
        format!("version info {}", self.script.display())
    }

    fn action(&self) -> Option<BuildAction> {
        Some(self.action.clone())
    }

    fn run(&self, ctx: &BuildContext) -> bool {
        let ok = run_untracked(ctx, self.toolchain.as_ref(), &self.action, &self.script, "compiling");
        ctx.progress.inc(1);
        ok
    }
}

/// A user command from `[scripts]`. `*.rhai` files run in the embedded engine, anything
/// else goes through the platform shell.
pub struct CommandTask {
    stage: BuildStage,
    command: String,
    root: PathBuf,
}

impl CommandTask {
    pub fn new(stage: BuildStage, command: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            command: command.into(),
            root: root.into(),
        }
    }

    fn rhai_script(&self) -> Option<PathBuf> {
        let path = self.root.join(&self.command);
        (self.command.ends_with(".rhai") && path.is_file()).then_some(path)
    }
}

pub fn shell_action(command: &str, root: &Path) -> BuildAction {
    let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
    BuildAction::new(
        shell,
        vec![flag.to_string(), command.to_string()],
        root,
        format!("Running '{command}'"),
    )
}

impl BuildTask for CommandTask {
    fn stage(&self) -> BuildStage {
        self.stage
    }

    fn describe(&self) -> String {
        format!("{} command '{}'", self.stage, self.command)
    }

    fn action(&self) -> Option<BuildAction> {
        if self.rhai_script().is_some() {
            None
        } else {
            Some(shell_action(&self.command, &self.root))
        }
    }

    fn run(&self, ctx: &BuildContext) -> bool {
        if ctx.dry_run {
            ctx.println(format!("{} {}", self.stage, self.command));
            return true;
        }
        ctx.println(format!("   {} Running {}: '{}'", ">".magenta(), self.stage, self.command));

        if let Some(script) = self.rhai_script() {
            let engine = rhai::Engine::new();
            return match engine.run_file(script) {
                Ok(()) => true,
                Err(e) => {
                    ctx.println(format!("{} {} script failed: {e}", "x".red(), self.stage));
                    false
                }
            };
        }

        let output = shell_action(&self.command, &self.root).execute();
        if !output.output.trim().is_empty() {
            ctx.println(output.output.trim_end());
        }
        if !output.success() {
            ctx.println(format!(
                "{} {} command failed with exit code {}",
                "x".red(),
                self.stage,
                output.exit_code
            ));
        }
        output.success()
    }
}

/// The whole stale compile set handed to an [`Accelerator`] as one batch.
pub struct AcceleratedBatchTask {
    accelerator: Arc<dyn Accelerator>,
    toolchain: Arc<dyn Toolchain>,
    project: Arc<ResolvedProject>,
    tasks: Vec<Arc<CompileTask>>,
}

impl AcceleratedBatchTask {
    pub fn new(
        accelerator: Arc<dyn Accelerator>,
        toolchain: Arc<dyn Toolchain>,
        project: Arc<ResolvedProject>,
        tasks: Vec<Arc<CompileTask>>,
    ) -> Self {
        Self {
            accelerator,
            toolchain,
            project,
            tasks,
        }
    }
}

impl BuildTask for AcceleratedBatchTask {
    fn stage(&self) -> BuildStage {
        BuildStage::Compile
    }

    fn describe(&self) -> String {
        format!("{} files via {}", self.tasks.len(), self.accelerator.name())
    }

    fn action(&self) -> Option<BuildAction> {
        None
    }

    fn run(&self, ctx: &BuildContext) -> bool {
        let actions: Vec<BuildAction> = self.tasks.iter().filter_map(|t| t.action()).collect();
        if ctx.dry_run {
            for action in &actions {
                ctx.println(format!("[{}] {}", self.accelerator.name(), action.command_line()));
            }
            return true;
        }
        ctx.progress
            .set_message(format!("Distributing {} files", actions.len()));
        self.accelerator
            .run_actions(self.toolchain.as_ref(), &self.project, &actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeTask {
        stage: BuildStage,
        ok: bool,
        ran: AtomicBool,
    }

    impl FakeTask {
        fn new(stage: BuildStage, ok: bool) -> Self {
            Self {
                stage,
                ok,
                ran: AtomicBool::new(false),
            }
        }
    }

    impl BuildTask for FakeTask {
        fn stage(&self) -> BuildStage {
            self.stage
        }
        fn describe(&self) -> String {
            "fake task".to_string()
        }
        fn action(&self) -> Option<BuildAction> {
            None
        }
        fn run(&self, _ctx: &BuildContext) -> bool {
            self.ran.store(true, Ordering::SeqCst);
            self.ok
        }
    }

    fn ctx() -> BuildContext {
        BuildContext::new(0, true, false, false)
    }

    #[test]
    fn test_failure_flag_keeps_earliest_stage() {
        let flag = FailureFlag::new();
        assert_eq!(flag.failed_stage(), None);
        flag.fail(BuildStage::Link);
        flag.fail(BuildStage::Compile);
        flag.fail(BuildStage::PostBuild);
        assert_eq!(flag.failed_stage(), Some(BuildStage::Compile));

        assert!(!flag.blocks(BuildStage::Compile));
        assert!(flag.blocks(BuildStage::PreLink));
        assert!(!flag.blocks(BuildStage::PchCompile));
    }

    #[test]
    fn test_siblings_in_failing_stage_still_run() {
        let ctx = ctx();
        let bad = FakeTask::new(BuildStage::Compile, false);
        let good = FakeTask::new(BuildStage::Compile, true);
        let link = FakeTask::new(BuildStage::Link, true);

        execute(&bad, &ctx);
        execute(&good, &ctx);
        execute(&link, &ctx);

        assert!(good.ran.load(Ordering::SeqCst));
        assert!(!link.ran.load(Ordering::SeqCst));
        assert_eq!(ctx.failure.failed_stage(), Some(BuildStage::Compile));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_task_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();

        let ok = CommandTask::new(BuildStage::PostBuild, "touch marker", dir.path());
        assert!(ok.run(&ctx));
        assert!(dir.path().join("marker").exists());

        let bad = CommandTask::new(BuildStage::PreBuild, "exit 4", dir.path());
        assert!(!bad.run(&ctx));
    }

    #[test]
    fn test_rhai_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.rhai"), "let x = 40 + 2;").unwrap();
        std::fs::write(dir.path().join("bad.rhai"), "throw \"nope\";").unwrap();
        let ctx = ctx();

        let ok = CommandTask::new(BuildStage::PreBuild, "ok.rhai", dir.path());
        assert!(ok.action().is_none());
        assert!(ok.run(&ctx));
        assert!(!CommandTask::new(BuildStage::PreBuild, "bad.rhai", dir.path()).run(&ctx));
    }

    #[test]
    fn test_version_info_advances_progress() {
        use crate::toolchain::ComposedToolchain;
        use crate::toolchain::finder::ToolLocator;
        use crate::toolchain::gcc::{GccFlavor, GccStyle};
        use crate::toolchain::parser::GCC_PATTERNS;

        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(1, true, false, true);
        let toolchain: Arc<dyn Toolchain> = Arc::new(ComposedToolchain::new(
            "gcc",
            crate::config::Language::Cpp,
            Box::new(GccStyle::new(GccFlavor::Gnu)),
            &GCC_PATTERNS,
            ToolLocator::default(),
        ));
        let script = dir.path().join("version.rc");
        let action = BuildAction::new("windres", vec![], dir.path(), "version");
        let task = VersionInfoTask::new(toolchain, action, script);

        assert!(task.run(&ctx));
        assert_eq!(ctx.progress.position(), 1);
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(0, true, false, true);
        let task = CommandTask::new(BuildStage::PostBuild, "touch marker", dir.path());
        assert!(task.run(&ctx));
        assert!(!dir.path().join("marker").exists());
    }
}
