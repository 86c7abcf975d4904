//! Shell-script accelerator backend.
//!
//! The batch is rendered into one POSIX script. Each action's combined output is tagged
//! line by line with `@@kiln:<index>@@`, followed by a tagged `@@exit <code>` marker.
//! The backend program receives the script path as its last argument and must relay the
//! tagged stream on stdout; lines may interleave freely.

use super::{Accelerator, dispatch_results};
use crate::build::action::{ActionOutput, BuildAction};
use crate::config::{AcceleratorConfig, ResolvedProject};
use crate::toolchain::Toolchain;
use crate::toolchain::finder::find_in_path;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

const TAG: &str = "@@kiln:";
const EXIT_MARKER: &str = "@@exit ";

pub struct ScriptAccelerator {
    program: String,
    args: Vec<String>,
    min_batch: usize,
    available: bool,
    batches: AtomicUsize,
}

impl ScriptAccelerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, min_batch: usize) -> Self {
        Self {
            program: program.into(),
            args,
            min_batch: min_batch.max(1),
            available: false,
            batches: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &AcceleratorConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.min_batch)
    }

    fn write_script(&self, project: &ResolvedProject, actions: &[BuildAction]) -> std::io::Result<PathBuf> {
        let dir = project.intermediate_dir.join("accelerator");
        fs::create_dir_all(&dir)?;
        let batch = self.batches.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("batch-{batch}.sh"));
        fs::write(&path, render_script(actions))?;
        Ok(path)
    }

    fn run_backend(&self, script: &Path) -> std::io::Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(script)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            debug!(
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "accelerator backend exited with failure"
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Accelerator for ScriptAccelerator {
    fn name(&self) -> &str {
        &self.program
    }

    fn init(&mut self) -> bool {
        self.available = Path::new(&self.program).is_file() || find_in_path(&self.program).is_some();
        self.available
    }

    fn min_batch(&self) -> usize {
        self.min_batch
    }

    fn run_actions(
        &self,
        toolchain: &dyn Toolchain,
        project: &ResolvedProject,
        actions: &[BuildAction],
    ) -> bool {
        debug!(
            backend = %self.program,
            toolchain = toolchain.name(),
            actions = actions.len(),
            "dispatching batch"
        );
        let raw = self
            .write_script(project, actions)
            .and_then(|script| self.run_backend(&script));

        let outputs = match raw {
            Ok(raw) => demultiplex(&raw, actions.len()),
            Err(e) => {
                warn!(backend = %self.program, "accelerator failed: {e}");
                actions
                    .iter()
                    .map(|action| {
                        ActionOutput::new(
                            -1,
                            format!("accelerator {} failed: {e} ({})\n", self.program, action.status),
                        )
                    })
                    .collect()
            }
        };
        dispatch_results(actions, &outputs)
    }
}

/// Single-quotes `arg` for a POSIX shell.
fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// The batch as a POSIX script; action `i` writes lines tagged `@@kiln:i@@`. Every
/// action runs in the background and the script waits for all of them.
pub fn render_script(actions: &[BuildAction]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for (index, action) in actions.iter().enumerate() {
        let command = std::iter::once(action.tool.to_string_lossy().into_owned())
            .chain(action.args.iter().cloned())
            .map(|arg| quote(&arg))
            .collect::<Vec<_>>()
            .join(" ");
        let dir = quote(&action.working_dir.to_string_lossy());
        script.push_str(&format!(
            "{{ (cd {dir} && {command}) 2>&1; echo \"{EXIT_MARKER}$?\"; }} | sed 's/^/{TAG}{index}@@/' &\n"
        ));
    }
    script.push_str("wait\n");
    script
}

/// Splits a tagged stream back into per-action outputs. Actions without an exit marker
/// are reported as failed with exit code -1.
pub fn demultiplex(raw: &str, count: usize) -> Vec<ActionOutput> {
    let mut outputs: Vec<(Option<i32>, String)> = vec![(None, String::new()); count];
    for line in raw.lines() {
        let Some(rest) = line.strip_prefix(TAG) else {
            continue;
        };
        let Some((index, content)) = rest.split_once("@@") else {
            continue;
        };
        let Some(slot) = index.parse::<usize>().ok().and_then(|i| outputs.get_mut(i)) else {
            continue;
        };
        match content.strip_prefix(EXIT_MARKER) {
            Some(code) => slot.0 = code.trim().parse().ok().or(Some(-1)),
            None => {
                slot.1.push_str(content);
                slot.1.push('\n');
            }
        }
    }
    outputs
        .into_iter()
        .map(|(code, mut output)| match code {
            Some(code) => ActionOutput::new(code, output),
            None => {
                output.push_str("accelerator returned no exit status\n");
                ActionOutput::new(-1, output)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_script_tags_each_action() {
        let actions = vec![
            BuildAction::new("cc", vec!["-c".into(), "a b.c".into()], "/p", "x"),
            BuildAction::new("cc", vec!["-c".into(), "d.c".into()], "/p", "y"),
        ];
        let script = render_script(&actions);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("(cd '/p' && 'cc' '-c' 'a b.c') 2>&1"));
        assert!(script.contains("sed 's/^/@@kiln:0@@/' &\n"));
        assert!(script.contains("sed 's/^/@@kiln:1@@/' &\n"));
        assert_eq!(script.lines().filter(|line| line.ends_with(" &")).count(), 2);
        assert!(script.ends_with("\nwait\n"));
    }

    #[test]
    fn test_demultiplex_interleaved() {
        let raw = "\
@@kiln:1@@b.c:1:1: warning: w
@@kiln:0@@a.c:2:2: error: e
noise from the backend
@@kiln:1@@@@exit 0
@@kiln:0@@@@exit 1
";
        let outputs = demultiplex(raw, 2);
        assert_eq!(outputs[0], ActionOutput::new(1, "a.c:2:2: error: e\n"));
        assert_eq!(outputs[1], ActionOutput::new(0, "b.c:1:1: warning: w\n"));
    }

    #[test]
    fn test_demultiplex_missing_marker_fails_action() {
        let outputs = demultiplex("@@kiln:0@@@@exit 0\n@@kiln:5@@ignored\n", 2);
        assert!(outputs[0].success());
        assert_eq!(outputs[1].exit_code, -1);
    }

    #[cfg(unix)]
    #[test]
    fn test_sh_backend_runs_batch() {
        use crate::config::{KilnConfig, Platform};
        use crate::toolchain::{ComposedToolchain, finder::ToolLocator};
        use crate::toolchain::gcc::{GccFlavor, GccStyle};
        use crate::toolchain::parser::GCC_PATTERNS;
        use parking_lot::Mutex;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let project = KilnConfig::parse("[project]\nname = \"p\"\n")
            .unwrap()
            .resolve(dir.path(), "debug", Platform::Linux)
            .unwrap();
        let toolchain = ComposedToolchain::new(
            "gcc",
            crate::config::Language::Cpp,
            Box::new(GccStyle::new(GccFlavor::Gnu)),
            &GCC_PATTERNS,
            ToolLocator::default(),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let action = |script: &str| {
            let seen = Arc::clone(&seen);
            BuildAction::new("sh", vec!["-c".into(), script.into()], dir.path(), "x")
                .with_post_process(Arc::new(move |out: &ActionOutput| {
                    seen.lock().push(out.clone());
                    out.success()
                }))
        };
        let actions = vec![action("echo one"), action("echo two 1>&2; exit 2")];

        let mut accelerator = ScriptAccelerator::new("sh", vec![], 2);
        assert!(accelerator.init());
        assert!(!accelerator.run_actions(&toolchain, &project, &actions));

        let seen = seen.lock();
        assert_eq!(seen[0], ActionOutput::new(0, "one\n"));
        assert_eq!(seen[1], ActionOutput::new(2, "two\n"));
    }

    #[test]
    fn test_missing_backend_fails_every_action() {
        let dir = tempfile::tempdir().unwrap();
        let project = crate::config::KilnConfig::parse("[project]\nname = \"p\"\n")
            .unwrap()
            .resolve(dir.path(), "debug", crate::config::Platform::Linux)
            .unwrap();
        let toolchain = crate::toolchain::ComposedToolchain::new(
            "gcc",
            crate::config::Language::Cpp,
            Box::new(crate::toolchain::gcc::GccStyle::new(
                crate::toolchain::gcc::GccFlavor::Gnu,
            )),
            &crate::toolchain::parser::GCC_PATTERNS,
            crate::toolchain::finder::ToolLocator::default(),
        );

        let mut accelerator = ScriptAccelerator::new("/no/such/backend", vec![], 2);
        assert!(!accelerator.init());
        let actions = vec![BuildAction::new("cc", vec![], dir.path(), "x")];
        assert!(!accelerator.run_actions(&toolchain, &project, &actions));
    }
}
