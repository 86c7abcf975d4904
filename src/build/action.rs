//! Concrete tool invocations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

/// Runs after the tool exits; returns `false` when the action must count as failed.
pub type PostProcess = Arc<dyn Fn(&ActionOutput) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    pub exit_code: i32,
    /// stdout followed by stderr.
    pub output: String,
}

impl ActionOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn spawn_failure(tool: &Path, error: &std::io::Error) -> Self {
        Self::new(-1, format!("failed to run {}: {error}\n", tool.display()))
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Clone)]
pub struct BuildAction {
    pub tool: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// One-line progress text, e.g. `Compiling main.cpp`.
    pub status: String,
    post_process: Option<PostProcess>,
}

impl fmt::Debug for BuildAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildAction")
            .field("tool", &self.tool)
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("status", &self.status)
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

impl BuildAction {
    pub fn new(
        tool: impl Into<PathBuf>,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            args,
            working_dir: working_dir.into(),
            status: status.into(),
            post_process: None,
        }
    }

    pub fn with_post_process(mut self, post_process: PostProcess) -> Self {
        self.post_process = Some(post_process);
        self
    }

    /// Shell-ish rendering for logs, dry runs and `compile_commands.json`.
    pub fn command_line(&self) -> String {
        std::iter::once(self.tool.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|arg| {
                if arg.is_empty() || arg.contains([' ', '\t', '"']) {
                    format!("\"{}\"", arg.replace('"', "\\\""))
                } else {
                    arg
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawns the tool and collects its output. Never fails; a spawn error becomes
    /// exit code -1.
    pub fn execute(&self) -> ActionOutput {
        debug!(command = %self.command_line(), "spawning");
        let result = Command::new(&self.tool)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output();

        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                ActionOutput::new(output.status.code().unwrap_or(-1), text)
            }
            Err(e) => ActionOutput::spawn_failure(&self.tool, &e),
        }
    }

    /// Invokes the post-process callback, or falls back to the exit code.
    pub fn post_process(&self, output: &ActionOutput) -> bool {
        match &self.post_process {
            Some(callback) => callback(output) && output.success(),
            None => output.success(),
        }
    }

    pub fn run(&self) -> bool {
        let output = self.execute();
        self.post_process(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_command_line_quotes_spaces() {
        let action = BuildAction::new(
            "g++",
            vec!["-c".into(), "my file.cpp".into(), "-DNAME=\"x\"".into()],
            ".",
            "Compiling",
        );
        assert_eq!(
            action.command_line(),
            r#"g++ -c "my file.cpp" "-DNAME=\"x\"""#
        );
    }

    #[test]
    fn test_spawn_failure_is_exit_minus_one() {
        let action = BuildAction::new("/definitely/not/a/tool", vec![], ".", "x");
        let output = action.execute();
        assert_eq!(output.exit_code, -1);
        assert!(output.output.contains("failed to run"));
        assert!(!action.run());
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_collects_stdout_then_stderr() {
        let action = BuildAction::new(
            "sh",
            vec!["-c".into(), "echo out; echo err 1>&2; exit 3".into()],
            ".",
            "x",
        );
        let output = action.execute();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.output, "out\nerr\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_post_process_sees_output() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let action = BuildAction::new("sh", vec!["-c".into(), "echo hi".into()], ".", "x")
            .with_post_process(Arc::new(move |out: &ActionOutput| {
                flag.store(out.output == "hi\n", Ordering::SeqCst);
                true
            }));

        assert!(action.run());
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_post_process_can_veto_success() {
        let action = BuildAction::new("x", vec![], ".", "x")
            .with_post_process(Arc::new(|_: &ActionOutput| false));
        assert!(!action.post_process(&ActionOutput::new(0, "")));
    }
}
