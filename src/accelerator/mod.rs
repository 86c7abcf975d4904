//! Alternate executors for batches of independent build actions.

mod script;

pub use script::{ScriptAccelerator, demultiplex, render_script};

use crate::build::action::{ActionOutput, BuildAction};
use crate::config::ResolvedProject;
use crate::toolchain::Toolchain;

pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    /// Checks the backend is usable. Returns availability.
    fn init(&mut self) -> bool;

    /// Smaller batches are compiled locally.
    fn min_batch(&self) -> usize {
        2
    }

    /// Runs every action and invokes each post-process callback in submission order.
    /// Returns `true` only if all of them succeeded.
    fn run_actions(
        &self,
        toolchain: &dyn Toolchain,
        project: &ResolvedProject,
        actions: &[BuildAction],
    ) -> bool;
}

/// Feeds each output to its action's post-process step. Every callback runs even after
/// a failure so all diagnostics are reported.
pub fn dispatch_results(actions: &[BuildAction], outputs: &[ActionOutput]) -> bool {
    let mut all_ok = actions.len() == outputs.len();
    for (action, output) in actions.iter().zip(outputs) {
        all_ok &= action.post_process(output);
    }
    all_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_dispatch_runs_every_callback_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let actions: Vec<BuildAction> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                BuildAction::new("cc", vec![], ".", format!("a{i}")).with_post_process(Arc::new(
                    move |out: &ActionOutput| {
                        order.lock().push(i);
                        out.success()
                    },
                ))
            })
            .collect();
        let outputs = vec![
            ActionOutput::new(0, ""),
            ActionOutput::new(1, "boom"),
            ActionOutput::new(0, ""),
        ];

        assert!(!dispatch_results(&actions, &outputs));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dispatch_rejects_short_output() {
        let actions = vec![BuildAction::new("cc", vec![], ".", "a")];
        assert!(!dispatch_results(&actions, &[]));
    }
}
