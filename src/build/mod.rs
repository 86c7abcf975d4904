pub mod action;
mod clean;
mod core;
mod feedback;
pub mod file_info;
pub mod manifest;
pub mod task;
mod utils;
mod watcher;

pub use action::{ActionOutput, BuildAction, PostProcess};
pub use clean::clean;
pub use self::core::{
    BuildError, BuildOptions, BuildReport, Builder, build_project, print_report,
};
pub use feedback::FeedbackAnalyzer;
pub use file_info::{
    BuilderDependencyInfo, BuilderFileInfo, StaleReason, calculate_file_hash, check_out_of_date,
    get_multiple_file_infos,
};
pub use manifest::{BuildManifest, ManifestError};
pub use task::{BuildContext, BuildStage, BuildTask, FailureFlag};
pub use utils::{find_project_root, load_config};
pub use watcher::watch;
