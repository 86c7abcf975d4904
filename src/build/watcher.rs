use super::core::{BuildOptions, COMPILE_COMMANDS, build_project, print_report};
use super::utils::load_config;
use anyhow::{Context, Result};
use colored::*;
use notify::{Config, Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;
use tracing::debug;

/// Rebuilds `root` whenever a source, include directory or `kiln.toml` changes.
pub fn watch(root: &Path, options: &BuildOptions) -> Result<()> {
    let config = load_config(root)?;
    let build_dir = root.join(
        config
            .project
            .intermediate_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("build")),
    );

    // Files the build itself writes never trigger a rebuild.
    let generated = [build_dir, root.join(COMPILE_COMMANDS)];

    let (tx, rx) = channel::<notify::Result<Event>>();
    let notify_config = Config::default().with_poll_interval(Duration::from_secs(1));
    let mut watcher = notify::RecommendedWatcher::new(tx, notify_config)?;

    let roots: Vec<PathBuf> = config
        .project
        .sources
        .iter()
        .chain(&config.project.includes)
        .map(|p| root.join(p))
        .filter(|p| p.exists())
        .collect();
    for path in &roots {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", path.display()))?;
    }
    watcher.watch(&root.join(crate::config::CONFIG_FILE), RecursiveMode::NonRecursive)?;
    println!(
        "{} Watching {} path(s) for changes...",
        "*".cyan(),
        roots.len() + 1
    );

    rebuild(root, options);

    while let Ok(event) = rx.recv() {
        let mut relevant = is_relevant(&event, &generated);
        // Debounce: swallow the burst an editor save produces.
        std::thread::sleep(Duration::from_millis(100));
        while let Ok(event) = rx.try_recv() {
            relevant |= is_relevant(&event, &generated);
        }
        if relevant {
            print!("\x1B[2J\x1B[1;1H");
            println!("{} File changed. Rebuilding...", "~".yellow());
            rebuild(root, options);
        }
    }
    Ok(())
}

fn is_relevant(event: &notify::Result<Event>, generated: &[PathBuf]) -> bool {
    match event {
        Ok(event) => {
            (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove())
                && !event
                    .paths
                    .iter()
                    .all(|p| generated.iter().any(|g| p.starts_with(g)))
        }
        Err(e) => {
            debug!("watch error: {e}");
            false
        }
    }
}

fn rebuild(root: &Path, options: &BuildOptions) {
    let result = load_config(root).and_then(|config| build_project(&config, root, options));
    match result {
        Ok(reports) => reports.iter().for_each(print_report),
        Err(e) => println!("{} Error: {e:#}", "x".red()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    fn generated() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/proj/build"),
            PathBuf::from("/proj").join(COMPILE_COMMANDS),
        ]
    }

    fn modified(paths: &[&str]) -> notify::Result<Event> {
        let event = Event::new(EventKind::Modify(ModifyKind::Any));
        Ok(paths.iter().fold(event, |e, p| e.add_path(PathBuf::from(p))))
    }

    #[test]
    fn test_source_edits_are_relevant() {
        assert!(is_relevant(&modified(&["/proj/src/main.cpp"]), &generated()));
        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/proj/src/new.cpp"));
        assert!(is_relevant(&Ok(created), &generated()));
    }

    #[test]
    fn test_build_outputs_are_ignored() {
        let generated = generated();
        assert!(!is_relevant(&modified(&["/proj/build/debug/obj/src/main.cpp.o"]), &generated));
        assert!(!is_relevant(&modified(&["/proj/compile_commands.json"]), &generated));
        assert!(!is_relevant(
            &modified(&["/proj/compile_commands.json", "/proj/build/debug/demo"]),
            &generated
        ));
        assert!(is_relevant(
            &modified(&["/proj/compile_commands.json", "/proj/src/main.cpp"]),
            &generated
        ));
    }

    #[test]
    fn test_access_events_are_ignored() {
        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/proj/src/main.cpp"));
        assert!(!is_relevant(&Ok(read), &generated()));
    }
}
