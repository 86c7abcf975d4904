use crate::config::{CONFIG_FILE, KilnConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Loads `kiln.toml` from `dir`.
pub fn load_config(dir: &Path) -> Result<KilnConfig> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "{CONFIG_FILE} not found in {}.\n\n\
            Tip: every project directory needs a {CONFIG_FILE} with at least a [project] name.",
            dir.display()
        ));
    }
    KilnConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Walks up from `start` to the nearest directory holding `kiln.toml`.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let start = start
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", start.display()))?;
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
        .with_context(|| {
            format!(
                "{CONFIG_FILE} not found in {} or any parent directory",
                start.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_project_root_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[project]\nname = \"x\"\n").unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();

        let root = find_project_root(&nested).unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
        assert_eq!(load_config(&root).unwrap().project.name, "x");
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path()).unwrap_err().to_string();
        assert!(err.contains("kiln.toml not found"));
    }
}
