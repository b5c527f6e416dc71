//! Storage layout for recur
//!
//! All local state lives in one data directory (default `.recur/` in the
//! working directory, overridable with `--dir` / `RECUR_DIR`).
//!
//! # Directory Structure
//!
//! ```text
//! .recur/
//!   config.toml              # Engine configuration (optional)
//!   templates.json           # Template records (JSON repository adapter)
//!   templates.json.lock
//!   occurrences.json         # Occurrence records keyed by occurrence id
//!   occurrences.json.lock
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;

/// Default name of the data directory
pub const DATA_DIR: &str = ".recur";

pub const CONFIG_FILE: &str = "config.toml";
pub const TEMPLATES_FILE: &str = "templates.json";
pub const OCCURRENCES_FILE: &str = "occurrences.json";

/// Paths of the recur data directory
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage rooted at `<dir>/.recur`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DATA_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn templates_file(&self) -> PathBuf {
        self.root.join(TEMPLATES_FILE)
    }

    pub fn occurrences_file(&self) -> PathBuf {
        self.root.join(OCCURRENCES_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.root.exists()
    }

    /// Create the data directory and a default config if missing.
    ///
    /// Returns true when anything was created.
    pub fn init(&self) -> Result<bool> {
        let mut created = false;
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
            created = true;
        }
        let config_file = self.config_file();
        if !config_file.exists() {
            Config::default().save(&config_file)?;
            created = true;
        }
        Ok(created)
    }

    /// Load the config from this directory, or defaults when it has none
    pub fn load_config(&self) -> Result<Config> {
        Config::load_from_dir(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_lives_under_root() {
        let storage = Storage::in_dir(Path::new("/tmp/work"));
        assert_eq!(storage.root(), Path::new("/tmp/work/.recur"));
        assert_eq!(
            storage.occurrences_file(),
            PathBuf::from("/tmp/work/.recur/occurrences.json")
        );
        assert_eq!(
            storage.templates_file(),
            PathBuf::from("/tmp/work/.recur/templates.json")
        );
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::in_dir(dir.path());
        assert!(!storage.is_initialized());
        assert!(storage.init().expect("init"));
        assert!(storage.config_file().exists());
        assert!(!storage.init().expect("re-init"));
    }
}
