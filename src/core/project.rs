//! Project discovery and structure

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Represents a Strata project on disk
#[derive(Debug)]
pub struct Project {
    /// Root directory of the project (parent of `.strata/`)
    root: PathBuf,
}

impl Project {
    /// Find the project root by walking up from the current directory
    pub fn discover() -> Result<Self, ProjectError> {
        let current = std::env::current_dir().map_err(|e| ProjectError::Io(e.to_string()))?;
        Self::discover_from(&current)
    }

    /// Find the project root by walking up from the given directory
    pub fn discover_from(start: &Path) -> Result<Self, ProjectError> {
        let mut current = start
            .canonicalize()
            .map_err(|e| ProjectError::Io(e.to_string()))?;

        loop {
            if current.join(".strata").is_dir() {
                return Ok(Self { root: current });
            }
            if !current.pop() {
                return Err(ProjectError::NotFound {
                    searched_from: start.to_path_buf(),
                });
            }
        }
    }

    /// Create a new project structure at the given path
    pub fn init(path: &Path) -> Result<Self, ProjectError> {
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let strata_dir = root.join(".strata");
        if strata_dir.exists() {
            return Err(ProjectError::AlreadyExists(root));
        }

        std::fs::create_dir_all(&strata_dir).map_err(|e| ProjectError::Io(e.to_string()))?;
        std::fs::create_dir_all(root.join("branches"))
            .map_err(|e| ProjectError::Io(e.to_string()))?;
        std::fs::write(strata_dir.join("config.yaml"), Self::default_config())
            .map_err(|e| ProjectError::Io(e.to_string()))?;

        Ok(Self { root })
    }

    fn default_config() -> &'static str {
        r#"# Strata project configuration

# Database filename inside .strata/
# database: strata.db

# Drop branch inserts under a rejected system during merge (default: false)
# reject_descendants: false
"#
    }

    /// Project root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.strata/` directory
    pub fn strata_dir(&self) -> PathBuf {
        self.root.join(".strata")
    }

    /// Location of the main store database
    pub fn db_path(&self, filename: &str) -> PathBuf {
        self.strata_dir().join(filename)
    }

    /// Directory holding extracted branches
    pub fn branches_dir(&self) -> PathBuf {
        self.root.join("branches")
    }
}

/// Errors from project discovery and initialization
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("no Strata project found (searched from {searched_from} upwards); run 'strata init'")]
    NotFound { searched_from: PathBuf },

    #[error("a Strata project already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    Io(String),
}
