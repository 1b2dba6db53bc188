//! Project configuration

use serde::Deserialize;

use crate::collab::merge::RejectPolicy;
use crate::core::project::Project;

/// Strata configuration, loaded from `.strata/config.yaml` with environment
/// overrides
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database filename inside `.strata/`
    pub database: Option<String>,

    /// Drop branch inserts under a rejected system during merge
    pub reject_descendants: Option<bool>,
}

impl Config {
    /// Load configuration for a project, merging sources in priority order
    pub fn load(project: &Project) -> Self {
        let mut config = Config::default();

        let path = project.strata_dir().join("config.yaml");
        if path.exists() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(file_config) = serde_yml::from_str::<Config>(&contents) {
                    config.merge(file_config);
                }
            }
        }

        if let Ok(value) = std::env::var("STRATA_REJECT_DESCENDANTS") {
            config.reject_descendants = Some(value == "1" || value.eq_ignore_ascii_case("true"));
        }

        config
    }

    fn merge(&mut self, other: Config) {
        if other.database.is_some() {
            self.database = other.database;
        }
        if other.reject_descendants.is_some() {
            self.reject_descendants = other.reject_descendants;
        }
    }

    /// Database filename, defaulting to `strata.db`
    pub fn database_file(&self) -> &str {
        self.database.as_deref().unwrap_or("strata.db")
    }

    /// Merge reject policy derived from configuration
    pub fn reject_policy(&self) -> RejectPolicy {
        if self.reject_descendants.unwrap_or(false) {
            RejectPolicy::WithDescendants
        } else {
            RejectPolicy::SingleRow
        }
    }
}
