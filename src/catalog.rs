//! Statically registered job descriptors.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SECTION_COMMANDS: &str = "commands";
pub const SECTION_TESTS: &str = "tests";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("job definition has an empty id")]
    EmptyId,

    #[error("job {0} is defined more than once")]
    Duplicate(String),

    #[error("job {0} has an empty command")]
    EmptyCommand(String),
}

/// One runnable job as configured under `[[jobs]]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDefinition {
    pub id: String,
    /// Display name, defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Program followed by its fixed arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub supports_dry_run: bool,
    #[serde(default)]
    pub accepts_input: bool,
    #[serde(default = "default_section")]
    pub section: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_section() -> String {
    SECTION_COMMANDS.to_string()
}

impl JobDefinition {
    pub fn new(id: &str, command: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            supports_dry_run: false,
            accepts_input: false,
            section: default_section(),
            description: String::new(),
            working_dir: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    jobs: Vec<JobDefinition>,
}

impl Catalog {
    pub fn new(jobs: Vec<JobDefinition>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for job in &jobs {
            if job.id.trim().is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if !seen.insert(job.id.as_str()) {
                return Err(CatalogError::Duplicate(job.id.clone()));
            }
            if job.command.is_empty() || job.command[0].trim().is_empty() {
                return Err(CatalogError::EmptyCommand(job.id.clone()));
            }
        }
        Ok(Self { jobs })
    }

    pub fn get(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Jobs in configuration order.
    pub fn list(&self) -> &[JobDefinition] {
        &self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Distinct sections: `commands`, `tests`, then the rest alphabetically.
    pub fn sections(&self) -> Vec<String> {
        let mut sections: Vec<String> = self
            .jobs
            .iter()
            .map(|j| j.section.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sections.sort_by_key(|s| {
            let rank = match s.as_str() {
                SECTION_COMMANDS => 0,
                SECTION_TESTS => 1,
                _ => 2,
            };
            (rank, s.clone())
        });
        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_defaults() {
        let catalog = Catalog::new(vec![JobDefinition::new("scan", &["/bin/true"])]).unwrap();
        let job = catalog.get("scan").unwrap();
        assert_eq!(job.display_name(), "scan");
        assert_eq!(job.section, "commands");
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let dup = vec![
            JobDefinition::new("a", &["/bin/true"]),
            JobDefinition::new("a", &["/bin/false"]),
        ];
        assert!(matches!(Catalog::new(dup), Err(CatalogError::Duplicate(id)) if id == "a"));
        assert!(matches!(
            Catalog::new(vec![JobDefinition::new(" ", &["x"])]),
            Err(CatalogError::EmptyId)
        ));
        assert!(matches!(
            Catalog::new(vec![JobDefinition::new("a", &[])]),
            Err(CatalogError::EmptyCommand(_))
        ));
    }

    #[test]
    fn test_section_order() {
        let mut jobs = Vec::new();
        for (id, section) in [("a", "zeta"), ("b", "tests"), ("c", "commands"), ("d", "alpha")] {
            let mut job = JobDefinition::new(id, &["/bin/true"]);
            job.section = section.to_string();
            jobs.push(job);
        }
        let catalog = Catalog::new(jobs).unwrap();
        assert_eq!(catalog.sections(), vec!["commands", "tests", "alpha", "zeta"]);
    }

    #[test]
    fn test_deserialize_from_toml() {
        let job: JobDefinition = toml::from_str(
            r#"
            id = "sync"
            name = "Sync library"
            command = ["python3", "scripts/sync.py"]
            supports_dry_run = true
            section = "tests"
            "#,
        )
        .unwrap();
        assert_eq!(job.command.len(), 2);
        assert!(job.supports_dry_run);
        assert!(!job.accepts_input);
        assert_eq!(job.section, "tests");
    }
}
