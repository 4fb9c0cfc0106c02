//! Settings of a flow build run.

use crate::result::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for [`crate::flow::FlowBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Engine steps recorded when an entry task starts.
    pub entry_step_budget: usize,
    /// Engine steps recorded for each VM branch continuation.
    pub continuation_step_budget: usize,
    /// Engine steps allowed when probing an exit-call target for a VM entry.
    pub probe_step_budget: usize,
    /// Treat unclassified handlers as task failures instead of recording them.
    pub diagnostic: bool,
    /// Upper bound on dequeued tasks in one run.
    pub max_tasks: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            entry_step_budget: 0x10000,
            continuation_step_budget: 0x4000,
            probe_step_budget: 0x1000,
            diagnostic: false,
            max_tasks: 0x4000,
        }
    }
}

impl BuildConfig {
    /// Parses a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| Error::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let budgets = [
            ("entry_step_budget", self.entry_step_budget),
            ("continuation_step_budget", self.continuation_step_budget),
            ("probe_step_budget", self.probe_step_budget),
            ("max_tasks", self.max_tasks),
        ];
        for (name, value) in budgets {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
