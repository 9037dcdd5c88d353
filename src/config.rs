//! Configuration loading for the net toolchain and the simulated control core

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use crate::{Result, RccError};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CoreConfig {
    pub net: Option<NetConfig>,
    pub simulation: Option<SimulationConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetConfig {
    pub anonymous_prefix: Option<String>,
    pub realtime: Option<bool>,
    pub description_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimulationConfig {
    pub dispatch_queue: Option<usize>,
    pub rejected_types: Option<Vec<String>>,
}

impl CoreConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| RccError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: CoreConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let prefix = self.anonymous_prefix();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RccError::Config(format!(
                "anonymous_prefix must be a non-empty identifier, got '{}'",
                prefix
            )));
        }
        if self.dispatch_queue() == 0 {
            return Err(RccError::Config("simulation.dispatch_queue must be positive".to_string()));
        }
        Ok(())
    }

    /// Prefix for auto-generated primitive names
    pub fn anonymous_prefix(&self) -> &str {
        self.net
            .as_ref()
            .and_then(|n| n.anonymous_prefix.as_deref())
            .unwrap_or("p")
    }

    /// Realtime flag used when a command loads its net
    pub fn realtime(&self) -> bool {
        self.net.as_ref().and_then(|n| n.realtime).unwrap_or(true)
    }

    pub fn description_prefix(&self) -> &str {
        self.net
            .as_ref()
            .and_then(|n| n.description_prefix.as_deref())
            .unwrap_or("rccnet")
    }

    /// Capacity of the simulated engine's event dispatch queue
    pub fn dispatch_queue(&self) -> usize {
        self.simulation
            .as_ref()
            .and_then(|s| s.dispatch_queue)
            .unwrap_or(1024)
    }

    pub fn rejected_types(&self) -> Vec<String> {
        self.simulation
            .as_ref()
            .and_then(|s| s.rejected_types.clone())
            .unwrap_or_default()
    }
}
