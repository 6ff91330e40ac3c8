use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the flow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running steps within one batch.
    pub max_parallel_steps: usize,
    pub auto_resume_interval_ms: u64,
    /// Reload-and-retry attempts for operator commands that lose a CAS race.
    pub command_conflict_retries: u32,
    pub event_buffer_size: usize,
    pub shutdown_grace_ms: u64,
    pub recover_on_start: bool,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, flowcore::FlowError> {
        let config = serde_json::from_reader(std::fs::File::open(path)?)?;
        Ok(config)
    }

    pub fn auto_resume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_resume_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 10,
            auto_resume_interval_ms: 30_000,
            command_conflict_retries: 3,
            event_buffer_size: 1000,
            shutdown_grace_ms: 10_000,
            recover_on_start: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_parallel_steps": 2}"#).unwrap();
        assert_eq!(config.max_parallel_steps, 2);
        assert_eq!(config.command_conflict_retries, 3);
        assert!(config.recover_on_start);
    }
}
