use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for the controller and its front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    #[serde(with = "humantime_serde")]
    pub auto_step_period: Duration,
    pub job_slots: usize,
    /// Engine steps an execute run performs before the session polls commands again.
    pub execute_batch: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            auto_step_period: Duration::from_millis(500),
            job_slots: 2,
            execute_batch: 256,
        }
    }
}

impl ControlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: ControlConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(cfg.normalized())
    }

    /// `<config dir>/stepctl/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("stepctl").join("config.json"))
    }

    /// Load the explicit path if given, else the default path when it exists,
    /// else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load(p);
        }
        match Self::default_path() {
            Some(p) if p.exists() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    pub fn normalized(mut self) -> Self {
        self.job_slots = self.job_slots.max(1);
        self.execute_batch = self.execute_batch.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "auto_step_period": "50ms", "job_slots": 0 }"#).unwrap();
        let cfg = ControlConfig::load(&path).unwrap();
        assert_eq!(cfg.auto_step_period, Duration::from_millis(50));
        assert_eq!(cfg.job_slots, 1);
        assert_eq!(cfg.execute_batch, ControlConfig::default().execute_batch);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = ControlConfig::resolve(Some(missing.as_path())).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
