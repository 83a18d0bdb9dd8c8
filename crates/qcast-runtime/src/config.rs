//! Runtime configuration.
//!
//! Sources, lowest precedence first: [`RuntimeConfig::default`], a JSON
//! document, then `QCAST_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use qcast_core::{QcastError, Result};

/// Default number of auxiliary compute streams in the pool.
pub const DEFAULT_NUM_COMPUTE_STREAMS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Size of the compute stream pool.
    pub num_compute_streams: usize,
    /// Device the engine binds to.
    pub device_ordinal: usize,
    /// Create pool streams at the device's greatest priority.
    pub use_high_priority_streams: bool,
    /// Multiprocessor count reported by the host runtime.
    pub host_sm_count: usize,
    /// Compute capability reported by the host runtime (major * 10 + minor).
    pub host_sm_arch: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_compute_streams: DEFAULT_NUM_COMPUTE_STREAMS,
            device_ordinal: 0,
            use_high_priority_streams: true,
            host_sm_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            host_sm_arch: 90,
        }
    }
}

impl RuntimeConfig {
    /// Parse a (possibly partial) JSON document; missing keys keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: RuntimeConfig = serde_json::from_str(json)
            .map_err(|e| QcastError::invalid("runtime_config", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            QcastError::invalid("runtime_config", format!("{}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `QCAST_NUM_COMPUTE_STREAMS`, `QCAST_DEVICE`,
    /// `QCAST_HIGH_PRIORITY_STREAMS` and `QCAST_HOST_SM_COUNT`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = get("QCAST_NUM_COMPUTE_STREAMS") {
            self.num_compute_streams = parse_var("QCAST_NUM_COMPUTE_STREAMS", &v)?;
        }
        if let Some(v) = get("QCAST_DEVICE") {
            self.device_ordinal = parse_var("QCAST_DEVICE", &v)?;
        }
        if let Some(v) = get("QCAST_HIGH_PRIORITY_STREAMS") {
            self.use_high_priority_streams = match v.trim() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                other => {
                    return Err(QcastError::invalid(
                        "runtime_config",
                        format!("QCAST_HIGH_PRIORITY_STREAMS: expected a boolean, got {other:?}"),
                    ))
                }
            };
        }
        if let Some(v) = get("QCAST_HOST_SM_COUNT") {
            self.host_sm_count = parse_var("QCAST_HOST_SM_COUNT", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_compute_streams == 0 {
            return Err(QcastError::invalid(
                "runtime_config",
                "num_compute_streams must be at least 1",
            ));
        }
        if self.host_sm_count == 0 {
            return Err(QcastError::invalid("runtime_config", "host_sm_count must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| QcastError::invalid("runtime_config", format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.num_compute_streams, 4);
        assert_eq!(cfg.host_sm_arch, 90);
        assert!(cfg.use_high_priority_streams);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = RuntimeConfig::from_json_str(r#"{"num_compute_streams": 8}"#).unwrap();
        assert_eq!(cfg.num_compute_streams, 8);
        assert_eq!(cfg.device_ordinal, 0);
        assert!(RuntimeConfig::from_json_str(r#"{"num_compute_streams": 0}"#).is_err());
        assert!(RuntimeConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QCAST_NUM_COMPUTE_STREAMS", "2"),
            ("QCAST_HIGH_PRIORITY_STREAMS", "off"),
            ("QCAST_HOST_SM_COUNT", "16"),
        ]
        .into_iter()
        .collect();
        let cfg = RuntimeConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.num_compute_streams, 2);
        assert!(!cfg.use_high_priority_streams);
        assert_eq!(cfg.host_sm_count, 16);

        let bad = RuntimeConfig::default()
            .with_overrides(|k| (k == "QCAST_DEVICE").then(|| "gpu0".to_string()));
        assert!(bad.is_err());
    }
}
