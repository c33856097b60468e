use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Tunables for the whole library. Every field has a default, so an empty
/// JSON object is a valid configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    pub frame_server: FrameServerModes,
    pub driver: DriverConfig,
    pub worker: WorkerConfig,
}

impl IngestConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: IngestConfig = serde_json::from_str(json)
            .map_err(|e| IngestError::invalid(format!("malformed ingest config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            IngestError::invalid(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.frame_server.low_latency.validate("low_latency")?;
        self.frame_server.offline.validate("offline")?;
        self.driver.validate()?;
        if self.worker.idle_interval_ms == 0 {
            return Err(IngestError::invalid("worker.idle_interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Frame server settings, one set per latency mode.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameServerModes {
    pub low_latency: FrameServerConfig,
    pub offline: FrameServerConfig,
}

impl FrameServerModes {
    pub fn select(&self, low_latency: bool) -> &FrameServerConfig {
        if low_latency {
            &self.low_latency
        } else {
            &self.offline
        }
    }
}

impl Default for FrameServerModes {
    fn default() -> Self {
        Self {
            low_latency: FrameServerConfig {
                detection_bounding_box: 320,
                detection_scale_factor: 0.5,
                max_queue_depth: Some(4),
            },
            offline: FrameServerConfig {
                detection_bounding_box: 0,
                detection_scale_factor: 0.5,
                max_queue_depth: None,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameServerConfig {
    /// Longest side of the detection copy in pixels. `0` means scale by
    /// `detection_scale_factor` instead.
    pub detection_bounding_box: u32,
    pub detection_scale_factor: f64,
    /// Insertion blocks while this many frames are in flight.
    pub max_queue_depth: Option<usize>,
}

impl Default for FrameServerConfig {
    fn default() -> Self {
        FrameServerModes::default().offline
    }
}

impl FrameServerConfig {
    fn validate(&self, mode: &str) -> anyhow::Result<()> {
        let factor = self.detection_scale_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(IngestError::invalid(format!(
                "frame_server.{}.detection_scale_factor must be in (0, 1], got {}",
                mode, factor
            )));
        }
        if self.max_queue_depth == Some(0) {
            return Err(IngestError::invalid(format!(
                "frame_server.{}.max_queue_depth must be positive",
                mode
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Backings allocated when the video input is opened.
    pub initial_backings: usize,
    /// When the consumer pops, everything but the newest pending frame is
    /// thrown away.
    pub frame_drop: bool,
    pub poll_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            initial_backings: 60,
            frame_drop: false,
            poll_interval_ms: 1,
        }
    }
}

impl DriverConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.initial_backings == 0 {
            return Err(IngestError::invalid("driver.initial_backings must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(IngestError::invalid("driver.poll_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub idle_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 10,
        }
    }
}

impl WorkerConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() -> anyhow::Result<()> {
        let config = IngestConfig::from_json_str("{}")?;
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.driver.initial_backings, 60);
        assert_eq!(config.driver.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.worker.idle_interval(), Duration::from_millis(10));
        Ok(())
    }

    #[test]
    fn test_partial_override() -> anyhow::Result<()> {
        let config = IngestConfig::from_json_str(
            r#"{"frame_server": {"offline": {"detection_scale_factor": 0.25}}, "driver": {"frame_drop": true}}"#,
        )?;
        assert_eq!(config.frame_server.offline.detection_scale_factor, 0.25);
        assert_eq!(config.frame_server.offline.detection_bounding_box, 0);
        assert_eq!(config.frame_server.low_latency.detection_bounding_box, 320);
        assert!(config.driver.frame_drop);
        assert_eq!(config.frame_server.select(true).max_queue_depth, Some(4));
        Ok(())
    }

    #[test]
    fn test_rejects_bad_scale_factor() {
        for factor in ["0.0", "1.5", "-0.2"] {
            let json = format!(
                r#"{{"frame_server": {{"low_latency": {{"detection_scale_factor": {}}}}}}}"#,
                factor
            );
            let err = IngestConfig::from_json_str(&json).unwrap_err();
            assert!(matches!(
                IngestError::of(&err),
                Some(IngestError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = IngestConfig::from_json_str("{\"driver\": 3}").unwrap_err();
        assert!(matches!(
            IngestError::of(&err),
            Some(IngestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ingest.json");
        std::fs::write(&path, r#"{"worker": {"idle_interval_ms": 25}}"#)?;
        let config = IngestConfig::from_file(&path)?;
        assert_eq!(config.worker.idle_interval_ms, 25);
        assert!(IngestConfig::from_file(dir.path().join("missing.json")).is_err());
        Ok(())
    }
}
