use std::path::Path;

use anyhow::Context;
use ffmpeg_ingest::{config::IngestConfig, input::InputOptions};
use serde::{Deserialize, Serialize};

fn default_audio_sample_rate() -> u32 {
    16000
}

/// What to ingest and where to remux it, loaded from the JSON file given on
/// the command line.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub video_input: InputOptions,
    #[serde(default)]
    pub audio_input: Option<InputOptions>,
    /// Remux destination; the container is guessed from the extension.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub low_latency: bool,
    /// Rate of the mono signed 16 bit audio handed to the audio consumer.
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    #[serde(default)]
    pub ingest: Option<IngestConfig>,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let mut config: PipelineConfig =
            serde_json::from_str(json).context("malformed pipeline config")?;
        if config.low_latency {
            config.video_input.low_latency = true;
            if let Some(audio) = config.audio_input.as_mut() {
                audio.low_latency = true;
            }
        }
        config.ingest().validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn ingest(&self) -> IngestConfig {
        self.ingest.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() -> anyhow::Result<()> {
        let config = PipelineConfig::from_json_str(r#"{"video_input": {"path": "/dev/video0"}}"#)?;
        assert_eq!(config.video_input.path, "/dev/video0");
        assert!(config.audio_input.is_none());
        assert!(config.output.is_none());
        assert_eq!(config.audio_sample_rate, 16000);
        assert_eq!(config.ingest(), IngestConfig::default());
        Ok(())
    }

    #[test]
    fn test_low_latency_reaches_inputs() -> anyhow::Result<()> {
        let config = PipelineConfig::from_json_str(
            r#"{
                "video_input": {"path": "/dev/video0", "format": "v4l2", "size": "640x480"},
                "audio_input": {"path": "default", "format": "pulse"},
                "output": "out.mkv",
                "low_latency": true,
                "ingest": {"driver": {"initial_backings": 8}}
            }"#,
        )?;
        assert!(config.video_input.low_latency);
        assert!(config.audio_input.as_ref().is_some_and(|a| a.low_latency));
        assert_eq!(config.ingest().driver.initial_backings, 8);
        Ok(())
    }

    #[test]
    fn test_invalid_ingest_section() {
        let result = PipelineConfig::from_json_str(
            r#"{"video_input": {"path": "x"}, "ingest": {"driver": {"initial_backings": 0}}}"#,
        );
        assert!(result.is_err());
    }
}
