use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use ffmpeg_ingest::{
    IngestError,
    audio::AudioFormat,
    driver::MediaDriver,
    frame_server::{FrameServer, FrameStatus},
    input::MediaKind,
    packet::RemuxStats,
    status::Status,
};
use serde::Serialize;

use crate::config::PipelineConfig;

const PREPROCESS_CHECKPOINT: &str = "luma";

#[derive(Debug, Default, Serialize)]
pub struct PipelineSummary {
    pub video_frames: u64,
    pub retired_frames: usize,
    pub audio_samples: u64,
    pub remux: Vec<RemuxStats>,
}

/// Average of every channel of every pixel; stands in for a detector.
fn mean_intensity(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|v| *v as u64).sum::<u64>() as f64 / data.len() as f64
}

fn attach_stages(server: &Arc<FrameServer>, retired: &Arc<AtomicUsize>) -> anyhow::Result<()> {
    server.register_checkpoint(FrameStatus::Preprocess, PREPROCESS_CHECKPOINT)?;
    let stage = Arc::downgrade(server);
    server.on_frame_status_change(FrameStatus::Preprocess, move |_, timestamps| {
        let Some(server) = stage.upgrade() else {
            return;
        };
        let number = timestamps.frame_number;
        if let Ok(frame) = server.get_working_frame(number) {
            if let Some(images) = frame.images.as_ref() {
                log::trace!(
                    "frame #{} at {:.3}s mean intensity {:.1}",
                    number,
                    timestamps.start,
                    mean_intensity(&images.detection_frame.data)
                );
            }
        }
        if let Err(e) = server.set_checkpoint(number, FrameStatus::Preprocess, PREPROCESS_CHECKPOINT) {
            log::error!("cannot pass frame #{}: {}", number, e);
        }
    });
    let counter = retired.clone();
    server.on_frame_status_change(FrameStatus::Gone, move |_, _| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    Ok(())
}

/// Runs the whole ingest until the inputs drain or `status` signals an
/// emergency. Blocks the calling thread.
pub fn run(config: PipelineConfig, status: Status) -> anyhow::Result<PipelineSummary> {
    let ingest = config.ingest();
    let driver = MediaDriver::new(ingest.driver.clone(), status.clone());

    driver.open_input_media(&config.video_input, MediaKind::Video)?;
    if let Some(audio) = config.audio_input.as_ref() {
        driver.open_input_media(audio, MediaKind::Audio)?;
    }
    if let Some(output) = config.output.as_deref() {
        driver.open_output_media(output)?;
    }

    let audio_samples = Arc::new(AtomicU64::new(0));
    let samples = audio_samples.clone();
    driver.register_audio_frame_callback(
        AudioFormat::mono_s16(config.audio_sample_rate),
        Box::new(move |frame| {
            samples.fetch_add(frame.samples as u64, Ordering::Relaxed);
        }),
        Box::new(|| log::info!("audio drained")),
    )?;

    let server_config = ingest.frame_server.select(driver.is_low_latency()).clone();
    log::info!("frame server: {:?}", server_config);
    let server = Arc::new(FrameServer::new(server_config, status.clone()));
    let retired = Arc::new(AtomicUsize::new(0));
    attach_stages(&server, &retired)?;
    server.on_drained(|| log::info!("frame server drained"));
    server.spawn_worker(ingest.worker.idle_interval())?;

    driver.start()?;
    let mut video_frames = 0u64;
    while let Some(frame) = driver.wait_for_next_video_frame() {
        let inserted = server.insert(&frame);
        driver.release_video_frame(frame)?;
        match inserted {
            Ok(()) => video_frames += 1,
            Err(e) if matches!(IngestError::of(&e), Some(IngestError::Stopped)) => break,
            Err(e) => return Err(e),
        }
    }
    if status.is_emergency() {
        driver.stop();
    } else {
        driver.wait();
    }
    server.set_draining()?;
    server.join_worker();

    Ok(PipelineSummary {
        video_frames,
        retired_frames: retired.load(Ordering::Relaxed),
        audio_samples: audio_samples.load(Ordering::Relaxed),
        remux: driver.remux_stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_intensity() {
        assert_eq!(mean_intensity(&[]), 0.0);
        assert_eq!(mean_intensity(&[0, 10, 20]), 10.0);
    }

    #[test]
    fn test_missing_input_fails_to_open() {
        ffmpeg_ingest::init().unwrap();
        let config =
            PipelineConfig::from_json_str(r#"{"video_input": {"path": "/nonexistent/clip.y4m"}}"#)
                .unwrap();
        let err = run(config, Status::new()).unwrap_err();
        assert!(matches!(IngestError::of(&err), Some(IngestError::Open(_))));
    }
}
