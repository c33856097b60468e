use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;

use crate::{
    audio::{AudioFormat, AudioFrameCallback, DrainedCallback},
    config::DriverConfig,
    demux::{self, DemuxContext, Shared},
    error::IngestError,
    frame::VideoFrame,
    input::{InputOptions, MediaInput, MediaKind},
    output::{MediaOutput, RemuxSource},
    packet::RemuxStats,
    pool::BackingPool,
    status::Status,
    sync::Side,
};

/// Result of a non-blocking look at the video queue.
pub struct VideoFramePoll {
    pub frame: Option<VideoFrame>,
    /// False once every demux thread has exited; no more frames will come.
    pub producers_alive: bool,
}

/// Opens the inputs (and optionally a remux output), runs one demux thread
/// per input and hands decoded frames to consumers.
///
/// Everything is opened first, then [`MediaDriver::start`] rolls the threads.
/// The driver is meant to be shared behind an `Arc` between the thread that
/// consumes video and whoever registers audio consumers.
pub struct MediaDriver {
    shared: Arc<Shared>,
    inputs: Mutex<Vec<MediaInput>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    empty_queue_warned: AtomicBool,
}

impl MediaDriver {
    pub fn new(config: DriverConfig, status: Status) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, status)),
            inputs: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            empty_queue_warned: AtomicBool::new(false),
        }
    }

    pub fn open_input_media(&self, options: &InputOptions, kind: MediaKind) -> anyhow::Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(IngestError::logic("inputs must be opened before start()"));
        }
        let mut inputs = self.inputs.lock();
        let sync = &self.shared.sync;
        match kind {
            MediaKind::Video if sync.is_active(Side::Video) => {
                return Err(IngestError::logic("a video input is already open"));
            }
            MediaKind::Audio if sync.is_active(Side::Audio) => {
                return Err(IngestError::logic("an audio stream is already open"));
            }
            _ => {}
        }
        let try_audio = kind == MediaKind::Video && options.try_audio;
        if try_audio && sync.is_active(Side::Audio) {
            log::debug!("audio already open, not looking for audio in {}", options.path);
        }
        let input = MediaInput::open(options, kind, try_audio && !sync.is_active(Side::Audio))?;

        if let Some(video) = input.video() {
            let pool = BackingPool::new(
                video.width,
                video.height,
                self.shared.config.initial_backings,
            );
            if self.shared.pool.set(Arc::new(pool)).is_err() {
                return Err(IngestError::logic("frame backing pool already exists"));
            }
            sync.activate(Side::Video);
        }
        if input.has_audio() {
            sync.activate(Side::Audio);
        }
        if input.is_low_latency() {
            self.shared.low_latency.store(true, Ordering::SeqCst);
        }
        inputs.push(input);
        Ok(())
    }

    /// Remuxes the opened video stream, plus the audio stream if any, into
    /// `path`. Must be called after the inputs are open and before `start`.
    pub fn open_output_media(&self, path: &str) -> anyhow::Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(IngestError::logic("output must be opened before start()"));
        }
        if self.shared.output.get().is_some() {
            return Err(IngestError::logic("an output is already open"));
        }
        let sources: Vec<RemuxSource> = {
            let inputs = self.inputs.lock();
            let mut sources = Vec::new();
            for (id, input) in inputs.iter().enumerate() {
                if let Some(video) = input.video() {
                    sources.push(RemuxSource {
                        input: id,
                        stream: video.decoder.stream().clone(),
                        offset: video.correction.offset(),
                    });
                }
                if let Some(audio) = input.audio() {
                    sources.push(RemuxSource {
                        input: id,
                        stream: audio.decoder.stream().clone(),
                        offset: audio.correction.offset(),
                    });
                }
            }
            sources
        };
        let output = MediaOutput::open(path, &sources, &self.shared.status)?;
        if self.shared.output.set(Arc::new(output)).is_err() {
            return Err(IngestError::logic("an output is already open"));
        }
        Ok(())
    }

    /// Rolls one demux thread per opened input.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(IngestError::logic("demux threads are already rolling"));
        }
        let inputs: Vec<MediaInput> = self.inputs.lock().drain(..).collect();
        if inputs.is_empty() {
            return Err(IngestError::logic("no input has been opened"));
        }
        if !self.is_audio_input_present() {
            log::warn!("no audio stream is present, continuing with video only");
        }
        let mut threads = self.threads.lock();
        for (id, input) in inputs.into_iter().enumerate() {
            threads.push(demux::spawn(DemuxContext::new(id, input, self.shared.clone()))?);
        }
        Ok(())
    }

    pub fn poll_for_next_video_frame(&self) -> VideoFramePoll {
        let producers_alive = self.shared.alive.load(Ordering::SeqCst) > 0;
        VideoFramePoll {
            frame: self.shared.pop_video_frame(),
            producers_alive,
        }
    }

    /// Blocks until a frame is available. `None` once every demux thread has
    /// stopped and nothing is left in the queue.
    pub fn wait_for_next_video_frame(&self) -> Option<VideoFrame> {
        let poll = self.shared.config.poll_interval();
        loop {
            let VideoFramePoll {
                frame,
                producers_alive,
            } = self.poll_for_next_video_frame();
            if frame.is_some() || !producers_alive {
                return frame;
            }
            if !self.empty_queue_warned.swap(true, Ordering::Relaxed) {
                log::warn!("video consumer is polling an empty queue, demuxing is behind");
            }
            std::thread::sleep(poll);
        }
    }

    pub fn release_video_frame(&self, frame: VideoFrame) -> anyhow::Result<()> {
        self.shared.pool()?.release(frame.backing())
    }

    /// Adds an audio consumer. `on_frame` receives resampled frames in
    /// timestamp order; `on_drained` is called exactly once when audio ends.
    pub fn register_audio_frame_callback(
        &self,
        format: AudioFormat,
        on_frame: AudioFrameCallback,
        on_drained: DrainedCallback,
    ) -> anyhow::Result<()> {
        self.shared.audio.register(format, on_frame, on_drained)?;
        Ok(())
    }

    pub fn is_audio_input_present(&self) -> bool {
        self.shared.sync.is_active(Side::Audio)
    }

    pub fn is_video_input_present(&self) -> bool {
        self.shared.sync.is_active(Side::Video)
    }

    pub fn is_low_latency(&self) -> bool {
        self.shared.is_low_latency()
    }

    /// Per output stream counts; empty when no output is open.
    pub fn remux_stats(&self) -> Vec<RemuxStats> {
        self.shared
            .output
            .get()
            .map(|output| output.stats())
            .unwrap_or_default()
    }

    /// `(allocated, in use)` backings.
    pub fn backing_stats(&self) -> Option<(usize, usize)> {
        self.shared
            .pool
            .get()
            .map(|pool| (pool.capacity(), pool.in_use()))
    }

    pub fn set_paused(&self, paused: bool) {
        self.shared.status.set_paused(paused);
    }

    /// Joins every demux thread, then finishes the output. Video frames must
    /// keep being consumed or this does not return.
    pub fn wait(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                log::error!("demux thread panicked outside its guard");
            }
        }
        if let Some(output) = self.shared.output.get() {
            output.close();
        }
    }

    /// Stops every thread without waiting for the inputs to drain.
    pub fn stop(&self) {
        self.shared.stop.cancel();
        self.wait();
        self.shared.clear_video_queue();
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        if !self.threads.lock().is_empty() {
            log::warn!("media driver dropped while demuxing, stopping");
        }
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_without_input_is_logic_error() {
        let driver = MediaDriver::new(DriverConfig::default(), Status::new());
        let err = driver.start().unwrap_err();
        assert!(matches!(IngestError::of(&err), Some(IngestError::Logic(_))));
        let err = driver.start().unwrap_err();
        assert!(matches!(IngestError::of(&err), Some(IngestError::Logic(_))));
    }

    #[test]
    fn test_poll_before_start() {
        let driver = MediaDriver::new(DriverConfig::default(), Status::new());
        let poll = driver.poll_for_next_video_frame();
        assert!(poll.frame.is_none());
        assert!(!poll.producers_alive);
        assert!(driver.wait_for_next_video_frame().is_none());
        assert!(driver.remux_stats().is_empty());
        assert!(driver.backing_stats().is_none());
    }

    #[test]
    fn test_output_needs_video() {
        crate::init().ok();
        let driver = MediaDriver::new(DriverConfig::default(), Status::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.nut");
        let err = driver
            .open_output_media(&path.to_string_lossy())
            .unwrap_err();
        assert!(matches!(IngestError::of(&err), Some(IngestError::Open(_))));
    }
}
