//! Demux/decode threads, one per opened input.
//!
//! Every thread pumps its own input and decodes the streams it is
//! responsible for. Video frames land on the shared queue; audio is resampled
//! into each consumer's FIFO and released once the presented video timeline
//! has passed it.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    audio::AudioRegistry,
    config::DriverConfig,
    error::IngestError,
    frame::{RawFrame, VideoFrame},
    input::{AudioSession, MediaInput, ReadOutcome, VideoSession},
    output::MediaOutput,
    packet::RawPacket,
    pool::BackingPool,
    status::Status,
    sync::{Side, SyncController},
};

/// Consecutive failed reads (other than `EAGAIN`) after which an input is
/// treated as ended.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 64;

/// State shared by the driver, its demux threads and its consumers.
pub(crate) struct Shared {
    pub status: Status,
    /// Cancelled by `MediaDriver::stop` and by the emergency flag.
    pub stop: CancellationToken,
    pub config: DriverConfig,
    pub sync: SyncController,
    pub audio: AudioRegistry,
    pub pool: OnceLock<Arc<BackingPool>>,
    pub output: OnceLock<Arc<MediaOutput>>,
    pub low_latency: AtomicBool,
    pub alive: AtomicUsize,
    video_queue: Mutex<VecDeque<VideoFrame>>,
}

impl Shared {
    pub fn new(config: DriverConfig, status: Status) -> Self {
        Self {
            stop: status.child_token(),
            status,
            config,
            sync: SyncController::new(),
            audio: AudioRegistry::new(),
            pool: OnceLock::new(),
            output: OnceLock::new(),
            low_latency: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
            video_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pool(&self) -> anyhow::Result<&Arc<BackingPool>> {
        self.pool
            .get()
            .ok_or_else(|| IngestError::logic("no video input has been opened"))
    }

    pub fn is_low_latency(&self) -> bool {
        self.low_latency.load(Ordering::SeqCst)
    }

    pub fn video_queue_len(&self) -> usize {
        self.video_queue.lock().len()
    }

    fn release_all(&self, frames: Vec<VideoFrame>) {
        if frames.is_empty() {
            return;
        }
        let Ok(pool) = self.pool() else {
            return;
        };
        for frame in frames {
            if let Err(e) = pool.release(frame.backing()) {
                log::error!("cannot release dropped frame #{}: {}", frame.frame_number(), e);
            }
        }
    }

    /// Newest frames go to the front. In low-latency mode whatever was still
    /// waiting is dropped first.
    pub fn queue_video_frame(&self, frame: VideoFrame) {
        let stale: Vec<VideoFrame> = {
            let mut queue = self.video_queue.lock();
            let stale = if self.is_low_latency() {
                queue.drain(..).collect()
            } else {
                Vec::new()
            };
            queue.push_front(frame);
            stale
        };
        if !stale.is_empty() {
            log::debug!("low latency: dropped {} unconsumed frames", stale.len());
        }
        self.release_all(stale);
    }

    /// Oldest pending frame, or the newest one when frame dropping is on.
    pub fn pop_video_frame(&self) -> Option<VideoFrame> {
        let (frame, stale) = {
            let mut queue = self.video_queue.lock();
            let mut stale = Vec::new();
            if self.config.frame_drop {
                while queue.len() > 1 {
                    stale.extend(queue.pop_back());
                }
            }
            (queue.pop_back(), stale)
        };
        if !stale.is_empty() {
            log::debug!("frame drop: skipped {} frames", stale.len());
        }
        self.release_all(stale);
        if let Some(frame) = &frame {
            self.sync.note_presented(frame.estimated_end());
        }
        frame
    }

    /// Releases every frame still queued. Used at teardown.
    pub fn clear_video_queue(&self) {
        let frames: Vec<VideoFrame> = self.video_queue.lock().drain(..).collect();
        self.release_all(frames);
    }
}

struct AliveGuard(Arc<Shared>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct DemuxContext {
    id: usize,
    input: MediaInput,
    shared: Arc<Shared>,
    frames: u64,
    draining: bool,
    read_errors: u32,
    backpressure_warned: bool,
}

impl DemuxContext {
    pub fn new(id: usize, input: MediaInput, shared: Arc<Shared>) -> Self {
        Self {
            id,
            input,
            shared,
            frames: 0,
            draining: false,
            read_errors: 0,
            backpressure_warned: false,
        }
    }

    fn decodes_video(&self) -> bool {
        self.input.has_video()
    }

    fn decodes_audio(&self) -> bool {
        self.input.has_audio()
    }

    fn run(&mut self) -> anyhow::Result<()> {
        let poll = self.shared.config.poll_interval();
        log::debug!(
            "demux {} running for {} (video: {}, audio: {})",
            self.id,
            self.input.path(),
            self.decodes_video(),
            self.decodes_audio()
        );
        loop {
            if self.shared.stop.is_cancelled() {
                return Ok(());
            }
            if self.draining && self.can_exit() {
                return Ok(());
            }
            let pumped = if self.draining || self.held_back() {
                false
            } else {
                self.pump()?
            };
            if self.decodes_audio() {
                let limit = self.shared.sync.audio_release_limit(
                    self.shared.is_low_latency(),
                    self.shared.video_queue_len() == 0,
                );
                self.shared.audio.deliver(limit);
            }
            if !pumped {
                thread::sleep(poll);
            }
        }
    }

    /// Both sides have ended and nothing this context owns is pending.
    fn can_exit(&self) -> bool {
        self.shared.sync.all_draining()
            && (!self.decodes_video() || self.shared.video_queue_len() == 0)
            && (!self.decodes_audio() || !self.shared.audio.has_pending())
    }

    fn held_back(&mut self) -> bool {
        if self.decodes_video() {
            let full = self.shared.pool.get().is_some_and(|pool| pool.is_full());
            let paused = self.shared.status.is_paused();
            if full || paused {
                if !self.backpressure_warned {
                    log::warn!(
                        "demux {} waiting: {}",
                        self.id,
                        if paused {
                            "pipeline paused"
                        } else {
                            "all frame backings are in use"
                        }
                    );
                    self.backpressure_warned = true;
                }
                return true;
            }
            self.backpressure_warned = false;
        }
        let both = self.decodes_video() && self.decodes_audio();
        (self.decodes_video() && self.shared.sync.should_skip(Side::Video, both))
            || (self.decodes_audio() && self.shared.sync.should_skip(Side::Audio, both))
    }

    /// Reads and decodes one packet. Returns whether a packet was read.
    fn pump(&mut self) -> anyhow::Result<bool> {
        match self.input.read_packet() {
            ReadOutcome::Packet(packet) => {
                self.read_errors = 0;
                if let Some(output) = self.shared.output.get() {
                    output.enqueue(self.id, &packet);
                }
                self.decode_packet(&packet)?;
                Ok(true)
            }
            ReadOutcome::EndOfStream => {
                self.begin_draining()?;
                Ok(true)
            }
            ReadOutcome::Error(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(false)
            }
            ReadOutcome::Error(err) => {
                self.read_errors += 1;
                log::warn!("demux {} read error: {}", self.id, err);
                if self.read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    log::warn!(
                        "demux {} giving up on {} after {} failed reads",
                        self.id,
                        self.input.path(),
                        self.read_errors
                    );
                    self.begin_draining()?;
                }
                Ok(false)
            }
        }
    }

    fn decode_packet(&mut self, packet: &RawPacket) -> anyhow::Result<()> {
        let index = packet.index();
        let Self {
            input,
            shared,
            frames,
            ..
        } = self;
        if let Some(video) = input
            .video_mut()
            .filter(|video| video.decoder.stream_index() == index)
        {
            if let Err(e) = video.decoder.send_packet(packet.packet()) {
                log::warn!("video decode error, packet skipped: {}", e);
                return Ok(());
            }
            return receive_video(video, shared, frames);
        }
        if let Some(audio) = input
            .audio_mut()
            .filter(|audio| audio.decoder.stream_index() == index)
        {
            if let Err(e) = audio.decoder.send_packet(packet.packet()) {
                log::warn!("audio decode error, packet skipped: {}", e);
                return Ok(());
            }
            return receive_audio(audio, shared);
        }
        Ok(())
    }

    fn begin_draining(&mut self) -> anyhow::Result<()> {
        log::debug!("demux {} reached end of {}, draining", self.id, self.input.path());
        self.draining = true;
        let Self {
            input,
            shared,
            frames,
            ..
        } = self;
        if let Some(video) = input.video_mut() {
            match video.decoder.send_eof() {
                Ok(()) => receive_video(video, shared, frames)?,
                Err(e) => log::warn!("video decoder flush failed: {}", e),
            }
            shared.sync.set_draining(Side::Video);
        }
        if let Some(audio) = input.audio_mut() {
            match audio.decoder.send_eof() {
                Ok(()) => receive_audio(audio, shared)?,
                Err(e) => log::warn!("audio decoder flush failed: {}", e),
            }
            shared.audio.flush()?;
            shared.sync.set_draining(Side::Audio);
        }
        Ok(())
    }

    /// Runs on the demux thread after the loop ends, however it ended.
    fn finish(&mut self) {
        if self.decodes_video() {
            self.shared.sync.set_draining(Side::Video);
        }
        if self.decodes_audio() {
            self.shared.sync.set_draining(Side::Audio);
            self.shared.audio.close();
        } else if self.decodes_video() && !self.shared.sync.is_active(Side::Audio) {
            self.shared.audio.close();
        }
        log::debug!(
            "demux {} for {} done after {} video frames",
            self.id,
            self.input.path(),
            self.frames
        );
    }
}

fn receive_video(video: &mut VideoSession, shared: &Shared, frames: &mut u64) -> anyhow::Result<()> {
    loop {
        match video.decoder.receive_frame() {
            Ok(Some(RawFrame::Video(frame))) => on_video_frame(video, shared, frames, frame)?,
            Ok(Some(RawFrame::Audio(_))) => {}
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("receive video frame error: {}", e);
                return Ok(());
            }
        }
    }
}

fn on_video_frame(
    video: &mut VideoSession,
    shared: &Shared,
    frames: &mut u64,
    frame: ffmpeg_next::frame::Video,
) -> anyhow::Result<()> {
    if frame.width() != video.width || frame.height() != video.height || frame.format() != video.format
    {
        return Err(IngestError::decode(format!(
            "video format changed from {}x{} {:?} to {}x{} {:?}",
            video.width,
            video.height,
            video.format,
            frame.width(),
            frame.height(),
            frame.format()
        )));
    }
    let raw_pts = frame.pts().or(frame.timestamp()).unwrap_or(0);
    let duration = unsafe { (*frame.as_ptr()).duration };
    *frames += 1;
    let timestamps = video.correction.video_timestamps(*frames, raw_pts, duration);

    let pool = shared.pool()?;
    let backing = pool.acquire();
    if let Err(e) = backing.with_pixels_mut(|dst| video.scaler.run(&frame, dst)) {
        pool.release(&backing)?;
        return Err(IngestError::decode(format!("BGR24 conversion failed: {}", e)));
    }
    shared.sync.note_decoded(Side::Video, timestamps.estimated_end);
    shared.queue_video_frame(VideoFrame::new(timestamps, backing));
    Ok(())
}

fn receive_audio(audio: &mut AudioSession, shared: &Shared) -> anyhow::Result<()> {
    loop {
        match audio.decoder.receive_frame() {
            Ok(Some(RawFrame::Audio(mut frame))) => {
                let raw_pts = frame.pts().or(frame.timestamp()).unwrap_or(0);
                let (start, end) =
                    audio
                        .correction
                        .audio_span(raw_pts, frame.samples(), frame.rate());
                shared.sync.note_decoded(Side::Audio, end);
                shared.audio.resample(&mut frame, start, audio.layout_hint)?;
            }
            Ok(Some(RawFrame::Video(_))) => {}
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("receive audio frame error: {}", e);
                return Ok(());
            }
        }
    }
}

/// Starts the thread for `context`. Its errors and panics raise the emergency
/// flag.
pub(crate) fn spawn(mut context: DemuxContext) -> anyhow::Result<JoinHandle<()>> {
    let shared = context.shared.clone();
    shared.alive.fetch_add(1, Ordering::SeqCst);
    let spawned = thread::Builder::new()
        .name(format!("demux-{}", context.id))
        .spawn(move || {
            let _alive = AliveGuard(context.shared.clone());
            match panic::catch_unwind(AssertUnwindSafe(|| context.run())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("demux {} failed: {:#}", context.id, e);
                    context.shared.status.set_emergency();
                }
                Err(_) => {
                    log::error!("demux {} panicked", context.id);
                    context.shared.status.set_emergency();
                }
            }
            context.finish();
        });
    match spawned {
        Ok(handle) => Ok(handle),
        Err(e) => {
            shared.alive.fetch_sub(1, Ordering::SeqCst);
            Err(e.into())
        }
    }
}
