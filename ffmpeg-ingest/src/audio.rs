//! Audio consumers and their resampled frame queues.
//!
//! Each registered consumer asks for its own format. Decoded audio is
//! resampled once per consumer and parked in that consumer's FIFO until the
//! synchronization controller says the video timeline has caught up, at which
//! point the frames are handed to the consumer's callback.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ffmpeg_next::{ChannelLayout, format::Sample, frame::Audio};
use parking_lot::Mutex;

use crate::{
    error::IngestError,
    frame::AudioFrame,
    resampler::{Resampler, source_layout},
};

pub type AudioFrameCallback = Box<dyn FnMut(AudioFrame) + Send>;
pub type DrainedCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AudioFormat {
    pub layout: ChannelLayout,
    pub sample_rate: u32,
    pub sample_format: Sample,
}

impl AudioFormat {
    pub fn new(layout: ChannelLayout, sample_rate: u32, sample_format: Sample) -> Self {
        Self {
            layout,
            sample_rate,
            sample_format,
        }
    }

    /// Mono, packed signed 16 bit.
    pub fn mono_s16(sample_rate: u32) -> Self {
        Self::new(
            ChannelLayout::MONO,
            sample_rate,
            Sample::I16(ffmpeg_next::format::sample::Type::Packed),
        )
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sample_rate == 0 {
            return Err(IngestError::invalid("audio consumer sample rate must be positive"));
        }
        if self.layout.is_empty() {
            return Err(IngestError::invalid("audio consumer channel layout is empty"));
        }
        if self.sample_format == Sample::None {
            return Err(IngestError::invalid("audio consumer sample format is unset"));
        }
        Ok(())
    }
}

pub struct AudioFrameHandler {
    format: AudioFormat,
    resampler: Mutex<Option<Resampler>>,
    pending: Mutex<VecDeque<AudioFrame>>,
    next_timestamp: Mutex<f64>,
    on_frame: Mutex<AudioFrameCallback>,
    on_drained: Mutex<Option<DrainedCallback>>,
    drained: AtomicBool,
}

impl AudioFrameHandler {
    fn new(format: AudioFormat, on_frame: AudioFrameCallback, on_drained: DrainedCallback) -> Self {
        Self {
            format,
            resampler: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            next_timestamp: Mutex::new(0.0),
            on_frame: Mutex::new(on_frame),
            on_drained: Mutex::new(Some(on_drained)),
            drained: AtomicBool::new(false),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Resamples one decoded frame into this consumer's queue. The resampler
    /// is built from the first frame seen.
    pub fn resample(
        &self,
        frame: &mut Audio,
        timestamp: f64,
        layout_hint: Option<ChannelLayout>,
    ) -> anyhow::Result<()> {
        let layout = source_layout(frame, layout_hint)?;
        if layout.channels() != frame.channels() as i32 {
            return Err(IngestError::decode(format!(
                "channel layout with {} channels does not fit a {} channel frame",
                layout.channels(),
                frame.channels()
            )));
        }
        frame.set_channel_layout(layout);

        let mut resampler = self.resampler.lock();
        if resampler.is_none() {
            *resampler = Some(Resampler::new(
                frame.format(),
                layout,
                frame.rate(),
                self.format.sample_format,
                self.format.layout,
                self.format.sample_rate,
            )?);
        }
        let Some(resampler) = resampler.as_mut() else {
            return Err(IngestError::logic("resampler missing after creation"));
        };
        let out = resampler.convert(frame)?;
        drop(resampler);
        self.enqueue(timestamp, out.data, out.samples);
        Ok(())
    }

    /// Pushes out the samples still held back by the resampler.
    pub fn flush(&self) -> anyhow::Result<()> {
        let out = match self.resampler.lock().as_mut() {
            Some(resampler) => resampler.flush()?,
            None => None,
        };
        if let Some(out) = out {
            let timestamp = *self.next_timestamp.lock();
            self.enqueue(timestamp, out.data, out.samples);
        }
        Ok(())
    }

    fn enqueue(&self, timestamp: f64, data: bytes::Bytes, samples: usize) {
        *self.next_timestamp.lock() = timestamp + samples as f64 / self.format.sample_rate as f64;
        if samples == 0 {
            return;
        }
        self.pending.lock().push_back(AudioFrame {
            timestamp,
            data,
            samples,
        });
    }

    /// Hands pending frames older than `limit` to the consumer, or all of them
    /// when `limit` is `None`. Returns how many were delivered.
    pub fn deliver(&self, limit: Option<f64>) -> usize {
        let mut delivered = 0;
        loop {
            if self.is_drained() {
                break;
            }
            let next = {
                let mut pending = self.pending.lock();
                match pending.front() {
                    Some(frame) if limit.is_none_or(|limit| frame.timestamp < limit) => {
                        pending.pop_front()
                    }
                    _ => None,
                }
            };
            let Some(frame) = next else {
                break;
            };
            (self.on_frame.lock())(frame);
            delivered += 1;
        }
        delivered
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// Fires the drained notification. Only the first call has any effect.
    fn mark_drained(&self) {
        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            log::warn!("{} audio frames discarded undelivered", dropped);
        }
        if let Some(callback) = self.on_drained.lock().take() {
            callback();
        }
    }
}

struct RegistryState {
    handlers: Vec<Arc<AudioFrameHandler>>,
    closed: bool,
}

/// Every audio consumer registered with one driver.
pub struct AudioRegistry {
    state: Mutex<RegistryState>,
}

impl Default for AudioRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                handlers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Adds a consumer. If audio has already ended the consumer is told so
    /// straight away.
    pub fn register(
        &self,
        format: AudioFormat,
        on_frame: AudioFrameCallback,
        on_drained: DrainedCallback,
    ) -> anyhow::Result<Arc<AudioFrameHandler>> {
        format.validate()?;
        let handler = Arc::new(AudioFrameHandler::new(format, on_frame, on_drained));
        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                state.handlers.push(handler.clone());
            }
            state.closed
        };
        if closed {
            log::debug!("audio consumer registered after audio ended");
            handler.mark_drained();
        }
        Ok(handler)
    }

    fn snapshot(&self) -> Vec<Arc<AudioFrameHandler>> {
        self.state.lock().handlers.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resample(
        &self,
        frame: &mut Audio,
        timestamp: f64,
        layout_hint: Option<ChannelLayout>,
    ) -> anyhow::Result<()> {
        for handler in self.snapshot() {
            handler.resample(frame, timestamp, layout_hint)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        for handler in self.snapshot() {
            handler.flush()?;
        }
        Ok(())
    }

    pub fn deliver(&self, limit: Option<f64>) -> usize {
        self.snapshot()
            .iter()
            .map(|handler| handler.deliver(limit))
            .sum()
    }

    pub fn has_pending(&self) -> bool {
        self.snapshot().iter().any(|handler| handler.pending_len() > 0)
    }

    /// Closes registration and fires every consumer's drained notification.
    pub fn close(&self) {
        let handlers = {
            let mut state = self.state.lock();
            state.closed = true;
            state.handlers.clone()
        };
        for handler in handlers {
            handler.mark_drained();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_handler(
        registry: &AudioRegistry,
        frames: Arc<Mutex<Vec<f64>>>,
        drained: Arc<AtomicUsize>,
    ) -> anyhow::Result<Arc<AudioFrameHandler>> {
        registry.register(
            AudioFormat::mono_s16(16_000),
            Box::new(move |frame| frames.lock().push(frame.timestamp)),
            Box::new(move || {
                drained.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn push(handler: &AudioFrameHandler, timestamp: f64) {
        handler.enqueue(timestamp, bytes::Bytes::from_static(&[0, 0]), 1);
    }

    #[test]
    fn test_deliver_respects_limit() -> anyhow::Result<()> {
        let registry = AudioRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = counting_handler(&registry, seen.clone(), Arc::new(AtomicUsize::new(0)))?;
        for ts in [0.0, 0.1, 0.2, 0.3] {
            push(&handler, ts);
        }
        assert_eq!(registry.deliver(Some(0.2)), 2);
        assert_eq!(*seen.lock(), vec![0.0, 0.1]);
        assert_eq!(registry.deliver(None), 2);
        assert!(!registry.has_pending());
        Ok(())
    }

    #[test]
    fn test_drained_fires_once() -> anyhow::Result<()> {
        let registry = AudioRegistry::new();
        let drained = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = counting_handler(&registry, seen.clone(), drained.clone())?;
        registry.close();
        registry.close();
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        // nothing is delivered after the drained notification
        push(&handler, 1.0);
        assert_eq!(handler.deliver(None), 0);
        assert!(seen.lock().is_empty());
        Ok(())
    }

    #[test]
    fn test_register_after_close_drains_immediately() -> anyhow::Result<()> {
        let registry = AudioRegistry::new();
        registry.close();
        let drained = Arc::new(AtomicUsize::new(0));
        counting_handler(&registry, Arc::new(Mutex::new(Vec::new())), drained.clone())?;
        assert_eq!(drained.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_format_rejected() {
        let registry = AudioRegistry::new();
        let err = registry
            .register(
                AudioFormat::mono_s16(0),
                Box::new(|_| {}),
                Box::new(|| {}),
            )
            .unwrap_err();
        assert!(matches!(
            IngestError::of(&err),
            Some(IngestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_resample_queues_converted_frames() -> anyhow::Result<()> {
        let registry = AudioRegistry::new();
        let handler = counting_handler(
            &registry,
            Arc::new(Mutex::new(Vec::new())),
            Arc::new(AtomicUsize::new(0)),
        )?;
        let mut frame = Audio::new(
            Sample::I16(ffmpeg_next::format::sample::Type::Packed),
            4_800,
            ChannelLayout::MONO,
        );
        frame.set_rate(48_000);
        registry.resample(&mut frame, 0.5, None)?;
        registry.flush()?;
        let total: usize = handler.pending.lock().iter().map(|f| f.samples).sum();
        assert!((1_550..=1_650).contains(&total), "got {}", total);
        assert_eq!(handler.pending.lock()[0].timestamp, 0.5);
        Ok(())
    }
}
