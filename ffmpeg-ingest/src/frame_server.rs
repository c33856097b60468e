//! Lifecycle of decoded frames while downstream stages work on them.
//!
//! Each frame moves through the [`FrameStatus`] stages one step at a time.
//! Stages register named checkpoints per status; a frame leaves a status only
//! once every checkpoint registered for it has been set. A periodic worker
//! advances frames and removes the ones that reached `Gone`.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;

use crate::{
    config::FrameServerConfig,
    error::IngestError,
    frame::{FrameTimestamps, Image, VideoFrame},
    scaler::Scaler,
    status::Status,
    worker::{PeriodicWorker, WorkerSignal, WorkerState},
};

const CAPACITY_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FrameStatus {
    New,
    Preprocess,
    Tracking,
    PreviewDisplay,
    LateProcessing,
    Gone,
}

const STATUS_COUNT: usize = 6;

impl FrameStatus {
    pub const ALL: [FrameStatus; STATUS_COUNT] = [
        FrameStatus::New,
        FrameStatus::Preprocess,
        FrameStatus::Tracking,
        FrameStatus::PreviewDisplay,
        FrameStatus::LateProcessing,
        FrameStatus::Gone,
    ];

    pub fn next(self) -> Option<FrameStatus> {
        Self::ALL.get(self.index() + 1).copied()
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Pixel copies owned by a working frame. Released once the frame leaves
/// `PreviewDisplay`.
pub struct FrameImages {
    pub frame: Image,
    pub detection_frame: Image,
    /// Drawn on by preview stages.
    pub preview_frame: Mutex<Image>,
}

/// Snapshot of a frame in the store.
#[derive(Clone)]
pub struct WorkingFrame {
    pub timestamps: FrameTimestamps,
    pub status: FrameStatus,
    pub detection_scale_factor: f64,
    pub images: Option<Arc<FrameImages>>,
}

struct StoredFrame {
    timestamps: FrameTimestamps,
    status: FrameStatus,
    detection_scale_factor: f64,
    images: Option<Arc<FrameImages>>,
    checkpoints: [BTreeMap<String, bool>; STATUS_COUNT],
}

impl StoredFrame {
    fn snapshot(&self) -> WorkingFrame {
        WorkingFrame {
            timestamps: self.timestamps,
            status: self.status,
            detection_scale_factor: self.detection_scale_factor,
            images: self.images.clone(),
        }
    }

    fn checkpoints_passed(&self) -> bool {
        self.checkpoints[self.status.index()].values().all(|set| *set)
    }
}

pub type StatusCallback = Arc<dyn Fn(FrameStatus, FrameTimestamps) + Send + Sync>;
pub type DrainedCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ServerState {
    store: BTreeMap<u64, StoredFrame>,
    checkpoints: [Vec<String>; STATUS_COUNT],
    subscribers: [Vec<StatusCallback>; STATUS_COUNT],
    drained_callbacks: Vec<DrainedCallback>,
    draining: bool,
    scale_reported: bool,
}

/// `(width, height)` before and after scaling.
type Geometry = ((u32, u32), (u32, u32));

/// Resize context for the detection copy, rebuilt only when the geometry
/// changes.
struct DetectionScaler {
    geometry: Geometry,
    scaler: Scaler,
}

type PendingEvents = Vec<(Vec<StatusCallback>, FrameStatus, FrameTimestamps)>;

pub struct FrameServer {
    config: FrameServerConfig,
    status: Status,
    /// Serializes status-change dispatch. Always taken before `state`.
    dispatch: ReentrantMutex<()>,
    state: Mutex<ServerState>,
    detection_scaler: Mutex<Option<DetectionScaler>>,
    signal: OnceLock<WorkerSignal>,
    worker: Mutex<Option<PeriodicWorker>>,
    drained_fired: AtomicBool,
}

impl FrameServer {
    pub fn new(config: FrameServerConfig, status: Status) -> Self {
        Self {
            config,
            status,
            dispatch: ReentrantMutex::new(()),
            state: Mutex::new(ServerState::default()),
            detection_scaler: Mutex::new(None),
            signal: OnceLock::new(),
            worker: Mutex::new(None),
            drained_fired: AtomicBool::new(false),
        }
    }

    /// Attaches the worker that herds frames every `interval` or whenever it
    /// is signalled. It stops once the server is drained and then fires the
    /// drained callbacks.
    pub fn spawn_worker(self: &Arc<Self>, interval: Duration) -> anyhow::Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Err(IngestError::logic("frame server worker already running"));
        }
        let herd_ref: Weak<FrameServer> = Arc::downgrade(self);
        let finish_ref = herd_ref.clone();
        let worker = PeriodicWorker::spawn(
            "frame-server-herder",
            interval,
            &self.status,
            move || {
                let Some(server) = herd_ref.upgrade() else {
                    return Ok(WorkerState::Finished);
                };
                let did_work = server.herd()?;
                Ok(if server.is_drained() {
                    WorkerState::Finished
                } else if did_work {
                    WorkerState::Busy
                } else {
                    WorkerState::Idle
                })
            },
            move || {
                if let Some(server) = finish_ref.upgrade() {
                    server.fire_drained();
                }
            },
        )?;
        let _ = self.signal.set(worker.signaller());
        *slot = Some(worker);
        Ok(())
    }

    fn signal_worker(&self) {
        if let Some(signal) = self.signal.get() {
            signal.signal();
        }
    }

    fn dispatch_events(events: PendingEvents) {
        for (callbacks, status, timestamps) in events {
            for callback in callbacks {
                callback(status, timestamps);
            }
        }
    }

    fn detection_scale_factor(&self, width: u32, height: u32) -> f64 {
        if self.config.detection_bounding_box > 0 {
            self.config.detection_bounding_box as f64 / width.max(height).max(1) as f64
        } else {
            self.config.detection_scale_factor
        }
    }

    fn detection_copy(&self, image: &Image, width: u32, height: u32) -> anyhow::Result<Image> {
        if (width, height) == (image.width, image.height) {
            return Ok(image.clone());
        }
        let geometry = ((image.width, image.height), (width, height));
        let mut cached = self.detection_scaler.lock();
        if cached.as_ref().is_none_or(|entry| entry.geometry != geometry) {
            log::debug!(
                "building detection scaler {}x{} -> {}x{}",
                image.width,
                image.height,
                width,
                height
            );
            *cached = Some(DetectionScaler {
                geometry,
                scaler: Scaler::resize(image.width, image.height, width, height)?,
            });
        }
        let Some(entry) = cached.as_mut() else {
            return Err(IngestError::logic("detection scaler missing after creation"));
        };
        image.resized_with(&mut entry.scaler)
    }

    fn wait_for_capacity(&self) -> anyhow::Result<()> {
        let Some(max) = self.config.max_queue_depth else {
            return Ok(());
        };
        let mut warned = false;
        loop {
            if self.status.is_emergency() {
                return Err(IngestError::Stopped.into());
            }
            {
                let state = self.state.lock();
                if state.draining {
                    return Err(IngestError::logic("cannot insert a frame while draining"));
                }
                if state.store.len() < max {
                    return Ok(());
                }
            }
            if !warned {
                log::warn!(
                    "frame store is at its maximum depth of {}, insertion is blocked",
                    max
                );
                warned = true;
            }
            thread::sleep(CAPACITY_POLL);
        }
    }

    /// Copies `frame` into the store as `New`. The caller keeps the video
    /// frame and stays responsible for releasing it.
    pub fn insert(&self, frame: &VideoFrame) -> anyhow::Result<()> {
        self.wait_for_capacity()?;

        let timestamps = frame.timestamps();
        let image = frame.image();
        let factor = self.detection_scale_factor(image.width, image.height);
        let detection_width = ((image.width as f64 * factor).round() as u32).max(1);
        let detection_height = ((image.height as f64 * factor).round() as u32).max(1);
        let detection_frame = self.detection_copy(&image, detection_width, detection_height)?;
        let images = Arc::new(FrameImages {
            preview_frame: Mutex::new(image.clone()),
            frame: image,
            detection_frame,
        });

        let _dispatch = self.dispatch.lock();
        let events = {
            let mut state = self.state.lock();
            if state.draining {
                return Err(IngestError::logic("cannot insert a frame while draining"));
            }
            let number = timestamps.frame_number;
            if state.store.contains_key(&number) {
                return Err(IngestError::logic(format!(
                    "frame #{} is already in the store",
                    number
                )));
            }
            if !state.scale_reported {
                log::debug!(
                    "detection copy scaled {}x{} -> {}x{} (factor {:.3})",
                    images.frame.width,
                    images.frame.height,
                    detection_width,
                    detection_height,
                    factor
                );
                state.scale_reported = true;
            }
            let checkpoints = std::array::from_fn(|i| {
                state.checkpoints[i]
                    .iter()
                    .map(|key| (key.clone(), false))
                    .collect()
            });
            state.store.insert(
                number,
                StoredFrame {
                    timestamps,
                    status: FrameStatus::New,
                    detection_scale_factor: factor,
                    images: Some(images),
                    checkpoints,
                },
            );
            vec![(
                state.subscribers[FrameStatus::New.index()].clone(),
                FrameStatus::New,
                timestamps,
            )]
        };
        Self::dispatch_events(events);
        self.signal_worker();
        Ok(())
    }

    /// Frames inserted from now on need `key` set before leaving `status`.
    pub fn register_checkpoint(&self, status: FrameStatus, key: &str) -> anyhow::Result<()> {
        if status == FrameStatus::Gone {
            return Err(IngestError::invalid(
                "checkpoints cannot be registered for Gone",
            ));
        }
        let mut state = self.state.lock();
        let keys = &mut state.checkpoints[status.index()];
        if !keys.iter().any(|existing| existing == key) {
            keys.push(key.to_string());
        }
        Ok(())
    }

    pub fn set_checkpoint(
        &self,
        frame_number: u64,
        status: FrameStatus,
        key: &str,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            let frame = state.store.get_mut(&frame_number).ok_or_else(|| {
                IngestError::logic(format!("frame #{} is not in the store", frame_number))
            })?;
            if frame.status != status {
                return Err(IngestError::logic(format!(
                    "frame #{} is {:?}, not {:?}",
                    frame_number, frame.status, status
                )));
            }
            let checkpoint = frame.checkpoints[status.index()]
                .get_mut(key)
                .ok_or_else(|| {
                    IngestError::logic(format!(
                        "checkpoint {:?} was never registered for {:?}",
                        key, status
                    ))
                })?;
            if *checkpoint {
                return Err(IngestError::logic(format!(
                    "checkpoint {:?} of frame #{} is already set",
                    key, frame_number
                )));
            }
            *checkpoint = true;
        }
        self.signal_worker();
        Ok(())
    }

    pub fn on_frame_status_change<F>(&self, status: FrameStatus, callback: F)
    where
        F: Fn(FrameStatus, FrameTimestamps) + Send + Sync + 'static,
    {
        self.state.lock().subscribers[status.index()].push(Arc::new(callback));
    }

    /// `callback` runs once the server has drained. Registered after that,
    /// it runs immediately.
    pub fn on_drained<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if !self.drained_fired.load(Ordering::SeqCst) {
                state.drained_callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    fn fire_drained(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if self.drained_fired.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut state.drained_callbacks)
        };
        log::debug!("frame server drained");
        for callback in callbacks {
            callback();
        }
    }

    pub fn get_working_frame(&self, frame_number: u64) -> anyhow::Result<WorkingFrame> {
        self.state
            .lock()
            .store
            .get(&frame_number)
            .map(StoredFrame::snapshot)
            .ok_or_else(|| IngestError::logic(format!("frame #{} is not in the store", frame_number)))
    }

    pub fn frame_status(&self, frame_number: u64) -> Option<FrameStatus> {
        self.state.lock().store.get(&frame_number).map(|f| f.status)
    }

    pub fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One pass over the store in frame-number order: `Gone` frames are
    /// removed, every other frame whose checkpoints are all set advances one
    /// status. Returns whether anything changed.
    pub fn herd(&self) -> anyhow::Result<bool> {
        let _dispatch = self.dispatch.lock();
        let (did_work, events) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut gone = Vec::new();
            let mut events: PendingEvents = Vec::new();
            for (number, frame) in state.store.iter_mut() {
                if frame.status == FrameStatus::Gone {
                    gone.push(*number);
                    continue;
                }
                if !frame.checkpoints_passed() {
                    continue;
                }
                let Some(next) = frame.status.next() else {
                    continue;
                };
                if frame.status == FrameStatus::PreviewDisplay {
                    frame.images = None;
                }
                frame.status = next;
                events.push((
                    state.subscribers[next.index()].clone(),
                    next,
                    frame.timestamps,
                ));
            }
            for number in &gone {
                state.store.remove(number);
            }
            (!gone.is_empty() || !events.is_empty(), events)
        };
        Self::dispatch_events(events);
        Ok(did_work)
    }

    pub fn set_draining(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if state.draining {
                return Err(IngestError::logic("frame server is already draining"));
            }
            state.draining = true;
        }
        log::debug!("frame server set to draining");
        self.signal_worker();
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.draining && state.store.is_empty()
    }

    /// Blocks until the worker has exited.
    pub fn join_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.join();
        }
    }
}

impl Drop for FrameServer {
    fn drop(&mut self) {
        if !self.is_draining() {
            log::warn!("frame server dropped without draining");
        }
        let worker = self.worker.lock().take();
        drop(worker);
        let left = self.len();
        if left > 0 {
            log::warn!("frame server dropped with {} frames still in the store", left);
        }
    }
}
