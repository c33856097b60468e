use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Video,
    Audio,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Video => Side::Audio,
            Side::Audio => Side::Video,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Clock {
    active: bool,
    draining: bool,
    /// End of the latest decoded frame, seconds.
    decoded_end: f64,
}

/// Shared timeline of the video and audio sides, wherever each is decoded.
///
/// Each side's clock sits behind its own lock; no method holds both at once.
#[derive(Default)]
pub struct SyncController {
    video: Mutex<Clock>,
    audio: Mutex<Clock>,
    presented_video_end: Mutex<f64>,
}

impl SyncController {
    pub fn new() -> Self {
        Self::default()
    }

    fn clock(&self, side: Side) -> &Mutex<Clock> {
        match side {
            Side::Video => &self.video,
            Side::Audio => &self.audio,
        }
    }

    fn read(&self, side: Side) -> Clock {
        *self.clock(side).lock()
    }

    pub fn activate(&self, side: Side) {
        self.clock(side).lock().active = true;
    }

    pub fn is_active(&self, side: Side) -> bool {
        self.read(side).active
    }

    pub fn set_draining(&self, side: Side) {
        let mut clock = self.clock(side).lock();
        if clock.active && !clock.draining {
            log::debug!("{:?} side is draining", side);
        }
        clock.draining = true;
    }

    /// An inactive side has nothing left to give and counts as draining.
    pub fn is_draining(&self, side: Side) -> bool {
        let clock = self.read(side);
        !clock.active || clock.draining
    }

    pub fn all_draining(&self) -> bool {
        self.is_draining(Side::Video) && self.is_draining(Side::Audio)
    }

    pub fn note_decoded(&self, side: Side, end: f64) {
        let mut clock = self.clock(side).lock();
        if end > clock.decoded_end {
            clock.decoded_end = end;
        }
    }

    pub fn decoded_end(&self, side: Side) -> f64 {
        self.read(side).decoded_end
    }

    pub fn note_presented(&self, end: f64) {
        let mut presented = self.presented_video_end.lock();
        if end > *presented {
            *presented = end;
        }
    }

    pub fn presented_video_end(&self) -> f64 {
        *self.presented_video_end.lock()
    }

    /// Whether the context decoding `side` should sit out this cycle because
    /// it has got ahead of the other side. A context decoding both sides is
    /// never held back.
    pub fn should_skip(&self, side: Side, decodes_both: bool) -> bool {
        if decodes_both {
            return false;
        }
        let mine = self.read(side);
        let other = self.read(side.other());
        mine.active
            && other.active
            && !mine.draining
            && !other.draining
            && mine.decoded_end > other.decoded_end
    }

    /// Timestamp below which pending audio may be handed to consumers, or
    /// `None` when everything may go.
    pub fn audio_release_limit(&self, low_latency: bool, video_queue_empty: bool) -> Option<f64> {
        let video = self.read(Side::Video);
        if low_latency || !video.active || (video.draining && video_queue_empty) {
            return None;
        }
        Some(self.presented_video_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both_active() -> SyncController {
        let sync = SyncController::new();
        sync.activate(Side::Video);
        sync.activate(Side::Audio);
        sync
    }

    #[test]
    fn test_side_ahead_is_skipped() {
        let sync = both_active();
        sync.note_decoded(Side::Video, 1.0);
        sync.note_decoded(Side::Audio, 0.5);
        assert!(sync.should_skip(Side::Video, false));
        assert!(!sync.should_skip(Side::Audio, false));

        // equal clocks hold nobody back
        sync.note_decoded(Side::Audio, 1.0);
        assert!(!sync.should_skip(Side::Video, false));
        assert!(!sync.should_skip(Side::Audio, false));
    }

    #[test]
    fn test_shared_context_never_throttled() {
        let sync = both_active();
        sync.note_decoded(Side::Video, 5.0);
        assert!(!sync.should_skip(Side::Video, true));
    }

    #[test]
    fn test_draining_side_releases_other() {
        let sync = both_active();
        sync.note_decoded(Side::Video, 3.0);
        sync.set_draining(Side::Audio);
        assert!(!sync.should_skip(Side::Video, false));
        assert!(!sync.all_draining());
        sync.set_draining(Side::Video);
        assert!(sync.all_draining());
    }

    #[test]
    fn test_inactive_side_counts_as_draining() {
        let sync = SyncController::new();
        sync.activate(Side::Video);
        assert!(sync.is_draining(Side::Audio));
        assert!(!sync.all_draining());
    }

    #[test]
    fn test_decoded_end_only_moves_forward() {
        let sync = both_active();
        sync.note_decoded(Side::Audio, 2.0);
        sync.note_decoded(Side::Audio, 1.0);
        assert_eq!(sync.decoded_end(Side::Audio), 2.0);
    }

    #[test]
    fn test_audio_release_limit() {
        let sync = both_active();
        sync.note_presented(0.4);
        assert_eq!(sync.audio_release_limit(false, true), Some(0.4));
        assert_eq!(sync.audio_release_limit(true, true), None);

        sync.set_draining(Side::Video);
        assert_eq!(sync.audio_release_limit(false, false), Some(0.4));
        assert_eq!(sync.audio_release_limit(false, true), None);

        let audio_only = SyncController::new();
        audio_only.activate(Side::Audio);
        assert_eq!(audio_only.audio_release_limit(false, true), None);
    }
}
