//! Per-stream timestamp correction.
//!
//! Containers may start their clocks anywhere. Each stream subtracts the
//! container's reported start time (expressed in the stream's own time base)
//! so that every input begins at zero, which is what lets a video file and a
//! separately captured audio file share one timeline.

use ffmpeg_next::{Rational, Rescale, util::mathematics::rescale::TIME_BASE};

/// Substituted when neither the frame nor the stream declares a duration.
pub const MINIMUM_FRAME_DURATION_UNITS: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTimestamps {
    pub frame_number: u64,
    /// Seconds from the start of the input.
    pub start: f64,
    pub estimated_end: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct PtsCorrection {
    time_base: Rational,
    offset: i64,
    fallback_duration: i64,
}

impl PtsCorrection {
    /// `container_start_time` is in `AV_TIME_BASE` units, as reported by the
    /// demuxer; `None` means the container did not report one.
    pub fn new(time_base: Rational, container_start_time: Option<i64>) -> Self {
        let offset = container_start_time
            .map(|start| start.rescale(TIME_BASE, time_base))
            .unwrap_or(0);
        Self {
            time_base,
            offset,
            fallback_duration: MINIMUM_FRAME_DURATION_UNITS,
        }
    }

    pub fn with_fallback_duration(mut self, units: Option<i64>) -> Self {
        self.fallback_duration = units
            .filter(|u| *u > 0)
            .unwrap_or(MINIMUM_FRAME_DURATION_UNITS);
        self
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// `raw - offset`, clamped at zero.
    pub fn correct(&self, raw: i64) -> i64 {
        let corrected = raw - self.offset;
        if corrected < 0 {
            log::debug!(
                "timestamp {} is before stream start offset {}, clamped to zero",
                raw,
                self.offset
            );
            return 0;
        }
        corrected
    }

    pub fn seconds(&self, units: i64) -> f64 {
        units as f64 * f64::from(self.time_base)
    }

    pub fn video_timestamps(&self, frame_number: u64, raw_pts: i64, duration: i64) -> FrameTimestamps {
        let start = self.seconds(self.correct(raw_pts));
        let duration = if duration > 0 {
            duration
        } else {
            self.fallback_duration
        };
        FrameTimestamps {
            frame_number,
            start,
            estimated_end: start + self.seconds(duration),
        }
    }

    /// Start and end, in seconds, of an audio frame of `samples` samples.
    pub fn audio_span(&self, raw_pts: i64, samples: usize, sample_rate: u32) -> (f64, f64) {
        let start = self.seconds(self.correct(raw_pts));
        let length = if sample_rate > 0 {
            samples as f64 / sample_rate as f64
        } else {
            0.0
        };
        (start, start + length)
    }
}

/// Container start time in `AV_TIME_BASE` units, if the demuxer reported one.
pub fn container_start_time(input: &ffmpeg_next::format::context::Input) -> Option<i64> {
    let start = unsafe { (*input.as_ptr()).start_time };
    (start != ffmpeg_next::ffi::AV_NOPTS_VALUE).then_some(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_is_rescaled_into_stream_units() {
        // 0.5 s container start in a 1/90000 stream
        let correction = PtsCorrection::new(Rational::new(1, 90_000), Some(500_000));
        assert_eq!(correction.offset(), 45_000);
        assert_eq!(correction.correct(45_000), 0);
        assert_eq!(correction.correct(48_000), 3_000);
    }

    #[test]
    fn test_negative_corrected_pts_clamps_to_zero() {
        let correction = PtsCorrection::new(Rational::new(1, 1000), Some(2_000_000));
        assert_eq!(correction.offset(), 2_000);
        assert_eq!(correction.correct(1_500), 0);
        assert_eq!(correction.correct(-7), 0);
    }

    #[test]
    fn test_unknown_start_time_means_no_offset() {
        let correction = PtsCorrection::new(Rational::new(1, 30), None);
        assert_eq!(correction.offset(), 0);
        assert_eq!(correction.correct(12), 12);
    }

    #[test]
    fn test_video_timestamps() {
        let correction = PtsCorrection::new(Rational::new(1, 30), Some(0));
        let ts = correction.video_timestamps(4, 3, 1);
        assert_eq!(ts.frame_number, 4);
        assert!((ts.start - 0.1).abs() < 1e-9);
        assert!((ts.estimated_end - 4.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_uses_fallback() {
        let tb = Rational::new(1, 90_000);
        let plain = PtsCorrection::new(tb, None);
        let ts = plain.video_timestamps(1, 0, 0);
        assert!(ts.estimated_end > ts.start);
        assert!((ts.estimated_end - 1.0 / 90_000.0).abs() < 1e-12);

        let nominal = PtsCorrection::new(tb, None).with_fallback_duration(Some(3_000));
        let ts = nominal.video_timestamps(1, 9_000, -5);
        assert!((ts.start - 0.1).abs() < 1e-9);
        assert!((ts.estimated_end - (0.1 + 1.0 / 30.0)).abs() < 1e-9);
    }

    #[test]
    fn test_audio_span() {
        let correction = PtsCorrection::new(Rational::new(1, 48_000), None);
        let (start, end) = correction.audio_span(48_000, 1_024, 48_000);
        assert!((start - 1.0).abs() < 1e-9);
        assert!((end - (1.0 + 1_024.0 / 48_000.0)).abs() < 1e-9);
    }
}
