use ffmpeg_next::{Rational, Rescale};
use serde::Serialize;

/// An encoded packet together with the time base its timestamps are in.
pub struct RawPacket {
    packet: ffmpeg_next::codec::packet::Packet,
    time_base: Rational,
}

unsafe impl Send for RawPacket {}

impl RawPacket {
    pub fn pts(&self) -> Option<i64> {
        self.packet.pts()
    }

    pub fn dts(&self) -> Option<i64> {
        self.packet.dts()
    }

    pub fn index(&self) -> usize {
        self.packet.stream()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn packet(&self) -> &ffmpeg_next::codec::packet::Packet {
        &self.packet
    }

    /// Copies the payload into a packet addressed to output stream
    /// `out_index`, with timestamps already expressed in `time_base`.
    pub fn for_output(&self, out_index: usize, pts: i64, dts: i64, time_base: Rational) -> Self {
        let mut packet = self.packet.clone();
        packet.set_stream(out_index);
        packet.set_pts(Some(pts));
        packet.set_dts(Some(dts));
        packet.set_duration(
            self.packet
                .duration()
                .max(0)
                .rescale(self.time_base, time_base),
        );
        packet.set_position(-1);
        Self { packet, time_base }
    }
}

impl From<(ffmpeg_next::codec::packet::Packet, Rational)> for RawPacket {
    fn from((packet, time_base): (ffmpeg_next::codec::packet::Packet, Rational)) -> Self {
        Self { packet, time_base }
    }
}

/// Maps one input stream's timestamps onto one output stream's clock.
#[derive(Clone, Copy, Debug)]
pub struct TimestampRewrite {
    offset: i64,
    in_time_base: Rational,
    out_time_base: Rational,
}

impl TimestampRewrite {
    pub fn new(offset: i64, in_time_base: Rational, out_time_base: Rational) -> Self {
        Self {
            offset,
            in_time_base,
            out_time_base,
        }
    }

    /// Returns the rewritten `(pts, dts)`, or `None` when the packet carries
    /// neither timestamp and must be dropped.
    pub fn apply(&self, pts: Option<i64>, dts: Option<i64>) -> Option<(i64, i64)> {
        let (pts, dts) = match (pts, dts) {
            (Some(pts), Some(dts)) => (pts, dts),
            (Some(pts), None) => (pts, pts),
            (None, Some(dts)) => (dts, dts),
            (None, None) => return None,
        };
        Some((self.convert(pts), self.convert(dts)))
    }

    fn convert(&self, ts: i64) -> i64 {
        (ts - self.offset)
            .max(0)
            .rescale(self.in_time_base, self.out_time_base)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RemuxStats {
    pub accepted: u64,
    pub dropped: u64,
}

/// Rejects any packet whose PTS or DTS does not strictly exceed the last
/// accepted packet on the same output stream.
#[derive(Debug, Default)]
pub struct MonotonicGuard {
    last_pts: Option<i64>,
    last_dts: Option<i64>,
    stats: RemuxStats,
}

impl MonotonicGuard {
    /// Whether a packet with these timestamps may follow the last accepted one.
    pub fn allows(&self, pts: i64, dts: i64) -> bool {
        self.last_pts.is_none_or(|last| pts > last) && self.last_dts.is_none_or(|last| dts > last)
    }

    /// Moves the watermark. Only for packets that actually went out.
    pub fn record_accepted(&mut self, pts: i64, dts: i64) {
        self.last_pts = Some(pts);
        self.last_dts = Some(dts);
        self.stats.accepted += 1;
    }

    pub fn record_dropped(&mut self) {
        self.stats.dropped += 1;
    }

    pub fn admit(&mut self, pts: i64, dts: i64) -> bool {
        if self.allows(pts, dts) {
            self.record_accepted(pts, dts);
            true
        } else {
            self.record_dropped();
            false
        }
    }

    pub fn stats(&self) -> RemuxStats {
        self.stats
    }
}
