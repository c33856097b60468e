use ffmpeg_next::{Rational, codec::Parameters, format::stream};

unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

/// Owned snapshot of an input stream's declaration. Kept by the input
/// session for decoding and handed to the remuxer to declare output streams.
pub struct AvStream {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
    rate: Rational,
}

impl AvStream {
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
    pub fn time_base(&self) -> Rational {
        self.time_base
    }
    pub fn rate(&self) -> Rational {
        self.rate
    }

    pub fn is_video(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Video
    }

    pub fn is_audio(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Audio
    }

    fn codecpar(&self) -> &ffmpeg_next::ffi::AVCodecParameters {
        unsafe { &*self.parameters.as_ptr() }
    }

    pub fn width(&self) -> u32 {
        self.codecpar().width.max(0) as u32
    }

    pub fn height(&self) -> u32 {
        self.codecpar().height.max(0) as u32
    }

    pub fn sample_rate(&self) -> u32 {
        self.codecpar().sample_rate.max(0) as u32
    }

    pub fn channels(&self) -> u32 {
        self.codecpar().ch_layout.nb_channels.max(0) as u32
    }

    /// Length of one frame in time-base units, derived from the average frame
    /// rate. `None` when either rational is unusable.
    pub fn nominal_frame_duration(&self) -> Option<i64> {
        let (rate_num, rate_den) = (self.rate.numerator() as i64, self.rate.denominator() as i64);
        let (tb_num, tb_den) = (
            self.time_base.numerator() as i64,
            self.time_base.denominator() as i64,
        );
        if rate_num <= 0 || rate_den <= 0 || tb_num <= 0 || tb_den <= 0 {
            return None;
        }
        let units = (rate_den * tb_den) / (rate_num * tb_num);
        (units > 0).then_some(units)
    }
}

impl From<stream::Stream<'_>> for AvStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            rate: stream.avg_frame_rate(),
        }
    }
}

impl Clone for AvStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            rate: self.rate,
        }
    }
}
