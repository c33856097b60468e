use bytes::{Bytes, BytesMut};
use ffmpeg_next::{ChannelLayout, format::Sample, frame::Audio, software::resampling};

use crate::error::IngestError;

/// Extra output samples allocated on top of the computed worst case.
const HEADROOM_SAMPLES: usize = 256;

/// Converted samples ready to be wrapped into an `AudioFrame`.
pub struct Resampled {
    pub data: Bytes,
    pub samples: usize,
}

/// `swr` context bound to one input layout/rate and one consumer format.
pub struct Resampler {
    context: resampling::Context,
    in_rate: u32,
    out_format: Sample,
    out_layout: ChannelLayout,
    out_rate: u32,
}

unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(
        in_format: Sample,
        in_layout: ChannelLayout,
        in_rate: u32,
        out_format: Sample,
        out_layout: ChannelLayout,
        out_rate: u32,
    ) -> anyhow::Result<Self> {
        let context = resampling::Context::get(
            in_format, in_layout, in_rate, out_format, out_layout, out_rate,
        )
        .map_err(|e| IngestError::decode(format!("cannot build audio resampler: {}", e)))?;
        log::debug!(
            "resampler {:?} {}ch {}Hz -> {:?} {}ch {}Hz",
            in_format,
            in_layout.channels(),
            in_rate,
            out_format,
            out_layout.channels(),
            out_rate
        );
        Ok(Self {
            context,
            in_rate,
            out_format,
            out_layout,
            out_rate,
        })
    }

    /// Samples buffered inside the resampler, in input-rate units.
    fn pending_input_samples(&self) -> i64 {
        unsafe { ffmpeg_next::ffi::swr_get_delay(self.context.as_ptr() as *mut _, self.in_rate as i64) }
    }

    fn output_capacity(&self, input_samples: usize) -> usize {
        let pending = self.pending_input_samples().max(0) as u64 + input_samples as u64;
        let scaled = (pending * self.out_rate as u64).div_ceil(self.in_rate.max(1) as u64);
        scaled as usize + HEADROOM_SAMPLES
    }

    pub fn convert(&mut self, input: &Audio) -> anyhow::Result<Resampled> {
        let mut output = Audio::new(
            self.out_format,
            self.output_capacity(input.samples()),
            self.out_layout,
        );
        self.context
            .run(input, &mut output)
            .map_err(|e| IngestError::decode(format!("audio resampling failed: {}", e)))?;
        Ok(self.collect(&output))
    }

    /// Drains the samples still held back by the resampler.
    pub fn flush(&mut self) -> anyhow::Result<Option<Resampled>> {
        let mut output = Audio::new(self.out_format, self.output_capacity(0), self.out_layout);
        self.context
            .flush(&mut output)
            .map_err(|e| IngestError::decode(format!("audio resampler flush failed: {}", e)))?;
        let resampled = self.collect(&output);
        Ok((resampled.samples > 0).then_some(resampled))
    }

    fn collect(&self, output: &Audio) -> Resampled {
        let samples = output.samples();
        let bytes_per_sample = self.out_format.bytes();
        let channels = self.out_layout.channels().max(1) as usize;
        let mut data = BytesMut::new();
        if self.out_format.is_planar() {
            for plane in 0..channels {
                data.extend_from_slice(&output.data(plane)[..samples * bytes_per_sample]);
            }
        } else {
            data.extend_from_slice(&output.data(0)[..samples * bytes_per_sample * channels]);
        }
        Resampled {
            data: data.freeze(),
            samples,
        }
    }
}

/// Layout to resample from. An unset layout is inferred from the channel
/// count for mono and stereo only.
pub fn source_layout(frame: &Audio, hint: Option<ChannelLayout>) -> anyhow::Result<ChannelLayout> {
    if let Some(layout) = hint {
        return Ok(layout);
    }
    let layout = frame.channel_layout();
    if !layout.is_empty() {
        return Ok(layout);
    }
    match frame.channels() {
        1 => Ok(ChannelLayout::MONO),
        2 => Ok(ChannelLayout::STEREO),
        n => Err(IngestError::decode(format!(
            "audio frame has {} channels and no channel layout",
            n
        ))),
    }
}

/// Parses the names accepted for a channel map hint.
pub fn parse_channel_layout(name: &str) -> anyhow::Result<ChannelLayout> {
    let layout = match name.trim().to_ascii_lowercase().as_str() {
        "mono" => ChannelLayout::MONO,
        "stereo" => ChannelLayout::STEREO,
        "2.1" => ChannelLayout::_2POINT1,
        "quad" => ChannelLayout::QUAD,
        "5.0" => ChannelLayout::_5POINT0,
        "5.1" => ChannelLayout::_5POINT1,
        "7.1" => ChannelLayout::_7POINT1,
        other => {
            return Err(IngestError::invalid(format!(
                "unknown channel map {:?}",
                other
            )));
        }
    };
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_next::format::sample::Type;

    fn tone(samples: usize, rate: u32) -> Audio {
        let mut frame = Audio::new(Sample::I16(Type::Packed), samples, ChannelLayout::MONO);
        frame.set_rate(rate);
        let plane = frame.plane_mut::<i16>(0);
        for (i, s) in plane.iter_mut().enumerate() {
            *s = ((i % 100) as i16 - 50) * 300;
        }
        frame
    }

    #[test]
    fn test_parse_channel_layout() -> anyhow::Result<()> {
        assert_eq!(parse_channel_layout("stereo")?, ChannelLayout::STEREO);
        assert_eq!(parse_channel_layout("5.1")?.channels(), 6);
        let err = parse_channel_layout("surround-ish").unwrap_err();
        assert!(matches!(
            IngestError::of(&err),
            Some(IngestError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_upsample_fits_preallocated_output() -> anyhow::Result<()> {
        let format = Sample::I16(Type::Packed);
        let mut resampler = Resampler::new(
            format,
            ChannelLayout::MONO,
            8_000,
            format,
            ChannelLayout::STEREO,
            48_000,
        )?;
        let mut total = 0;
        for _ in 0..8 {
            let out = resampler.convert(&tone(1_000, 8_000))?;
            assert_eq!(out.data.len(), out.samples * 2 * 2);
            total += out.samples;
        }
        if let Some(out) = resampler.flush()? {
            total += out.samples;
        }
        // one second in, one second out
        assert!((47_000..=49_000).contains(&total), "got {}", total);
        Ok(())
    }

    #[test]
    fn test_planar_output_is_plane_after_plane() -> anyhow::Result<()> {
        let mut resampler = Resampler::new(
            Sample::I16(Type::Packed),
            ChannelLayout::MONO,
            16_000,
            Sample::F32(Type::Planar),
            ChannelLayout::STEREO,
            16_000,
        )?;
        let out = resampler.convert(&tone(1_600, 16_000))?;
        assert_eq!(out.data.len(), out.samples * 4 * 2);
        Ok(())
    }
}
