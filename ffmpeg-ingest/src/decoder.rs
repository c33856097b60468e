use ffmpeg_next::{Codec, Rational};

use crate::{error::IngestError, frame::RawFrame, stream::AvStream};

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &ffmpeg_next::codec::packet::Packet) -> anyhow::Result<()> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_packet(packet)?,
            DecoderType::Audio(audio_decoder) => audio_decoder.send_packet(packet)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_eof()?,
            DecoderType::Audio(audio_decoder) => audio_decoder.send_eof()?,
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        match self {
            DecoderType::Video(video_decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                match video_decoder.receive_frame(&mut frame) {
                    Ok(()) => Ok(Some(RawFrame::Video(frame))),
                    Err(ffmpeg_next::Error::Eof) => Ok(None),
                    Err(ffmpeg_next::Error::Other { errno })
                        if errno == ffmpeg_next::util::error::EAGAIN =>
                    {
                        Ok(None)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            DecoderType::Audio(audio_decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                match audio_decoder.receive_frame(&mut frame) {
                    Ok(()) => Ok(Some(RawFrame::Audio(frame))),
                    Err(ffmpeg_next::Error::Eof) => Ok(None),
                    Err(ffmpeg_next::Error::Other { errno })
                        if errno == ffmpeg_next::util::error::EAGAIN =>
                    {
                        Ok(None)
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

/// Decoder for one input stream. Frames come out with timestamps in the
/// stream's time base.
pub struct Decoder {
    stream: AvStream,
    inner: DecoderType,
}

unsafe impl Send for Decoder {}

impl Decoder {
    /// Opens the stream's default decoder, or `codec` when one is given.
    pub fn new(stream: &AvStream, codec: Option<Codec>) -> anyhow::Result<Self> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        decoder_ctx.set_parameters(stream.parameters().clone())?;
        unsafe {
            let ctx = decoder_ctx.as_mut_ptr();
            (*ctx).time_base = stream.time_base().into();
            (*ctx).pkt_timebase = stream.time_base().into();
        }

        let inner = if stream.is_video() {
            let video_decoder = match codec {
                Some(codec) => decoder_ctx.decoder().open_as(codec)?.video()?,
                None => decoder_ctx.decoder().video()?,
            };
            if video_decoder.format() == ffmpeg_next::format::Pixel::None
                || video_decoder.width() == 0
                || video_decoder.height() == 0
            {
                return Err(IngestError::open("missing video codec parameters"));
            }
            DecoderType::Video(video_decoder)
        } else if stream.is_audio() {
            let audio_decoder = match codec {
                Some(codec) => decoder_ctx.decoder().open_as(codec)?.audio()?,
                None => decoder_ctx.decoder().audio()?,
            };
            DecoderType::Audio(audio_decoder)
        } else {
            return Err(IngestError::open("unsupported stream type"));
        };

        Ok(Self {
            stream: stream.clone(),
            inner,
        })
    }

    pub fn send_packet(&mut self, packet: &ffmpeg_next::codec::packet::Packet) -> anyhow::Result<()> {
        self.inner.send_packet(packet)
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()
    }

    pub fn receive_frame(&mut self) -> anyhow::Result<Option<RawFrame>> {
        self.inner.receive_frame()
    }

    pub fn stream(&self) -> &AvStream {
        &self.stream
    }

    pub fn stream_index(&self) -> usize {
        self.stream.index()
    }

    pub fn time_base(&self) -> Rational {
        self.stream.time_base()
    }

    /// Native picture format `(width, height, pixel format)` of a video decoder.
    pub fn video_format(&self) -> Option<(u32, u32, ffmpeg_next::format::Pixel)> {
        match &self.inner {
            DecoderType::Video(video) => Some((video.width(), video.height(), video.format())),
            DecoderType::Audio(_) => None,
        }
    }
}

/// Resolves a decoder by name, e.g. `h264_cuvid` or `libopus`.
pub fn find_decoder(name: &str) -> anyhow::Result<Codec> {
    ffmpeg_next::codec::decoder::find_by_name(name)
        .ok_or_else(|| IngestError::invalid(format!("decoder not found: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_decoder() -> anyhow::Result<()> {
        let codec = find_decoder("rawvideo")?;
        assert!(codec.is_decoder());
        let err = find_decoder("no-such-decoder").unwrap_err();
        assert!(matches!(
            IngestError::of(&err),
            Some(IngestError::InvalidArgument(_))
        ));
        Ok(())
    }
}
