use std::ffi::CString;
use std::path::Path;

use ffmpeg_next::{ChannelLayout, Dictionary, format::Pixel, media::Type};
use serde::{Deserialize, Serialize};

use crate::{
    decoder::{Decoder, find_decoder},
    error::IngestError,
    packet::RawPacket,
    resampler::parse_channel_layout,
    scaler::Scaler,
    stream::AvStream,
    timestamp::{PtsCorrection, container_start_time},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// How to open one input. Empty strings are treated like absent hints.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InputOptions {
    pub path: String,
    /// Demuxer name, e.g. `v4l2`, `pulse`, `yuv4mpegpipe`.
    pub format: Option<String>,
    /// `WxH`, forwarded as `video_size`.
    pub size: Option<String>,
    /// Frame rate for video inputs, sample rate for audio inputs.
    pub rate: Option<String>,
    pub channels: Option<String>,
    /// Decoder name used instead of the stream's default decoder.
    pub codec: Option<String>,
    /// Named channel layout overriding the decoded one.
    pub channel_map: Option<String>,
    pub low_latency: bool,
    /// For video inputs, also open the input's audio stream if it has one.
    pub try_audio: bool,
}

impl InputOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    fn hint(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    fn dictionary(&self, kind: MediaKind) -> Dictionary<'static> {
        let mut options = Dictionary::new();
        if let Some(size) = Self::hint(&self.size) {
            options.set("video_size", size);
        }
        if let Some(rate) = Self::hint(&self.rate) {
            match kind {
                MediaKind::Video => options.set("framerate", rate),
                MediaKind::Audio => options.set("sample_rate", rate),
            }
        }
        if let Some(channels) = Self::hint(&self.channels) {
            options.set("channels", channels);
        }
        if self.low_latency {
            options.set("probesize", "32");
            options.set("fflags", "nobuffer");
        }
        options
    }
}

/// Decoding state of the video stream of an input.
pub struct VideoSession {
    pub decoder: Decoder,
    pub correction: PtsCorrection,
    pub scaler: Scaler,
    pub width: u32,
    pub height: u32,
    pub format: Pixel,
}

/// Decoding state of the audio stream of an input.
pub struct AudioSession {
    pub decoder: Decoder,
    pub correction: PtsCorrection,
    pub layout_hint: Option<ChannelLayout>,
}

pub enum ReadOutcome {
    Packet(RawPacket),
    EndOfStream,
    Error(ffmpeg_next::Error),
}

/// One opened demux session with the decoders it is responsible for.
pub struct MediaInput {
    inner: ffmpeg_next::format::context::Input,
    path: String,
    low_latency: bool,
    video: Option<VideoSession>,
    audio: Option<AudioSession>,
}

unsafe impl Send for MediaInput {}

impl MediaInput {
    /// Demuxer registered under `name`, including device demuxers.
    fn find_input_format(name: &str) -> anyhow::Result<ffmpeg_next::format::format::Input> {
        let cname = CString::new(name)
            .map_err(|e| IngestError::invalid(format!("invalid format name {:?}: {}", name, e)))?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(IngestError::invalid(format!("input format not found: {}", name)));
        }
        Ok(unsafe { ffmpeg_next::format::format::Input::wrap(ptr as *mut _) })
    }

    /// Opens `options.path` and the decoders for `kind`. With `try_audio` a
    /// video input also gets its audio stream decoded when it has one.
    pub fn open(options: &InputOptions, kind: MediaKind, try_audio: bool) -> anyhow::Result<Self> {
        use ffmpeg_next::format::format::Format;

        if options.path.trim().is_empty() {
            return Err(IngestError::invalid("input path is empty"));
        }
        let format = InputOptions::hint(&options.format)
            .map(Self::find_input_format)
            .transpose()?;
        let codec = InputOptions::hint(&options.codec)
            .map(find_decoder)
            .transpose()?;
        if let Some(codec) = codec {
            let wanted = match kind {
                MediaKind::Video => Type::Video,
                MediaKind::Audio => Type::Audio,
            };
            if codec.medium() != wanted {
                return Err(IngestError::invalid(format!(
                    "decoder {} does not decode {:?}",
                    codec.name(),
                    kind
                )));
            }
        }
        let layout_hint = InputOptions::hint(&options.channel_map)
            .map(parse_channel_layout)
            .transpose()?;

        log::info!("opening {:?} media {}", kind, options.path);
        let path = Path::new(&options.path);
        let dictionary = options.dictionary(kind);
        let input = match format {
            Some(fmt) => ffmpeg_next::format::open_with(path, &Format::Input(fmt), dictionary)
                .map(|ctx| ctx.input()),
            None => ffmpeg_next::format::input_with_dictionary(path, dictionary),
        }
        .map_err(|e| IngestError::open(format!("cannot open {}: {}", options.path, e)))?;

        let start_time = container_start_time(&input);
        let mut media = Self {
            inner: input,
            path: options.path.clone(),
            low_latency: options.low_latency,
            video: None,
            audio: None,
        };

        match kind {
            MediaKind::Video => {
                media.video = Some(media.open_video(codec, start_time)?);
                if try_audio {
                    match media.open_audio(None, start_time, layout_hint) {
                        Ok(audio) => media.audio = Some(audio),
                        Err(e) => log::warn!("no usable audio stream in {}: {}", media.path, e),
                    }
                }
            }
            MediaKind::Audio => {
                media.audio = Some(media.open_audio(codec, start_time, layout_hint)?);
            }
        }
        Ok(media)
    }

    fn best_stream(&self, medium: Type) -> anyhow::Result<AvStream> {
        self.inner
            .streams()
            .best(medium)
            .map(AvStream::from)
            .ok_or_else(|| IngestError::open(format!("no {:?} stream in {}", medium, self.path)))
    }

    fn open_video(
        &self,
        codec: Option<ffmpeg_next::Codec>,
        start_time: Option<i64>,
    ) -> anyhow::Result<VideoSession> {
        let stream = self.best_stream(Type::Video)?;
        let decoder = Decoder::new(&stream, codec)
            .map_err(|e| IngestError::open(format!("cannot open video decoder: {}", e)))?;
        let Some((width, height, format)) = decoder.video_format() else {
            return Err(IngestError::open("video stream has no picture format"));
        };
        let scaler = Scaler::to_bgr24(format, width, height)
            .map_err(|e| IngestError::open(format!("cannot build BGR24 converter: {}", e)))?;
        let correction = PtsCorrection::new(stream.time_base(), start_time)
            .with_fallback_duration(stream.nominal_frame_duration());
        log::info!(
            "video stream #{} {}x{} {:?} time base {} offset {}",
            stream.index(),
            width,
            height,
            format,
            stream.time_base(),
            correction.offset()
        );
        Ok(VideoSession {
            decoder,
            correction,
            scaler,
            width,
            height,
            format,
        })
    }

    fn open_audio(
        &self,
        codec: Option<ffmpeg_next::Codec>,
        start_time: Option<i64>,
        layout_hint: Option<ChannelLayout>,
    ) -> anyhow::Result<AudioSession> {
        let stream = self.best_stream(Type::Audio)?;
        let decoder = Decoder::new(&stream, codec)
            .map_err(|e| IngestError::open(format!("cannot open audio decoder: {}", e)))?;
        let correction = PtsCorrection::new(stream.time_base(), start_time);
        log::info!(
            "audio stream #{} {}Hz {}ch time base {} offset {}",
            stream.index(),
            stream.sample_rate(),
            stream.channels(),
            stream.time_base(),
            correction.offset()
        );
        Ok(AudioSession {
            decoder,
            correction,
            layout_hint,
        })
    }

    pub fn read_packet(&mut self) -> ReadOutcome {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match packet.read(&mut self.inner) {
            Ok(()) => {
                let time_base = self
                    .inner
                    .stream(packet.stream())
                    .map(|stream| stream.time_base())
                    .unwrap_or(ffmpeg_next::Rational::new(0, 1));
                ReadOutcome::Packet((packet, time_base).into())
            }
            Err(ffmpeg_next::Error::Eof) => ReadOutcome::EndOfStream,
            Err(err) => ReadOutcome::Error(err),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_low_latency(&self) -> bool {
        self.low_latency
    }

    pub fn video(&self) -> Option<&VideoSession> {
        self.video.as_ref()
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoSession> {
        self.video.as_mut()
    }

    pub fn audio(&self) -> Option<&AudioSession> {
        self.audio.as_ref()
    }

    pub fn audio_mut(&mut self) -> Option<&mut AudioSession> {
        self.audio.as_mut()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_invalid(result: anyhow::Result<MediaInput>) {
        match result {
            Ok(_) => panic!("open should have failed"),
            Err(err) => assert!(matches!(
                IngestError::of(&err),
                Some(IngestError::InvalidArgument(_))
            )),
        }
    }

    #[test]
    fn test_empty_path_rejected() {
        expect_invalid(MediaInput::open(&InputOptions::new(""), MediaKind::Video, false));
    }

    #[test]
    fn test_unknown_format_rejected() {
        crate::init().ok();
        let mut options = InputOptions::new("/dev/null");
        options.format = Some("definitely-not-a-demuxer".into());
        expect_invalid(MediaInput::open(&options, MediaKind::Video, false));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let mut options = InputOptions::new("/dev/null");
        options.codec = Some("definitely-not-a-decoder".into());
        expect_invalid(MediaInput::open(&options, MediaKind::Video, false));
    }

    #[test]
    fn test_codec_of_wrong_medium_rejected() {
        let mut options = InputOptions::new("/dev/null");
        options.codec = Some("pcm_s16le".into());
        expect_invalid(MediaInput::open(&options, MediaKind::Video, false));
    }

    #[test]
    fn test_unknown_channel_map_rejected() {
        let mut options = InputOptions::new("/dev/null");
        options.channel_map = Some("9.2.4".into());
        expect_invalid(MediaInput::open(&options, MediaKind::Audio, false));
    }

    #[test]
    fn test_missing_file_is_open_error() {
        crate::init().ok();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing-here.y4m");
        let result = MediaInput::open(
            &InputOptions::new(path.to_string_lossy()),
            MediaKind::Video,
            false,
        );
        match result {
            Ok(_) => panic!("open should have failed"),
            Err(err) => assert!(matches!(IngestError::of(&err), Some(IngestError::Open(_)))),
        }
    }

    #[test]
    fn test_hints_become_demuxer_options() {
        let mut options = InputOptions::new("x");
        options.size = Some("640x480".into());
        options.rate = Some("30".into());
        options.channels = Some(" ".into());
        options.low_latency = true;
        let video = options.dictionary(MediaKind::Video);
        assert_eq!(video.get("video_size"), Some("640x480"));
        assert_eq!(video.get("framerate"), Some("30"));
        assert_eq!(video.get("channels"), None);
        assert_eq!(video.get("probesize"), Some("32"));
        assert_eq!(video.get("fflags"), Some("nobuffer"));
        let audio = options.dictionary(MediaKind::Audio);
        assert_eq!(audio.get("sample_rate"), Some("30"));
        assert_eq!(audio.get("framerate"), None);
    }
}
