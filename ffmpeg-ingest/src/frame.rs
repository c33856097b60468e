use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use ffmpeg_next::format::Pixel;

use crate::{pool::VideoFrameBacking, scaler::Scaler};

pub use crate::timestamp::FrameTimestamps;

/// What a decoder hands back: native-format frames in stream time-base units.
pub enum RawFrame {
    Video(ffmpeg_next::frame::Video),
    Audio(ffmpeg_next::frame::Audio),
}

/// A decoded picture converted to BGR24, living in a pool backing until it is
/// released back to the driver.
pub struct VideoFrame {
    timestamps: FrameTimestamps,
    backing: Arc<VideoFrameBacking>,
}

impl VideoFrame {
    pub(crate) fn new(timestamps: FrameTimestamps, backing: Arc<VideoFrameBacking>) -> Self {
        Self {
            timestamps,
            backing,
        }
    }

    pub fn timestamps(&self) -> FrameTimestamps {
        self.timestamps
    }

    pub fn frame_number(&self) -> u64 {
        self.timestamps.frame_number
    }

    pub fn start(&self) -> f64 {
        self.timestamps.start
    }

    pub fn estimated_end(&self) -> f64 {
        self.timestamps.estimated_end
    }

    pub fn width(&self) -> u32 {
        self.backing.width()
    }

    pub fn height(&self) -> u32 {
        self.backing.height()
    }

    pub fn backing(&self) -> &Arc<VideoFrameBacking> {
        &self.backing
    }

    /// Tightly packed copy of the pixels.
    pub fn image(&self) -> Image {
        self.backing.with_pixels(Image::from_video)
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "VideoFrame #{} [{:.4}s, {:.4}s) {}x{} backing: {}",
            self.timestamps.frame_number,
            self.timestamps.start,
            self.timestamps.estimated_end,
            self.width(),
            self.height(),
            self.backing.id()
        )
    }
}

/// Packed BGR24 picture, row stride `width * 3`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl Image {
    pub fn from_video(frame: &ffmpeg_next::frame::Video) -> Image {
        let width = frame.width();
        let height = frame.height();
        let row = width as usize * 3;
        let stride = frame.stride(0);
        let plane = frame.data(0);
        let mut data = BytesMut::with_capacity(row * height as usize);
        for y in 0..height as usize {
            data.extend_from_slice(&plane[y * stride..y * stride + row]);
        }
        Image {
            width,
            height,
            data: data.freeze(),
        }
    }

    pub fn to_video(&self) -> ffmpeg_next::frame::Video {
        let mut frame = ffmpeg_next::frame::Video::new(Pixel::BGR24, self.width, self.height);
        let row = self.row_bytes();
        let stride = frame.stride(0);
        let plane = frame.data_mut(0);
        for (y, src) in self.data.chunks_exact(row).enumerate() {
            plane[y * stride..y * stride + row].copy_from_slice(src);
        }
        frame
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * 3
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Resizes with a scaler already built for this image's geometry.
    pub fn resized_with(&self, scaler: &mut Scaler) -> anyhow::Result<Image> {
        let mut dst = ffmpeg_next::frame::Video::empty();
        scaler.run(&self.to_video(), &mut dst)?;
        Ok(Image::from_video(&dst))
    }
}

/// One resampled buffer for one audio consumer.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Seconds from the start of the input.
    pub timestamp: f64,
    /// Interleaved for packed formats, plane after plane for planar ones.
    pub data: Bytes,
    /// Samples per channel.
    pub samples: usize,
}

impl AudioFrame {
    pub fn byte_count(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Image {
        let data: Vec<u8> = (0..width * height * 3).map(|i| (i % 251) as u8).collect();
        Image {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_image_survives_padded_frame() {
        // odd width forces a stride larger than the row
        let image = gradient(7, 5);
        let video = image.to_video();
        assert!(video.stride(0) >= image.row_bytes());
        assert_eq!(Image::from_video(&video), image);
    }

    #[test]
    fn test_resize_halves_dimensions() -> anyhow::Result<()> {
        let mut scaler = Scaler::resize(64, 32, 32, 16)?;
        let image = gradient(64, 32);
        let small = image.resized_with(&mut scaler)?;
        assert_eq!((small.width, small.height), (32, 16));
        assert_eq!(small.data.len(), 32 * 16 * 3);
        // the same scaler serves the next image of that size
        assert_eq!(image.resized_with(&mut scaler)?, small);
        Ok(())
    }
}
