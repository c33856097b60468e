use ffmpeg_next::{
    format::Pixel,
    software::scaling::{Context, Flags},
};

/// Owned `sws` context. Built once per session (fixed input format) or once
/// per resize geometry.
pub struct Scaler {
    context: Context,
}

impl Scaler {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    /// Converter from the decoder's native picture format to packed BGR24 of
    /// the same size.
    pub fn to_bgr24(format: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let context = Context::get(
            format,
            width,
            height,
            Pixel::BGR24,
            width,
            height,
            Flags::BICUBIC,
        )?;
        Ok(Self::new(context))
    }

    /// BGR24 to BGR24 resize.
    pub fn resize(
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
    ) -> anyhow::Result<Self> {
        let context = Context::get(
            Pixel::BGR24,
            src_width,
            src_height,
            Pixel::BGR24,
            dst_width,
            dst_height,
            Flags::BILINEAR,
        )?;
        Ok(Self::new(context))
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}
