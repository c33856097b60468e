/// Registers FFmpeg components (formats, devices, network). Call once at
/// startup before opening any input; repeated calls are harmless.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    ffmpeg_next::util::log::set_flags(ffmpeg_next::util::log::Flags::SKIP_REPEATED);
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Info);
    ffmpeg_next::format::network::init();
    Ok(())
}

pub mod audio;
pub mod config;
pub mod decoder;
mod demux;
pub mod driver;
pub mod error;
pub mod frame;
pub mod frame_server;
pub mod input;
pub mod output;
pub mod packet;
pub mod pool;
pub mod resampler;
pub mod scaler;
pub mod status;
pub mod stream;
pub mod sync;
pub mod timestamp;
pub mod worker;

pub use error::IngestError;
