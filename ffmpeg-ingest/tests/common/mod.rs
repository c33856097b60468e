#![allow(dead_code)]

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Once,
};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        ffmpeg_ingest::init().expect("ffmpeg init");
    });
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Writes a 4:2:0 YUV4MPEG2 clip whose luma level changes every frame.
pub fn write_y4m(dir: &Path, width: u32, height: u32, fps: u32, frames: u32) -> anyhow::Result<PathBuf> {
    let path = dir.join("clip.y4m");
    let mut out = BufWriter::new(File::create(&path)?);
    writeln!(out, "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420jpeg", width, height, fps)?;
    let luma = (width * height) as usize;
    let chroma = ((width / 2) * (height / 2)) as usize;
    for n in 0..frames {
        out.write_all(b"FRAME\n")?;
        out.write_all(&vec![(16 + n * 8) as u8; luma])?;
        out.write_all(&vec![128u8; chroma])?;
        out.write_all(&vec![128u8; chroma])?;
    }
    out.flush()?;
    Ok(path)
}

/// Writes a mono signed 16 bit PCM WAV holding a 440 Hz tone.
pub fn write_wav(dir: &Path, sample_rate: u32, seconds: f64) -> anyhow::Result<PathBuf> {
    let path = dir.join("tone.wav");
    let samples = (sample_rate as f64 * seconds).round() as u32;
    let data_len = samples * 2;
    let mut out = BufWriter::new(File::create(&path)?);
    out.write_all(b"RIFF")?;
    out.write_all(&(36 + data_len).to_le_bytes())?;
    out.write_all(b"WAVEfmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?;
    out.write_all(&sample_rate.to_le_bytes())?;
    out.write_all(&(sample_rate * 2).to_le_bytes())?;
    out.write_all(&2u16.to_le_bytes())?;
    out.write_all(&16u16.to_le_bytes())?;
    out.write_all(b"data")?;
    out.write_all(&data_len.to_le_bytes())?;
    for i in 0..samples {
        let t = i as f64 / sample_rate as f64;
        let value = ((t * 440.0 * std::f64::consts::TAU).sin() * 8000.0) as i16;
        out.write_all(&value.to_le_bytes())?;
    }
    out.flush()?;
    Ok(path)
}
