//! Display sinks for annotated frames.
//!
use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::{codecs::jpeg::JpegEncoder, RgbImage};

/// Receives annotated frames. Failures are non-fatal to a run; the executor
/// logs them and continues.
pub trait DisplaySink {
    fn show(&mut self, frame: RgbImage) -> Result<()>;
}

/// Writes numbered JPEG files into a directory.
pub struct JpegDirSink {
    dir: PathBuf,
    counter: u64,
    quality: u8,
}

impl JpegDirSink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        Ok(Self {
            dir,
            counter: 0,
            quality: 95,
        })
    }
}

impl DisplaySink for JpegDirSink {
    fn show(&mut self, frame: RgbImage) -> Result<()> {
        let path = self.dir.join(format!("frame-{}.jpg", self.counter));
        self.counter += 1;

        let (width, height) = frame.dimensions();
        let mut file = File::create(&path)?;
        JpegEncoder::new_with_quality(&mut file, self.quality).encode(
            &frame,
            width,
            height,
            image::ColorType::Rgb8,
        )?;

        log::debug!("Wrote {}", path.display());
        Ok(())
    }
}

/// Discards frames, only keeping count.
#[derive(Default)]
pub struct NullSink {
    shown: u64,
}

impl NullSink {
    pub fn shown(&self) -> u64 {
        self.shown
    }
}

impl DisplaySink for NullSink {
    fn show(&mut self, frame: RgbImage) -> Result<()> {
        self.shown += 1;
        log::debug!(
            "Discarding frame {} ({}x{})",
            self.shown,
            frame.width(),
            frame.height()
        );
        Ok(())
    }
}
