//! Frame sources.
//!
//! A [`FrameSource`] yields a lazy, finite sequence of frames. Sources are
//! not restartable: once stopped, `start` is an error.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use rscam::{Camera, Config};

/// A stream of frames with explicit lifecycle.
pub trait FrameSource {
    /// Acquire the underlying resource and begin streaming.
    fn start(&mut self) -> Result<()>;

    /// The next frame, or `Ok(None)` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Release the underlying resource.
    fn stop(&mut self) -> Result<()>;
}

/// V4L2 camera source producing MJPG frames decoded to RGB.
pub struct CameraSource {
    device: String,
    resolution: Option<(u32, u32)>,
    frame_rate: Option<(u32, u32)>,
    max_frames: Option<u64>,
    captured: u64,
    cam: Option<Camera>,
    stopped: bool,
}

const CAMERA_FORMAT: &[u8] = b"MJPG";

impl CameraSource {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            resolution: None,
            frame_rate: None,
            max_frames: None,
            captured: 0,
            cam: None,
            stopped: false,
        }
    }

    /// Request a fixed resolution instead of the highest supported one.
    pub fn with_resolution(mut self, resolution: (u32, u32)) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Request a fixed frame rate instead of the highest supported one.
    pub fn with_frame_rate(mut self, frame_rate: (u32, u32)) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    /// Make the otherwise unbounded camera stream finite.
    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }
}

impl FrameSource for CameraSource {
    fn start(&mut self) -> Result<()> {
        if self.stopped {
            bail!("camera source cannot be restarted");
        }
        if self.cam.is_some() {
            bail!("camera source already started");
        }

        let mut cam =
            Camera::new(&self.device).with_context(|| format!("opening {}", self.device))?;
        log_supported_formats(&cam, CAMERA_FORMAT);

        let resolution = self
            .resolution
            .map(Ok)
            .unwrap_or_else(|| get_max_resolution(&cam, CAMERA_FORMAT))?;
        let frame_rate = self
            .frame_rate
            .map(Ok)
            .unwrap_or_else(|| get_max_frame_rate(&cam, CAMERA_FORMAT, resolution))?;

        log::info!(
            "Using camera {} at {}x{} ({}/{} fps)",
            self.device,
            resolution.0,
            resolution.1,
            frame_rate.1,
            frame_rate.0,
        );

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format: CAMERA_FORMAT,
            ..Default::default()
        })?;

        self.cam = Some(cam);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(max) = self.max_frames {
            if self.captured >= max {
                return Ok(None);
            }
        }

        let cam = match self.cam.as_mut() {
            Some(cam) => cam,
            None => bail!("camera source not started"),
        };

        let frame = cam.capture().context("capturing frame")?;
        let image = image::load_from_memory(&frame[..])
            .context("decoding camera frame")?
            .to_rgb8();

        self.captured += 1;
        Ok(Some(image))
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut cam) = self.cam.take() {
            cam.stop()?;
        }
        self.stopped = true;
        Ok(())
    }
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32)> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Map to iterator over ((width, height), num_pixels)
            .map(|res| (res, res.0 * res.1))
            // Get the highest resolution in terms of number of pixels
            .max_by(|a, b| a.1.cmp(&b.1))
            // Extract width and height values
            .map(|res| *res.0),
        rscam::ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .context("no resolution found")
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(cam: &Camera, format: &[u8], resolution: (u32, u32)) -> Result<(u32, u32)> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(frame_rates) => frame_rates
            .iter()
            // Map discrete values to real frame rate
            .map(|(denominator, numerator)| ((denominator, numerator), numerator / denominator))
            // Get the highest frame rate
            .max_by(|a, b| a.1.cmp(&b.1))
            // Extract denominator and numerator
            .map(|((&d, &n), _)| (d, n)),
        rscam::IntervalInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .context("no frame rate found")
}

fn log_supported_formats(cam: &Camera, format: &[u8]) {
    let formats: Vec<_> = cam.formats().flatten().collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}

/// Lexicographically ordered image files of a directory.
pub struct ImageDirSource {
    dir: PathBuf,
    files: VecDeque<PathBuf>,
    started: bool,
    stopped: bool,
}

impl ImageDirSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: VecDeque::new(),
            started: false,
            stopped: false,
        }
    }
}

impl FrameSource for ImageDirSource {
    fn start(&mut self) -> Result<()> {
        if self.stopped {
            bail!("image directory source cannot be restarted");
        }

        let mut files: Vec<_> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("jpg") | Some("jpeg") | Some("png")
                )
            })
            .collect();
        files.sort();

        log::info!("Streaming {} frames from {}", files.len(), self.dir.display());

        self.files = files.into();
        self.started = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.started {
            bail!("image directory source not started");
        }

        match self.files.pop_front() {
            Some(path) => {
                let image = image::open(&path)
                    .with_context(|| format!("decoding {}", path.display()))?
                    .to_rgb8();
                Ok(Some(image))
            }
            None => Ok(None),
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.files.clear();
        self.started = false;
        self.stopped = true;
        Ok(())
    }
}

/// Deterministic generated frames for demos and machines without a camera.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frames: u64,
    produced: u64,
    started: bool,
    stopped: bool,
}

impl SyntheticSource {
    pub fn new(frames: u64, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames,
            produced: 0,
            started: false,
            stopped: false,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<()> {
        if self.stopped {
            bail!("synthetic source cannot be restarted");
        }
        self.started = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.started {
            bail!("synthetic source not started");
        }
        if self.produced >= self.frames {
            return Ok(None);
        }

        // Gradient background with a block wandering right, one step per frame.
        let step = (self.produced * 8) as u32;
        let frame = RgbImage::from_fn(self.width, self.height, |x, y| {
            let block_x = step % self.width.max(1);
            let in_block = x.abs_diff(block_x) < 12 && y.abs_diff(self.height / 2) < 12;
            if in_block {
                Rgb([255, 255, 255])
            } else {
                Rgb([(x % 256) as u8, (y % 256) as u8, 64])
            }
        });

        self.produced += 1;
        Ok(Some(frame))
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        self.stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn synthetic_source_is_finite_and_stays_exhausted() {
        let mut source = SyntheticSource::new(3, 32, 24);
        source.start().unwrap();

        for _ in 0..3 {
            assert!(source.next_frame().unwrap().is_some());
        }
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.next_frame().unwrap().is_none());

        source.stop().unwrap();
    }

    #[test]
    fn sources_do_not_restart() {
        let mut source = SyntheticSource::new(1, 8, 8);
        source.start().unwrap();
        source.stop().unwrap();
        assert!(source.start().is_err());

        let mut dir_source = ImageDirSource::new(".");
        dir_source.start().unwrap();
        dir_source.stop().unwrap();
        assert!(dir_source.start().is_err());
    }

    #[test]
    fn next_frame_before_start_is_an_error() {
        let mut source = SyntheticSource::new(1, 8, 8);
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn image_dir_source_reads_sorted_frames() {
        let dir = std::env::temp_dir().join(format!("pipecam-src-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut img = RgbImage::new(4, 4);
        img.put_pixel(0, 0, Rgb([10, 0, 0]));
        img.save(dir.join("b.png")).unwrap();
        let mut img = RgbImage::new(4, 4);
        img.put_pixel(0, 0, Rgb([20, 0, 0]));
        img.save(dir.join("a.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let mut source = ImageDirSource::new(&dir);
        source.start().unwrap();

        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0).0, [20, 0, 0]);
        assert_eq!(second.get_pixel(0, 0).0, [10, 0, 0]);
        assert!(source.next_frame().unwrap().is_none());

        source.stop().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
