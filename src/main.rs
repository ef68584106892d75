use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::TimestampPrecision;

use pipecam::{
    device::OnnxDevice,
    executor::{run_pipelined, run_sync, Interrupt, PipelineConfig, RunReport},
    nn,
    postproc::load_overlay_font,
    preproc::InputLayout,
    sink::{DisplaySink, JpegDirSink, NullSink},
    source::{CameraSource, FrameSource, ImageDirSource, SyntheticSource},
};

#[derive(Parser)]
#[command(name = "pipecam", about = "Sequential vs. pipelined video inference")]
struct Opts {
    /// Path to the Ultraface ONNX model
    #[arg(short, long)]
    model: PathBuf,

    /// Frame source: "synthetic", a directory of images, or a V4L2 device
    /// such as /dev/video0
    #[arg(short, long, default_value = "synthetic")]
    source: String,

    /// How to drive the device
    #[arg(long, value_enum, default_value_t = Mode::Compare)]
    mode: Mode,

    /// Number of frames per run for the synthetic and camera sources
    #[arg(short = 'n', long, default_value_t = 60)]
    frames: u64,

    /// Directory for annotated output frames; omitted frames are discarded
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Overlay font; falls back to well-known DejaVu locations
    #[arg(long)]
    font: Option<PathBuf>,

    /// Per-request wait limit in milliseconds; unbounded when omitted
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Model input width
    #[arg(long, default_value_t = 320)]
    input_width: u32,

    /// Model input height
    #[arg(long, default_value_t = 240)]
    input_height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Sync,
    Pipelined,
    Compare,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let opts = Opts::parse();

    let interrupt = Interrupt::default();
    let ctrl_c_flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, finishing the in-flight frame");
            ctrl_c_flag.set();
        }
    });

    let results = tokio::task::spawn_blocking(move || run_requested(opts, interrupt))
        .await
        .context("executor task panicked")??;

    for (label, report) in &results {
        log::info!(
            "{label}: {} frames in {:.2}s ({:.2} fps){}",
            report.frames,
            report.elapsed.as_secs_f32(),
            report.fps(),
            if report.interrupted {
                ", interrupted"
            } else {
                ""
            }
        );
    }

    if let [(_, sync_report), (_, pipelined_report)] = &results[..] {
        if sync_report.frames > 0 && pipelined_report.frames > 0 {
            log::info!(
                "Pipelined speedup over sequential: {:.2}x",
                pipelined_report.fps() / sync_report.fps().max(f32::EPSILON)
            );
        }
    }

    Ok(())
}

fn run_requested(opts: Opts, interrupt: Interrupt) -> Result<Vec<(&'static str, RunReport)>> {
    let input = InputLayout::ultraface_320().with_size(opts.input_width, opts.input_height);
    let model = nn::load_model(&opts.model, &input)?;
    let mut device = OnnxDevice::new(model)?;

    let mut cfg = PipelineConfig::new(input);
    cfg.overlay.font = load_overlay_font(opts.font.as_deref());
    cfg.wait_timeout = opts.timeout_ms.map(Duration::from_millis);

    let mut results = Vec::new();
    let modes: &[Mode] = match opts.mode {
        Mode::Sync => &[Mode::Sync],
        Mode::Pipelined => &[Mode::Pipelined],
        Mode::Compare => &[Mode::Sync, Mode::Pipelined],
    };

    for mode in modes {
        // Sources are not restartable, so every run gets a fresh one.
        let mut source = build_source(&opts)?;
        let mut sink = build_sink(&opts, *mode)?;

        let (label, report) = match mode {
            Mode::Sync => (
                "sequential",
                run_sync(
                    source.as_mut(),
                    &mut device,
                    sink.as_mut(),
                    &cfg,
                    &interrupt,
                )?,
            ),
            _ => (
                "pipelined",
                run_pipelined(
                    source.as_mut(),
                    &mut device,
                    sink.as_mut(),
                    &cfg,
                    &interrupt,
                )?,
            ),
        };
        results.push((label, report));
    }

    Ok(results)
}

fn build_source(opts: &Opts) -> Result<Box<dyn FrameSource>> {
    if opts.source == "synthetic" {
        return Ok(Box::new(SyntheticSource::new(opts.frames, 640, 480)));
    }

    let path = PathBuf::from(&opts.source);
    if path.is_dir() {
        Ok(Box::new(ImageDirSource::new(path)))
    } else {
        Ok(Box::new(
            CameraSource::new(opts.source.clone()).with_max_frames(opts.frames),
        ))
    }
}

fn build_sink(opts: &Opts, mode: Mode) -> Result<Box<dyn DisplaySink>> {
    match &opts.out_dir {
        Some(dir) => {
            // Keep the two runs of a comparison apart.
            let dir = match mode {
                Mode::Sync => dir.join("sync"),
                _ => dir.join("pipelined"),
            };
            Ok(Box::new(JpegDirSink::new(dir)?))
        }
        None => Ok(Box::new(NullSink::default())),
    }
}
