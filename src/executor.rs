//! Sequential and pipelined execution of capture, inference and display.
//!
//! Both executors drive the same stations: read a frame, preprocess, run
//! the model, draw, hand off to the sink. The sequential one keeps a single
//! request in flight and blocks on it immediately. The pipelined one keeps
//! two request slots busy: the follow-up frame is captured, preprocessed and
//! submitted *before* blocking on the outstanding request, so host work and
//! device latency overlap instead of adding up.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use image::RgbImage;

use crate::{
    device::{InferDevice, RequestHandle, WaitOutcome},
    meter::Throughput,
    nn::{self, NnOut},
    postproc::{annotate_frame, OverlayOptions},
    preproc::{preprocess, InputLayout},
    sink::DisplaySink,
    source::FrameSource,
};

/// Cooperative cancellation flag, set by the operator (Ctrl-C) or by tests.
///
/// Once set, the executors capture no further frames and submit no further
/// requests; the in-flight request is still drained and delivered.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Settings shared by both executors.
pub struct PipelineConfig {
    pub input: InputLayout,
    pub overlay: OverlayOptions,
    /// Overlap limit for non-maximum suppression during decode.
    pub max_iou: f32,
    /// Upper bound for a single blocking wait; `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
}

impl PipelineConfig {
    pub fn new(input: InputLayout) -> Self {
        Self {
            input,
            overlay: OverlayOptions::default(),
            max_iou: 0.5,
            wait_timeout: None,
        }
    }
}

/// What a finished (or interrupted) run looked like.
#[derive(Debug)]
pub struct RunReport {
    pub frames: u64,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl RunReport {
    /// Cumulative average throughput of the whole run.
    pub fn fps(&self) -> f32 {
        self.frames as f32 / self.elapsed.as_secs_f32().max(f32::EPSILON)
    }
}

/// Run the strictly sequential loop: one request in flight, blocked on
/// immediately after every submission.
pub fn run_sync(
    source: &mut dyn FrameSource,
    device: &mut dyn InferDevice,
    sink: &mut dyn DisplaySink,
    cfg: &PipelineConfig,
    interrupt: &Interrupt,
) -> Result<RunReport> {
    source.start()?;
    let outcome = sync_loop(source, device, sink, cfg, interrupt);
    shutdown_source(source);
    outcome
}

/// Run the double-buffered loop over both request slots.
pub fn run_pipelined(
    source: &mut dyn FrameSource,
    device: &mut dyn InferDevice,
    sink: &mut dyn DisplaySink,
    cfg: &PipelineConfig,
    interrupt: &Interrupt,
) -> Result<RunReport> {
    source.start()?;
    let outcome = pipelined_loop(source, device, sink, cfg, interrupt);
    shutdown_source(source);
    outcome
}

fn sync_loop(
    source: &mut dyn FrameSource,
    device: &mut dyn InferDevice,
    sink: &mut dyn DisplaySink,
    cfg: &PipelineConfig,
    interrupt: &Interrupt,
) -> Result<RunReport> {
    let handle = RequestHandle::A;
    let mut meter = Throughput::start();

    while let Some(frame) = capture(source, interrupt)? {
        device.submit(handle, preprocess(&frame, &cfg.input))?;
        wait_ready(device, handle, cfg.wait_timeout)?;
        let raw = device.take_output(handle)?;
        deliver(frame, &raw, &mut meter, sink, cfg)?;
    }

    Ok(report(&meter, interrupt))
}

fn pipelined_loop(
    source: &mut dyn FrameSource,
    device: &mut dyn InferDevice,
    sink: &mut dyn DisplaySink,
    cfg: &PipelineConfig,
    interrupt: &Interrupt,
) -> Result<RunReport> {
    let mut meter = Throughput::start();
    let mut current = RequestHandle::A;

    // Prime the first slot.
    let mut current_frame = match capture(source, interrupt)? {
        Some(frame) => frame,
        None => return Ok(report(&meter, interrupt)),
    };
    device.submit(current, preprocess(&current_frame, &cfg.input))?;

    loop {
        // The follow-up request must be in flight before we block on the
        // current one.
        let next_frame = capture(source, interrupt)?;
        if let Some(frame) = &next_frame {
            device.submit(current.other(), preprocess(frame, &cfg.input))?;
        }

        wait_ready(device, current, cfg.wait_timeout)?;
        let raw = device.take_output(current)?;

        match next_frame {
            Some(frame) => {
                let completed = mem::replace(&mut current_frame, frame);
                deliver(completed, &raw, &mut meter, sink, cfg)?;
                // The slot just freed becomes the next submission target.
                current = current.other();
            }
            None => {
                // Drained: the last in-flight frame is still delivered.
                deliver(current_frame, &raw, &mut meter, sink, cfg)?;
                break;
            }
        }
    }

    Ok(report(&meter, interrupt))
}

/// One frame from the source, with a recognized interrupt folded into
/// end-of-stream.
fn capture(source: &mut dyn FrameSource, interrupt: &Interrupt) -> Result<Option<RgbImage>> {
    if interrupt.is_set() {
        log::info!("Interrupt recognized, closing the stream");
        return Ok(None);
    }
    source.next_frame()
}

fn wait_ready(
    device: &mut dyn InferDevice,
    handle: RequestHandle,
    timeout: Option<Duration>,
) -> Result<()> {
    match device.wait(handle, timeout)? {
        WaitOutcome::Ready => Ok(()),
        WaitOutcome::Pending => bail!(
            "inference request on slot {} did not complete in time",
            handle.index()
        ),
    }
}

/// Decode, annotate and display one completed work item.
fn deliver(
    frame: RgbImage,
    raw: &NnOut,
    meter: &mut Throughput,
    sink: &mut dyn DisplaySink,
    cfg: &PipelineConfig,
) -> Result<()> {
    let fps = meter.record();
    let detections = nn::decode_detections(raw, cfg.overlay.confidence_threshold, cfg.max_iou)?;
    let annotated = annotate_frame(frame, &detections, fps, &cfg.overlay);

    if let Err(err) = sink.show(annotated) {
        log::warn!("Display failed: {err:#}");
    }

    Ok(())
}

fn shutdown_source(source: &mut dyn FrameSource) {
    if let Err(err) = source.stop() {
        log::warn!("Stopping the source failed: {err:#}");
    }
}

fn report(meter: &Throughput, interrupt: &Interrupt) -> RunReport {
    RunReport {
        frames: meter.delivered(),
        elapsed: meter.elapsed(),
        interrupted: interrupt.is_set(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::NullSink;

    /// Device that completes instantly with an empty detection set.
    #[derive(Default)]
    struct InstantDevice {
        submitted: Vec<usize>,
        ready: [Option<NnOut>; 2],
    }

    fn empty_output() -> NnOut {
        use tract_onnx::prelude::*;
        let confidences = tract_ndarray::Array3::<f32>::zeros((1, 0, 2));
        let bboxes = tract_ndarray::Array3::<f32>::zeros((1, 0, 4));
        smallvec::smallvec![confidences.into_arc_tensor(), bboxes.into_arc_tensor()]
    }

    impl InferDevice for InstantDevice {
        fn submit(&mut self, handle: RequestHandle, _input: tract_onnx::prelude::Tensor) -> Result<()> {
            self.submitted.push(handle.index());
            self.ready[handle.index()] = Some(empty_output());
            Ok(())
        }

        fn wait(&mut self, handle: RequestHandle, _timeout: Option<Duration>) -> Result<WaitOutcome> {
            if self.ready[handle.index()].is_some() {
                Ok(WaitOutcome::Ready)
            } else {
                bail!("nothing submitted")
            }
        }

        fn take_output(&mut self, handle: RequestHandle) -> Result<NnOut> {
            self.ready[handle.index()]
                .take()
                .ok_or_else(|| anyhow::anyhow!("no output"))
        }
    }

    struct CountingSource {
        frames: u64,
        produced: u64,
        stops: u64,
    }

    impl CountingSource {
        fn new(frames: u64) -> Self {
            Self {
                frames,
                produced: 0,
                stops: 0,
            }
        }
    }

    impl FrameSource for CountingSource {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            if self.produced >= self.frames {
                return Ok(None);
            }
            self.produced += 1;
            Ok(Some(RgbImage::new(32, 32)))
        }

        fn stop(&mut self) -> Result<()> {
            self.stops += 1;
            Ok(())
        }
    }

    fn tiny_config() -> PipelineConfig {
        PipelineConfig::new(InputLayout::ultraface_320().with_size(16, 16))
    }

    #[test]
    fn empty_stream_delivers_nothing_and_submits_nothing() {
        let mut source = CountingSource::new(0);
        let mut device = InstantDevice::default();
        let mut sink = NullSink::default();

        let report = run_pipelined(
            &mut source,
            &mut device,
            &mut sink,
            &tiny_config(),
            &Interrupt::default(),
        )
        .unwrap();

        assert_eq!(report.frames, 0);
        assert!(device.submitted.is_empty());
        assert_eq!(source.stops, 1);
    }

    #[test]
    fn preset_interrupt_prevents_any_submission() {
        let interrupt = Interrupt::default();
        interrupt.set();

        let mut source = CountingSource::new(5);
        let mut device = InstantDevice::default();
        let mut sink = NullSink::default();

        let report = run_sync(&mut source, &mut device, &mut sink, &tiny_config(), &interrupt)
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.frames, 0);
        assert!(device.submitted.is_empty());
        assert_eq!(source.stops, 1);
    }

    #[test]
    fn pipelined_run_alternates_slots_and_delivers_every_frame() {
        let mut source = CountingSource::new(4);
        let mut device = InstantDevice::default();
        let mut sink = NullSink::default();

        let report = run_pipelined(
            &mut source,
            &mut device,
            &mut sink,
            &tiny_config(),
            &Interrupt::default(),
        )
        .unwrap();

        assert_eq!(report.frames, 4);
        assert_eq!(sink.shown(), 4);
        assert_eq!(device.submitted, vec![0, 1, 0, 1]);
        assert_eq!(source.stops, 1);
    }

    #[test]
    fn sync_run_reuses_a_single_slot() {
        let mut source = CountingSource::new(3);
        let mut device = InstantDevice::default();
        let mut sink = NullSink::default();

        let report = run_sync(
            &mut source,
            &mut device,
            &mut sink,
            &tiny_config(),
            &Interrupt::default(),
        )
        .unwrap();

        assert_eq!(report.frames, 3);
        assert_eq!(device.submitted, vec![0, 0, 0]);
    }
}
