//! Inference device abstraction.
//!
//! The executors talk to the model through [`InferDevice`]: a fixed pair of
//! request slots with a non-blocking `submit` and a blocking `wait` per slot.
//! The device runs inference concurrently with the caller, so host-side
//! capture and preprocessing can proceed while a request is in flight.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tract_onnx::prelude::*;

use crate::nn::{NnModel, NnOut};

/// Number of fixed request slots a device exposes.
pub const NUM_SLOTS: usize = 2;

/// Token for one of the device's fixed request slots.
///
/// Handles are reused across iterations, never reallocated; the pipelined
/// executor toggles between the two with [`RequestHandle::other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHandle(usize);

impl RequestHandle {
    pub const A: RequestHandle = RequestHandle(0);
    pub const B: RequestHandle = RequestHandle(1);

    pub fn index(&self) -> usize {
        self.0
    }

    /// The opposite slot.
    pub fn other(&self) -> RequestHandle {
        RequestHandle(1 - self.0)
    }
}

/// Outcome of waiting on a request slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The result is complete and can be taken.
    Ready,
    /// The wait timed out before the request completed.
    Pending,
}

/// A compute device with two reusable request slots.
pub trait InferDevice {
    /// Queue `input` on the given slot. Returns immediately; submitting to a
    /// slot that still has a request in flight is an error.
    fn submit(&mut self, handle: RequestHandle, input: Tensor) -> Result<()>;

    /// Block until the slot's request completes, or until `timeout` elapses
    /// when one is given. Once a request has completed, further waits on the
    /// same slot return `Ready` until the output is taken.
    fn wait(&mut self, handle: RequestHandle, timeout: Option<Duration>) -> Result<WaitOutcome>;

    /// Consume the completed result of the given slot.
    fn take_output(&mut self, handle: RequestHandle) -> Result<NnOut>;
}

struct Slot {
    input_tx: SyncSender<Tensor>,
    result_rx: Receiver<TractResult<NnOut>>,
    completed: Option<NnOut>,
}

/// Tract-backed [`InferDevice`].
///
/// Each slot is served by a dedicated worker thread holding the shared model
/// plan; the bounded request channel keeps at most one request per slot in
/// flight. Workers exit when the device (and with it the input channels) is
/// dropped.
pub struct OnnxDevice {
    slots: [Slot; NUM_SLOTS],
}

impl OnnxDevice {
    pub fn new(model: NnModel) -> Result<Self> {
        let model = Arc::new(model);
        let slot_a = spawn_slot_worker(Arc::clone(&model), 0)?;
        let slot_b = spawn_slot_worker(model, 1)?;

        Ok(Self {
            slots: [slot_a, slot_b],
        })
    }
}

fn spawn_slot_worker(model: Arc<NnModel>, index: usize) -> Result<Slot> {
    let (input_tx, input_rx) = mpsc::sync_channel::<Tensor>(1);
    let (result_tx, result_rx) = mpsc::sync_channel::<TractResult<NnOut>>(1);

    let _worker = thread::Builder::new()
        .name(format!("infer-slot-{index}"))
        .spawn(move || {
            while let Ok(tensor) = input_rx.recv() {
                let result = model
                    .run(tvec!(tensor.into()))
                    .map(|out| out.into_iter().map(|t| t.into_arc_tensor()).collect());
                if result_tx.send(result).is_err() {
                    break;
                }
            }
            log::debug!("Inference worker {index} shutting down");
        })
        .context("spawning inference worker")?;

    Ok(Slot {
        input_tx,
        result_rx,
        completed: None,
    })
}

impl InferDevice for OnnxDevice {
    fn submit(&mut self, handle: RequestHandle, input: Tensor) -> Result<()> {
        let slot = &mut self.slots[handle.index()];
        match slot.input_tx.try_send(input) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                bail!("slot {} already has a request in flight", handle.index())
            }
            Err(TrySendError::Disconnected(_)) => {
                bail!("inference worker {} terminated", handle.index())
            }
        }
    }

    fn wait(&mut self, handle: RequestHandle, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let slot = &mut self.slots[handle.index()];
        if slot.completed.is_some() {
            return Ok(WaitOutcome::Ready);
        }

        let received = match timeout {
            Some(timeout) => match slot.result_rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => return Ok(WaitOutcome::Pending),
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("inference worker {} terminated", handle.index())
                }
            },
            None => slot
                .result_rx
                .recv()
                .with_context(|| format!("inference worker {} terminated", handle.index()))?,
        };

        slot.completed = Some(received?);
        Ok(WaitOutcome::Ready)
    }

    fn take_output(&mut self, handle: RequestHandle) -> Result<NnOut> {
        self.slots[handle.index()]
            .completed
            .take()
            .with_context(|| format!("no completed result on slot {}", handle.index()))
    }
}
