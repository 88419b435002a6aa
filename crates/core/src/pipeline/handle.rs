//! Generation streams and the consumer-facing handles that read them.
//!
//! Each request owns one [`GenerationStream`]; the pipeline thread pushes
//! output frames into it and the consumer reads them through the paired
//! [`GenerationHandle`]. Dropping the handle signals cancellation back to
//! the pipeline, which reacts at the end of its next step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::sequence::TokenId;

/// Terminal and non-terminal states of one generation stream (and of the
/// individual sequences feeding it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Running,
    Finished,
    /// The scheduler could not admit a single token for this request.
    OutOfMemory,
    /// The consumer dropped its handle before generation completed.
    Dropped,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-sequence payload of one output frame.
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub generated_ids: Vec<TokenId>,
    pub generated_log_probs: Vec<f32>,
    /// Cumulative log-probability of the sequence, used to rank outputs.
    pub score: f32,
    pub finished: bool,
}

/// One frame of streamed output, keyed by the sequence's grouped id.
///
/// An empty frame is the final "unblock" notification pushed when a request
/// is reaped without producing further tokens.
pub type GenerationOutputs = HashMap<u64, GenerationOutput>;

/// Producer side of a request's output queue. Owned by the request's
/// [`SequenceGroup`]; only the pipeline thread pushes into it.
///
/// [`SequenceGroup`]: crate::sequence::SequenceGroup
#[derive(Debug)]
pub struct GenerationStream {
    sender: Sender<GenerationOutputs>,
    status: Mutex<GenerationStatus>,
    dropped: AtomicBool,
}

impl GenerationStream {
    pub(crate) fn create() -> (Arc<Self>, GenerationHandle) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stream = Arc::new(Self {
            sender,
            status: Mutex::new(GenerationStatus::Running),
            dropped: AtomicBool::new(false),
        });
        let handle = GenerationHandle {
            receiver,
            stream: Arc::clone(&stream),
        };
        (stream, handle)
    }

    pub(crate) fn push(&self, outputs: GenerationOutputs) {
        // A disconnected receiver just means the consumer went away; the
        // dropped flag already tracks that.
        let _ = self.sender.send(outputs);
    }

    /// Push an empty frame so a blocked reader wakes up.
    pub(crate) fn push_empty(&self) {
        let _ = self.sender.send(GenerationOutputs::new());
    }

    pub(crate) fn set_status(&self, status: GenerationStatus) {
        *self.status.lock() = status;
    }

    pub fn status(&self) -> GenerationStatus {
        *self.status.lock()
    }

    pub(crate) fn handle_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Consumer side of a request's output queue.
///
/// Reads block on the pipeline producing the next frame. Dropping the handle
/// (or calling [`GenerationHandle::cancel`]) marks the request for reaping;
/// the pipeline frees its KV blocks and pushes a final empty frame within
/// one step.
#[derive(Debug)]
pub struct GenerationHandle {
    receiver: Receiver<GenerationOutputs>,
    stream: Arc<GenerationStream>,
}

impl GenerationHandle {
    /// Block until the next output frame arrives.
    ///
    /// Returns `None` once the stream is closed and drained.
    pub fn read(&self) -> Option<GenerationOutputs> {
        self.receiver.recv().ok()
    }

    /// Non-blocking read of the next frame, if one is queued.
    pub fn try_read(&self) -> Option<GenerationOutputs> {
        self.receiver.try_recv().ok()
    }

    /// Whether a frame is ready to read without blocking.
    pub fn can_read(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Block for the next frame, then drain to the most recent one.
    pub fn back(&self) -> Option<GenerationOutputs> {
        let mut last = self.receiver.recv().ok()?;
        while let Ok(frame) = self.receiver.try_recv() {
            if !frame.is_empty() {
                last = frame;
            }
        }
        Some(last)
    }

    /// Drain every queued frame.
    pub fn read_all(&self) -> Vec<GenerationOutputs> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn status(&self) -> GenerationStatus {
        self.stream.status()
    }

    /// Signal cancellation without consuming the handle.
    pub fn cancel(&self) {
        self.stream.dropped.store(true, Ordering::Release);
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        if !self.stream.status().is_terminal() {
            self.stream.dropped.store(true, Ordering::Release);
        }
    }
}
