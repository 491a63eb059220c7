//! Visualizer streaming sinks (spec §4.5 "Streaming boundary"). Adapters
//! speak a small contract — open channel, push image, push ROI set, close
//! — and live out-of-process; the executor never waits on them and stays
//! decoupled from their liveness. A bounded queue backs each sink so a slow
//! or dead consumer applies backpressure instead of unbounded memory
//! growth, the same shape as the teacher's `network_semaphore`-bounded
//! resource pool (`turbulance/orchestrator.rs`).

use tokio::sync::mpsc;

/// Identifies one pushed frame within the stream (spec §4.5).
#[derive(Debug, Clone)]
pub struct FrameId {
    pub well: String,
    pub site: Option<u32>,
    pub channel: Option<u32>,
    pub z_index: Option<u32>,
    pub timepoint: Option<u32>,
    pub step_index: usize,
}

#[derive(Debug, Clone)]
pub struct RoiSet {
    pub frame: FrameId,
    pub rois: Vec<(u32, u32, u32, u32)>, // (x, y, width, height) boxes; real ROI polygons are out of scope
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Image { frame: FrameId, path: String },
    Rois(RoiSet),
}

/// A streaming destination. Implementations live out of process (napari,
/// Fiji); this trait is the in-process half of the contract.
pub trait VisualizerSink: Send + Sync {
    fn push(&self, event: StreamEvent) -> Result<(), StreamError>;
    fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("streaming queue is full, dropping frame")]
    QueueFull,
    #[error("streaming sink is closed")]
    Closed,
}

/// A bounded-queue sink that hands events to a background task; `push`
/// never blocks the executor (spec §4.5 "must remain decoupled from their
/// liveness" — streaming failures do not fail the well).
pub struct QueuedSink {
    sender: mpsc::Sender<StreamEvent>,
}

impl QueuedSink {
    /// `capacity` bounds the queue; a full queue drops the newest frame
    /// rather than blocking the caller.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl VisualizerSink for QueuedSink {
    fn push(&self, event: StreamEvent) -> Result<(), StreamError> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(StreamError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StreamError::Closed),
        }
    }

    fn close(&self) {
        // Dropping the sender-side handle signals the consumer task; there
        // is no separate close frame on the wire.
    }
}

/// Pushes a step's produced files to every configured, enabled streaming
/// sink. Failures are logged and swallowed — streaming never fails a well
/// (spec §4.5).
pub fn push_to_all(sinks: &[&dyn VisualizerSink], frame: FrameId, produced_paths: &[String]) {
    for path in produced_paths {
        for sink in sinks {
            if let Err(err) = sink.push(StreamEvent::Image { frame: frame.clone(), path: path.clone() }) {
                log::warn!("streaming push failed for well {}: {err}", frame.well);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameId {
        FrameId { well: "A01".to_string(), site: Some(1), channel: Some(1), z_index: Some(1), timepoint: Some(1), step_index: 0 }
    }

    #[test]
    fn push_succeeds_within_capacity() {
        let (sink, _rx) = QueuedSink::new(4);
        assert!(sink.push(StreamEvent::Image { frame: frame(), path: "a.bin".to_string() }).is_ok());
    }

    #[test]
    fn push_reports_full_queue_without_blocking() {
        let (sink, _rx) = QueuedSink::new(1);
        sink.push(StreamEvent::Image { frame: frame(), path: "a.bin".to_string() }).unwrap();
        let result = sink.push(StreamEvent::Image { frame: frame(), path: "b.bin".to_string() });
        assert!(matches!(result, Err(StreamError::QueueFull)));
    }

    #[test]
    fn push_to_all_does_not_panic_on_closed_sink() {
        let (sink, rx) = QueuedSink::new(1);
        drop(rx);
        push_to_all(&[&sink], frame(), &["a.bin".to_string()]);
    }
}
