//! Detector arbitration over a pool of accelerator workers.
//!
//! All cameras feed one bounded FIFO of detection requests. A dispatcher
//! thread hands each request to the next idle worker; every worker owns one
//! accelerator (one loaded model) exclusively. Because each camera gates at
//! most one outstanding request, FIFO order alone keeps cameras fair.
//!
//! Failure policy: a failed request is requeued once and then fails with
//! [`DetectError::Unavailable`]; a worker whose model is broken is removed
//! from rotation.

use std::time::Duration;

mod backend;
mod pool;
mod postprocess;

pub use backend::{
    dequantize, quantized_input_prescale, AccelBackend, BackendError, ModelOutput, StaticBackend,
    YoloRow,
};
#[cfg(feature = "onnx")]
pub use backend::onnx::OnnxBackend;
pub use pool::{
    BackendFactory, DetectionOutcome, DetectorPool, PoolSettings, WorkerInfo,
};
pub use postprocess::{ClassAggregation, PostProcess};

/// Default timeout a requester waits for one detection.
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum score for a row to survive postprocessing.
pub const SCORE_MIN: f32 = 0.4;

/// IoU threshold for non-maximum suppression of YOLO-style outputs.
pub const NMS_IOU: f32 = 0.45;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// No worker could complete the request (after one requeue), or no
    /// workers remain in rotation.
    #[error("detector unavailable")]
    Unavailable,
    /// The requester's deadline elapsed; the camera skips this frame.
    #[error("detection timed out")]
    Timeout,
    /// The global queue was full; the planner skips inference this frame.
    #[error("detection queue full")]
    QueueFull,
    #[error("detector pool is shut down")]
    ShutDown,
}
