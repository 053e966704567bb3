//! Screen and camera capture, live webcam sessions and saved proof clips.

mod camera;
mod proof_store;
mod screen;
mod webcam;

use thiserror::Error;

pub use camera::{take_jpeg, CameraDevice, CameraLease, CameraSlot, CameraStream, FfmpegCamera};
pub use proof_store::{ProofMeta, ProofStore, ProofStoreError};
pub use screen::{ScreenCapture, ShellScreenCapture};
pub use webcam::{FrameSink, ProofSink, WebcamStreamManager};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture device is held by another session")]
    Busy,
    #[error("capture failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CaptureError> for crate::error::AppError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Unavailable(_) | CaptureError::Busy => crate::error::AppError::resource("capture_unavailable", e.to_string()),
            CaptureError::Failed(_) | CaptureError::Io(_) => crate::error::AppError::io("capture_failed", e.to_string()),
        }
    }
}
