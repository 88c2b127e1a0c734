use std::path::PathBuf;

/// Errors from the frame source.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device {index} unavailable: {source}")]
    DeviceUnavailable {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("frame dropped: {0}")]
    FrameDropped(String),
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
}

/// A control command that cannot be applied in the current state. The
/// state machine is left unchanged; the issuing client receives an
/// `error` message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("cannot start session: marker not detected")]
    MarkerNotDetected,
    #[error("cannot start HOLD session without calibration")]
    NotCalibrated,
    #[error("calibration radius must be positive")]
    ZeroRadius,
    #[error("{0} is only valid while no session is running")]
    SessionRunning(&'static str),
    #[error("calibration clicks are only accepted in HOLD mode")]
    WrongMode,
}

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write session history to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize session history: {0}")]
    Serialize(#[from] serde_json::Error),
}
