//! Custom error types for the runner.
//!
//! Every subsystem owns a small `thiserror` enum describing the ways it can fail:
//!
//! - **`SerialError`**: the USB link to the LED/indicator controller.
//! - **`CameraError`**: the frame source and its driver.
//! - **`ShotError`**: mask/ROI validation, intensity processing and frame persistence.
//!   Camera and serial failures that happen *inside* a shot are wrapped so their
//!   original classification survives.
//!
//! `RunnerError` consolidates them for the dispatcher. The client never sees these
//! types directly; it only sees the coarse [`ErrorCode`] and a short message in the
//! `STATUS` response, both derived here so that the mapping lives in one place.

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the runner error type.
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

/// Fault classification reported to the client in the first byte of a `STATUS` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ErrorCode {
    /// No fault recorded.
    #[default]
    None = 0x00,
    /// Protocol or dispatch fault (e.g. unknown opcode).
    ServerError = 0x01,
    /// Camera missing or disconnected.
    CameraError = 0x02,
    /// Controller missing or disconnected.
    SerialError = 0x03,
    /// Mask, ROI, processing or image persistence fault.
    ShotWorkerError = 0x04,
    /// Anything that could not be classified.
    UnknownError = 0x0F,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte. Unrecognized values collapse to `UnknownError`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => ErrorCode::None,
            0x01 => ErrorCode::ServerError,
            0x02 => ErrorCode::CameraError,
            0x03 => ErrorCode::SerialError,
            0x04 => ErrorCode::ShotWorkerError,
            _ => ErrorCode::UnknownError,
        }
    }

    /// Whether a fault of this class forces the indicator into `ERROR`.
    ///
    /// `SerialError` is excluded: mirroring `ERROR` needs the link that just failed.
    pub fn forces_error_state(self) -> bool {
        !matches!(self, ErrorCode::None | ErrorCode::SerialError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::None => "None",
            ErrorCode::ServerError => "ServerError",
            ErrorCode::CameraError => "CameraError",
            ErrorCode::SerialError => "SerialError",
            ErrorCode::ShotWorkerError => "ShotWorkerError",
            ErrorCode::UnknownError => "UnknownError",
        };
        write!(f, "{} (0x{:02X})", name, self.as_u8())
    }
}

/// Failures of the controller link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("not found device")]
    NotDetected,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Invalid response to '{command}': '{response}'")]
    InvalidResponse { command: String, response: String },

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    FeatureDisabled,
}

/// Failures of the frame source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("not found camera")]
    NotDetected,

    #[error("Camera disconnected")]
    Disconnected,

    #[error("No camera frame available yet")]
    NoFrame,

    #[error("Invalid camera frame: {0}")]
    InvalidFrame(String),

    /// Driver hiccup worth retrying (e.g. a focus property write rejected once).
    #[error("Camera driver error: {0}")]
    Transient(String),
}

/// Failures of the shot pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShotError {
    #[error("Cannot load mask file: {0}")]
    MaskLoad(String),

    #[error("Invalid mask file: expected {expected_height}x{expected_width}, found {height}x{width}")]
    MaskShape {
        expected_height: u32,
        expected_width: u32,
        height: u32,
        width: u32,
    },

    #[error("Invalid mask file: no pixel selected")]
    MaskEmpty,

    #[error("Invalid reference position ({x}, {y})")]
    InvalidReference { x: i32, y: i32 },

    #[error("ROI outside of frame")]
    RoiOutOfFrame,

    #[error("Invalid fluorescence filter index {0}")]
    InvalidFilter(u8),

    #[error("image save error: {0}")]
    ImageSave(String),

    #[error("Shot worker stopped")]
    WorkerStopped,

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Serial(#[from] SerialError),
}

/// Top-level error type seen by the dispatcher and the server.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Shot(#[from] ShotError),

    #[error("Command not defined (opcode 0x{0:02X})")]
    CommandNotDefined(u8),

    #[error("Unexpected failure: {0}")]
    Unknown(String),
}

impl RunnerError {
    /// Coarse classification for the wire protocol.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RunnerError::Serial(_) => ErrorCode::SerialError,
            RunnerError::Camera(_) => ErrorCode::CameraError,
            RunnerError::Shot(ShotError::Serial(_)) => ErrorCode::SerialError,
            RunnerError::Shot(ShotError::Camera(_)) => ErrorCode::CameraError,
            RunnerError::Shot(_) => ErrorCode::ShotWorkerError,
            RunnerError::CommandNotDefined(_) => ErrorCode::ServerError,
            RunnerError::Config(_) | RunnerError::Io(_) | RunnerError::Unknown(_) => {
                ErrorCode::UnknownError
            }
        }
    }

    /// Message placed in the `STATUS` response.
    ///
    /// Unclassified failures are reported generically; their detail goes to the log.
    pub fn wire_message(&self) -> String {
        match self.error_code() {
            ErrorCode::UnknownError => "Software error".to_string(),
            _ => self.to_string(),
        }
    }
}
