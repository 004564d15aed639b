//! Instrument-level device access.

pub mod camera;
pub mod serial_channel;

pub use camera::{CameraWorker, CaptureDevice, Frame, FrameSource};
pub use serial_channel::SerialChannel;
