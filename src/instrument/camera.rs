//! Camera frame source.
//!
//! The camera free-runs on its own OS thread: every captured frame replaces the
//! previous one in a single-slot holder, so a reader always gets the most recent
//! complete frame and never one that is mid-write. When the driver reports a
//! failure the thread stops and the source is marked disconnected; readers see
//! that as [`CameraError::Disconnected`].
//!
//! The concrete driver (device enumeration, property control) sits behind
//! [`CaptureDevice`]. A synthetic device for emulation and tests lives in
//! [`crate::hardware::mock`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CameraError;

/// Colour channels per pixel (BGR, 8 bit each).
pub const CHANNELS: usize = 3;

/// A single 3-channel camera capture, BGR interleaved, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap raw BGR bytes.
    ///
    /// # Errors
    /// Returns `InvalidFrame` if `data` does not hold exactly `width * height * 3` bytes.
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CameraError> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(CameraError::InvalidFrame(format!(
                "{}x{} frame needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame with every pixel set to `bgr`.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw BGR bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Pixel at column `x`, row `y`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[offset], self.data[offset + 1], self.data[offset + 2]]
    }

    /// Overwrite the pixel at column `x`, row `y`.
    pub fn set_pixel(&mut self, x: u32, y: u32, bgr: [u8; 3]) {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        self.data[offset..offset + CHANNELS].copy_from_slice(&bgr);
    }

    /// Copy of the `width` x `height` rectangle whose top-left corner is at (`left`, `top`).
    ///
    /// Returns `None` if the rectangle does not fit inside the frame.
    pub fn crop(&self, top: u32, left: u32, width: u32, height: u32) -> Option<Frame> {
        let bottom = top.checked_add(height)?;
        let right = left.checked_add(width)?;
        if bottom > self.height || right > self.width {
            return None;
        }

        let row_bytes = width as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in top..bottom {
            let start = (row as usize * self.width as usize + left as usize) * CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Some(Frame {
            width,
            height,
            data,
        })
    }
}

/// Driver-side camera operations.
///
/// Methods may block for as long as the driver needs (a capture usually waits
/// for the next sensor readout).
pub trait CaptureDevice: Send + Sync {
    /// Block until the next frame is available.
    fn capture_frame(&self) -> Result<Frame, CameraError>;

    /// Apply a focus value. May fail transiently.
    fn set_focus(&self, value: i32) -> Result<(), CameraError>;

    /// Release the device.
    fn close(&self) {}
}

/// What the acquisition pipeline needs from a camera.
pub trait FrameSource: Send + Sync {
    /// Begin capturing. Calling it on a running source is a no-op.
    fn start(&self) -> std::io::Result<()>;

    /// Most recent complete frame.
    fn latest_frame(&self) -> Result<Arc<Frame>, CameraError>;

    /// Whether the capture loop has stopped because of a driver failure.
    fn disconnected(&self) -> bool;

    /// Apply a focus value. May fail transiently.
    fn set_focus(&self, value: i32) -> Result<(), CameraError>;

    /// Stop capturing and release the device.
    fn stop(&self);
}

/// Locates the capture device of an instrument by its id.
pub type CameraProvider =
    Box<dyn FnOnce(&str) -> Result<Arc<dyn CaptureDevice>, CameraError> + Send>;

/// Provider used when the build carries no camera driver.
pub fn no_camera_driver(instrument_id: &str) -> Result<Arc<dyn CaptureDevice>, CameraError> {
    error!("Cannot find camera for {}: no camera driver available", instrument_id);
    Err(CameraError::NotDetected)
}

/// Single-slot holder for the latest frame.
///
/// Written only by the capture thread; the frame is swapped in as a whole.
pub struct FrameSlot {
    latest: watch::Sender<Option<Arc<Frame>>>,
    disconnected: AtomicBool,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    /// Empty slot.
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Replace the held frame.
    pub fn publish(&self, frame: Frame) {
        self.latest.send_replace(Some(Arc::new(frame)));
    }

    /// Currently held frame, if any has been captured.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.borrow().clone()
    }

    /// Receiver that is notified on every new frame.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.latest.subscribe()
    }

    /// Flag the source as lost.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Whether the source was lost.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// Free-running capture loop feeding a [`FrameSlot`].
pub struct CameraWorker {
    device: Arc<dyn CaptureDevice>,
    slot: Arc<FrameSlot>,
    stop_flag: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CameraWorker {
    /// Worker for `device`. Nothing is captured until [`FrameSource::start`].
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            slot: Arc::new(FrameSlot::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// The slot this worker publishes into.
    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }
}

impl FrameSource for CameraWorker {
    fn start(&self) -> std::io::Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let device = self.device.clone();
        let slot = self.slot.clone();
        let stop_flag = self.stop_flag.clone();

        let handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                debug!("Start camera read");
                while !stop_flag.load(Ordering::SeqCst) {
                    match device.capture_frame() {
                        Ok(frame) => slot.publish(frame),
                        Err(e) => {
                            error!("Disconnected to camera: {}", e);
                            slot.mark_disconnected();
                            break;
                        }
                    }
                }
                debug!("Camera read loop finished");
            })?;

        *thread = Some(handle);
        info!("Camera capture started");
        Ok(())
    }

    fn latest_frame(&self) -> Result<Arc<Frame>, CameraError> {
        if self.slot.is_disconnected() {
            return Err(CameraError::Disconnected);
        }
        self.slot.latest().ok_or(CameraError::NoFrame)
    }

    fn disconnected(&self) -> bool {
        self.slot.is_disconnected()
    }

    fn set_focus(&self, value: i32) -> Result<(), CameraError> {
        if self.slot.is_disconnected() {
            return Err(CameraError::Disconnected);
        }
        self.device.set_focus(value)
    }

    fn stop(&self) {
        debug!("Start close camera thread");
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("Camera capture thread panicked");
            }
        }
        self.device.close();
        debug!("Camera close done");
    }
}
