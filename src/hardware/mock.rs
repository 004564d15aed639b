//! Simulated hardware for emulation and tests.
//!
//! - `SimulatedController` - LED/indicator controller answering the serial mini-protocol
//! - `SyntheticCamera` - capture device returning a fixed frame at a fixed rate
//!
//! Both are cheap to clone/share and expose their internal state so tests can
//! assert exactly what the runner sent to the hardware. Failure injection is
//! counted: `fail_writes(2)` makes the next two writes fail and later ones succeed.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::serial_adapter::{ClearBuffer, SerialTransport};
use crate::error::CameraError;
use crate::instrument::camera::{CaptureDevice, Frame};

static NEXT_CONTROLLER: AtomicUsize = AtomicUsize::new(0);

// =============================================================================
// SimulatedController - LED/indicator controller
// =============================================================================

#[derive(Debug)]
struct ControllerState {
    identity: String,
    led_pwm: u32,
    excitation_led: bool,
    device_state: u8,
    reference: (i32, i32),
    overrides: HashMap<String, String>,
    replies: VecDeque<String>,
    commands: Vec<String>,
    recording: bool,
    write_failures: u32,
    read_failures: u32,
    write_attempts: u32,
    read_attempts: u32,
    unplugged: bool,
}

/// In-memory controller board.
///
/// Understands `v`, `P <n>`, `p`, `E <0|1>`, `e`, `I <n>`, `i` and `m`. Test
/// controllers record every successfully written command without its line
/// ending; [`SimulatedController::emulated`] keeps no log.
///
/// # Example
///
/// ```rust,ignore
/// let controller = SimulatedController::new("HelloPCR00001");
/// let channel = SerialChannel::new(Box::new(controller.clone()), RetryPolicy::default());
/// channel.set_excitation_led(true).await?;
/// assert!(controller.excitation_led());
/// ```
#[derive(Clone, Debug)]
pub struct SimulatedController {
    name: String,
    state: Arc<Mutex<ControllerState>>,
}

impl SimulatedController {
    /// Controller identifying as `identity`, reference position (1000, 600).
    pub fn new(identity: &str) -> Self {
        Self::with_reference(identity, 1000, 600)
    }

    /// Controller reporting `(x, y)` for the reference-position query.
    pub fn with_reference(identity: &str, x: i32, y: i32) -> Self {
        Self::build(identity, (x, y), true)
    }

    /// Controller backing `--emulate`: same protocol, no command log.
    pub fn emulated(identity: &str, x: i32, y: i32) -> Self {
        Self::build(identity, (x, y), false)
    }

    fn build(identity: &str, reference: (i32, i32), recording: bool) -> Self {
        let index = NEXT_CONTROLLER.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("sim://controller-{}", index),
            state: Arc::new(Mutex::new(ControllerState {
                identity: identity.to_string(),
                led_pwm: 0,
                excitation_led: false,
                device_state: 0,
                reference,
                overrides: HashMap::new(),
                replies: VecDeque::new(),
                commands: Vec::new(),
                recording,
                write_failures: 0,
                read_failures: 0,
                write_attempts: 0,
                read_attempts: 0,
                unplugged: false,
            })),
        }
    }

    /// Unique link name.
    pub fn name(&self) -> String {
        self.name.clone()
    }

    /// Commands received so far, oldest first. Always empty for [`SimulatedController::emulated`].
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Forget recorded commands.
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Make the next `count` writes fail.
    pub fn fail_writes(&self, count: u32) {
        self.state.lock().write_failures = count;
    }

    /// Make the next `count` reads fail.
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().read_failures = count;
    }

    /// Answer `command` with `response` instead of the real value.
    pub fn override_response(&self, command: &str, response: &str) {
        self.state
            .lock()
            .overrides
            .insert(command.to_string(), response.to_string());
    }

    /// Fail every write and read from now on.
    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
    }

    /// Total write attempts, failed ones included.
    pub fn write_attempts(&self) -> u32 {
        self.state.lock().write_attempts
    }

    /// Total read attempts, failed ones included.
    pub fn read_attempts(&self) -> u32 {
        self.state.lock().read_attempts
    }

    /// Current excitation LED state.
    pub fn excitation_led(&self) -> bool {
        self.state.lock().excitation_led
    }

    /// Current LED PWM value.
    pub fn led_pwm(&self) -> u32 {
        self.state.lock().led_pwm
    }

    /// Current indicator state, as last written with `I <n>`.
    pub fn device_state(&self) -> u8 {
        self.state.lock().device_state
    }
}

impl ControllerState {
    fn execute(&mut self, command: &str) {
        if let Some(response) = self.overrides.get(command) {
            let response = response.clone();
            self.replies.push_back(response);
            return;
        }

        let mut parts = command.split_whitespace();
        let op = parts.next().unwrap_or_default();
        let arg = parts.next().and_then(|a| a.parse::<u32>().ok());

        match (op, arg) {
            ("v", _) => {
                let identity = self.identity.clone();
                self.replies.push_back(identity);
            }
            ("P", Some(value)) => self.led_pwm = value,
            ("p", _) => self.replies.push_back(self.led_pwm.to_string()),
            ("E", Some(value)) => self.excitation_led = value != 0,
            ("e", _) => self
                .replies
                .push_back(u8::from(self.excitation_led).to_string()),
            ("I", Some(value)) => self.device_state = value as u8,
            ("i", _) => self.replies.push_back(self.device_state.to_string()),
            ("m", _) => {
                let (x, y) = self.reference;
                self.replies.push_back(format!("{} {}", x, y));
            }
            _ => {}
        }
    }
}

impl SerialTransport for SimulatedController {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        state.write_attempts += 1;
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }

        let command = String::from_utf8_lossy(bytes).trim_end().to_string();
        if state.recording {
            state.commands.push(command.clone());
        }
        state.execute(&command);
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut state = self.state.lock();
        state.read_attempts += 1;
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "injected read timeout"));
        }
        state
            .replies
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no reply pending"))
    }

    fn clear(&mut self, buffer: ClearBuffer) -> io::Result<()> {
        if matches!(buffer, ClearBuffer::Input | ClearBuffer::All) {
            self.state.lock().replies.clear();
        }
        Ok(())
    }
}

// =============================================================================
// SyntheticCamera - capture device
// =============================================================================

/// Capture device producing a fixed frame every `interval`.
pub struct SyntheticCamera {
    frame: Mutex<Frame>,
    interval: Duration,
    focus: AtomicI32,
    focus_failures: AtomicU32,
    focus_attempts: AtomicU32,
    frames_captured: AtomicU32,
    unplugged: AtomicBool,
    closed: AtomicBool,
}

impl SyntheticCamera {
    /// Camera producing `frame` every 5ms.
    pub fn new(frame: Frame) -> Self {
        Self::with_interval(frame, Duration::from_millis(5))
    }

    /// Camera producing `frame` every `interval`.
    pub fn with_interval(frame: Frame, interval: Duration) -> Self {
        Self {
            frame: Mutex::new(frame),
            interval,
            focus: AtomicI32::new(0),
            focus_failures: AtomicU32::new(0),
            focus_attempts: AtomicU32::new(0),
            frames_captured: AtomicU32::new(0),
            unplugged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the frame returned by subsequent captures.
    pub fn set_frame(&self, frame: Frame) {
        *self.frame.lock() = frame;
    }

    /// Make the next `count` focus writes fail transiently.
    pub fn fail_focus(&self, count: u32) {
        self.focus_failures.store(count, Ordering::SeqCst);
    }

    /// Focus writes attempted so far.
    pub fn focus_attempts(&self) -> u32 {
        self.focus_attempts.load(Ordering::SeqCst)
    }

    /// Last focus value applied successfully.
    pub fn focus(&self) -> i32 {
        self.focus.load(Ordering::SeqCst)
    }

    /// Frames delivered so far.
    pub fn frames_captured(&self) -> u32 {
        self.frames_captured.load(Ordering::SeqCst)
    }

    /// Fail every capture from now on.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for SyntheticCamera {
    fn capture_frame(&self) -> Result<Frame, CameraError> {
        std::thread::sleep(self.interval);
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(CameraError::Disconnected);
        }
        self.frames_captured.fetch_add(1, Ordering::SeqCst);
        Ok(self.frame.lock().clone())
    }

    fn set_focus(&self, value: i32) -> Result<(), CameraError> {
        self.focus_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.focus_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.focus_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CameraError::Transient("focus property rejected".to_string()));
        }
        self.focus.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
