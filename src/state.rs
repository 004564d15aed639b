//! Device state and the process-wide fault record.
//!
//! [`Supervisor`] is the single shared owner of two pieces of state that every
//! other component consults:
//!
//! - the **fault record**: the first fault raised anywhere in the runner. It is
//!   sticky until restart and gates every client command except `EXIT`.
//! - the **device state machine**: `OFF`/`READY`/`RUNNING`/`ERROR`, mirrored to
//!   the controller's indicator with `I <n>`.
//!
//! The internal mutex is only held for bookkeeping, never across serial I/O.

use parking_lot::Mutex;
use std::fmt;
use tracing::{error, info, warn};

use crate::error::{ErrorCode, RunnerError, SerialError};
use crate::instrument::serial_channel::SerialChannel;

/// Indicator state of the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    /// Idle, indicator off
    Off = 0,
    /// Client connected, waiting for a run
    Ready = 1,
    /// PCR run in progress
    Running = 2,
    /// Fault or explicit error; sticky until restart
    Error = 3,
}

impl DeviceState {
    /// Value sent with `I <n>`.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DeviceState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(DeviceState::Off),
            1 => Ok(DeviceState::Ready),
            2 => Ok(DeviceState::Running),
            3 => Ok(DeviceState::Error),
            other => Err(other),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Off => "OFF",
            DeviceState::Ready => "READY",
            DeviceState::Running => "RUNNING",
            DeviceState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A recorded fault as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Wire classification
    pub code: ErrorCode,
    /// Short message for the `STATUS` response
    pub message: String,
}

impl From<&RunnerError> for Fault {
    fn from(err: &RunnerError) -> Self {
        Self {
            code: err.error_code(),
            message: err.wire_message(),
        }
    }
}

/// Indicator state plus the link used to mirror it.
///
/// The state is unset until the first transition. Entering `ERROR` latches
/// until restart, even if teardown later powers the indicator off.
#[derive(Debug, Default)]
pub struct DeviceStateMachine {
    current: Option<DeviceState>,
    error_latched: bool,
    serial: Option<SerialChannel>,
}

impl DeviceStateMachine {
    /// State machine mirroring through `serial`, if a controller is attached.
    pub fn new(serial: Option<SerialChannel>) -> Self {
        Self {
            current: None,
            error_latched: false,
            serial,
        }
    }

    /// Current state, `None` before the first transition.
    pub fn current(&self) -> Option<DeviceState> {
        self.current
    }

    /// Whether `ERROR` was entered since start.
    pub fn error_latched(&self) -> bool {
        self.error_latched
    }

    /// Whether a client may move the indicator to `target`.
    ///
    /// `ERROR` can only be left by restarting the runner.
    pub fn accepts(&self, target: DeviceState) -> bool {
        !self.error_latched || target == DeviceState::Error
    }

    fn enter(&mut self, target: DeviceState) -> Option<SerialChannel> {
        self.current = Some(target);
        self.error_latched |= target == DeviceState::Error;
        self.serial.clone()
    }
}

#[derive(Debug, Default)]
struct SupervisorState {
    fault: Option<Fault>,
    machine: DeviceStateMachine,
}

/// Shared fault record and device state.
#[derive(Debug, Default)]
pub struct Supervisor {
    inner: Mutex<SupervisorState>,
}

impl Supervisor {
    /// Supervisor without a controller; transitions are only recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supervisor mirroring state through `serial`.
    pub fn with_serial(serial: SerialChannel) -> Self {
        let supervisor = Self::new();
        supervisor.attach_serial(serial);
        supervisor
    }

    /// Attach the controller once hardware bring-up succeeded.
    pub fn attach_serial(&self, serial: SerialChannel) {
        self.inner.lock().machine.serial = Some(serial);
    }

    /// Controller link, if attached.
    pub fn serial(&self) -> Option<SerialChannel> {
        self.inner.lock().machine.serial.clone()
    }

    /// Recorded fault, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.inner.lock().fault.clone()
    }

    /// Classification of the recorded fault, `None` without one.
    pub fn error_code(&self) -> ErrorCode {
        self.inner
            .lock()
            .fault
            .as_ref()
            .map_or(ErrorCode::None, |f| f.code)
    }

    /// Whether command processing is gated.
    pub fn has_fault(&self) -> bool {
        self.inner.lock().fault.is_some()
    }

    /// Current indicator state.
    pub fn device_state(&self) -> Option<DeviceState> {
        self.inner.lock().machine.current()
    }

    /// Record a fault. The first fault wins; later ones are only logged.
    ///
    /// Returns whether the fault was recorded.
    pub fn record(&self, fault: Fault) -> bool {
        let mut inner = self.inner.lock();
        match &inner.fault {
            Some(existing) => {
                warn!(
                    "Fault {} ignored, {} already recorded",
                    fault.code, existing.code
                );
                false
            }
            None => {
                inner.fault = Some(fault);
                true
            }
        }
    }

    /// Log `err`, record it and mirror `ERROR` when its class requires it.
    pub async fn report(&self, err: &RunnerError) {
        error!("{} fault: {:?}", err.error_code(), err);
        let fault = Fault::from(err);
        let code = fault.code;
        self.record(fault);

        if code.forces_error_state() {
            if let Err(e) = self.apply(DeviceState::Error).await {
                error!("Cannot mirror ERROR state: {}", e);
            }
        }
    }

    /// Client-requested transition.
    ///
    /// Leaving `ERROR` is refused without touching the hardware. A failing
    /// indicator write is returned to the caller.
    pub async fn request_state(&self, target: DeviceState) -> Result<(), SerialError> {
        {
            let inner = self.inner.lock();
            if !inner.machine.accepts(target) {
                warn!("Refusing transition ERROR -> {}: ERROR is kept until restart", target);
                return Ok(());
            }
        }
        self.apply(target).await
    }

    /// Connection-accept path.
    ///
    /// Without a fault the indicator goes `READY`. A recorded fault (or an
    /// earlier explicit `ERROR`) is re-mirrored as `ERROR`, except for serial
    /// faults, where the link itself is unusable.
    pub async fn on_accept(&self) {
        let (code, latched) = {
            let inner = self.inner.lock();
            let code = inner.fault.as_ref().map_or(ErrorCode::None, |f| f.code);
            (code, inner.machine.error_latched())
        };

        let target = match code {
            ErrorCode::SerialError => return,
            ErrorCode::None if !latched => DeviceState::Ready,
            _ => DeviceState::Error,
        };

        if let Err(e) = self.apply(target).await {
            self.report(&RunnerError::from(e)).await;
        }
    }

    /// Connection-teardown path: indicator `OFF`, from any state.
    ///
    /// Skipped when the recorded fault is a serial fault.
    pub async fn power_off(&self) {
        if self.error_code() == ErrorCode::SerialError {
            warn!("Serial fault recorded, leaving indicator untouched");
            return;
        }
        if let Err(e) = self.apply(DeviceState::Off).await {
            self.report(&RunnerError::from(e)).await;
        }
    }

    async fn apply(&self, target: DeviceState) -> Result<(), SerialError> {
        let serial = self.inner.lock().machine.enter(target);
        let Some(serial) = serial else {
            info!("Device state {} (no controller attached)", target);
            return Ok(());
        };

        serial.set_device_state(target).await?;

        // An ERROR recorded while the write was in flight must win on the hardware too
        let errored_meanwhile =
            target != DeviceState::Error && self.device_state() == Some(DeviceState::Error);
        if errored_meanwhile {
            serial.set_device_state(DeviceState::Error).await?;
        }
        Ok(())
    }
}
