//! Acquisition and control runner for a benchtop fluorescence-reading PCR instrument.
//!
//! A client connects over TCP and drives the instrument with fixed-size binary
//! frames ([`protocol`]). The runner toggles the excitation LED and status
//! indicator through a USB serial controller, grabs camera frames, and reports
//! a masked mean intensity per fluorescence channel and cycle.
//!
//! # Layout
//!
//! - [`adapters`] - byte-level serial link and controller discovery
//! - [`instrument`] - typed controller commands and the camera frame source
//! - [`acquisition`] - the LED/camera shot sequence and the RFU emulator
//! - [`state`] - device state machine and the process-wide fault record
//! - [`dispatcher`] / [`server`] - request routing and the accept loop
//! - [`hardware`] - simulated controller and camera for emulation and tests

pub mod acquisition;
pub mod adapters;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod state;

pub use error::{ErrorCode, RunnerError, RunnerResult};
