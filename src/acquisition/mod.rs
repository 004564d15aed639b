//! Fluorescence acquisition.
//!
//! A `SHOT` hands a [`ShotRequest`] to an [`Acquisition`] implementation and
//! returns immediately; the client then polls `STATUS` until an intensity is
//! available. Two implementations exist:
//!
//! - [`shot::ShotPipeline`] drives the real LED/camera sequence.
//! - [`emulator::RfuEmulator`] replays a fixed amplification curve.

use async_trait::async_trait;
use std::fmt;

use crate::error::ShotError;

pub mod emulator;
pub mod roi;
pub mod shot;

pub use emulator::RfuEmulator;
pub use roi::{Mask, Roi};
pub use shot::{ShotPipeline, ShotSettings};

/// Fluorescence filter selected by a `SHOT` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fluorescence {
    /// Filter index 0
    Fam,
    /// Filter index 1
    Hex,
    /// Filter index 2
    Rox,
    /// Filter index 3
    Cy5,
}

impl Fluorescence {
    /// Filter for a wire index.
    ///
    /// # Errors
    /// Returns `InvalidFilter` for indices outside `0..4`.
    pub fn from_index(index: u8) -> Result<Self, ShotError> {
        match index {
            0 => Ok(Fluorescence::Fam),
            1 => Ok(Fluorescence::Hex),
            2 => Ok(Fluorescence::Rox),
            3 => Ok(Fluorescence::Cy5),
            other => Err(ShotError::InvalidFilter(other)),
        }
    }

    /// Wire index.
    pub fn index(self) -> u8 {
        match self {
            Fluorescence::Fam => 0,
            Fluorescence::Hex => 1,
            Fluorescence::Rox => 2,
            Fluorescence::Cy5 => 3,
        }
    }

    /// Label used in file names.
    pub fn label(self) -> &'static str {
        match self {
            Fluorescence::Fam => "FAM",
            Fluorescence::Hex => "HEX",
            Fluorescence::Rox => "ROX",
            Fluorescence::Cy5 => "CY5",
        }
    }

    /// BGR channel carrying this dye's emission.
    pub fn channel(self) -> usize {
        match self {
            Fluorescence::Fam | Fluorescence::Hex => 1,
            Fluorescence::Rox | Fluorescence::Cy5 => 2,
        }
    }
}

impl fmt::Display for Fluorescence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One requested acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotRequest {
    /// Filter to read
    pub fluorescence: Fluorescence,
    /// PCR cycle number
    pub cycle: u8,
    /// Experiment label, used as the record directory name
    pub experiment_date: String,
}

impl ShotRequest {
    /// Build a request from raw wire fields.
    pub fn from_wire(filter_index: u8, cycle: u8, experiment_date: &str) -> Result<Self, ShotError> {
        Ok(Self {
            fluorescence: Fluorescence::from_index(filter_index)?,
            cycle,
            experiment_date: experiment_date.to_string(),
        })
    }
}

/// Something that turns shot requests into intensity readings.
#[async_trait]
pub trait Acquisition: Send + Sync {
    /// Queue `request`. Clears the published intensity until it completes.
    ///
    /// A request arriving while another one runs waits for it; at most one
    /// request waits at a time and a newer one replaces it.
    fn trigger(&self, request: ShotRequest) -> Result<(), ShotError>;

    /// Latest intensity, `None` while a request is pending or running.
    ///
    /// A recorded acquisition fault is returned first and stays in place.
    fn intensity(&self) -> Result<Option<i32>, ShotError>;

    /// Drop a request that has not started yet. Returns whether one was dropped.
    fn cancel_pending(&self) -> bool;

    /// Stop the worker and release the hardware it owns.
    async fn close(&self);
}
