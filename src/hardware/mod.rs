//! Simulated hardware.

pub mod mock;
