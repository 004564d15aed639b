//! Hardware adapter implementations
//!
//! Low-level I/O below the typed instrument layer. The controller link is the
//! only adapter this instrument needs.

pub mod serial_adapter;

pub use serial_adapter::{ClearBuffer, SerialTransport};
