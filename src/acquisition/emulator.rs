//! Amplification-curve emulator used with `--emulate`.
//!
//! Each shot completes after a fixed delay with a value read off a canned
//! sigmoid RFU curve. Dyes are offset along the curve so that the four
//! channels of one cycle report different values.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Acquisition, Fluorescence, ShotRequest};
use crate::error::ShotError;

/// Canned RFU curve, one entry per cycle step.
pub const RFU_TABLE: [i32; 80] = [
    2, 3, 3, 4, 5, 6, 8, 9, 11, 13, //
    16, 20, 24, 28, 34, 41, 49, 59, 71, 85, //
    101, 121, 144, 172, 205, 243, 289, 341, 403, 474, //
    556, 649, 754, 872, 1003, 1146, 1301, 1466, 1639, 1818, //
    2000, 2181, 2360, 2533, 2698, 2853, 2996, 3127, 3245, 3350, //
    3443, 3525, 3596, 3658, 3710, 3756, 3794, 3827, 3855, 3878, //
    3898, 3914, 3928, 3940, 3950, 3958, 3965, 3971, 3975, 3979, //
    3983, 3986, 3988, 3990, 3991, 3993, 3994, 3995, 3996, 3996,
];

/// Curve value reported for `fluorescence` at `cycle`.
pub fn rfu_value(fluorescence: Fluorescence, cycle: u8) -> i32 {
    let column: f64 = match fluorescence {
        Fluorescence::Fam => 3.0,
        Fluorescence::Hex => 0.0,
        Fluorescence::Rox => 2.0,
        Fluorescence::Cy5 => 1.0,
    };
    let index = ((1.0 + column * 0.33) * f64::from(cycle)) as usize;
    RFU_TABLE
        .get(index)
        .copied()
        .unwrap_or(RFU_TABLE[RFU_TABLE.len() - 1])
}

#[derive(Default)]
struct EmulatorState {
    intensity: Option<i32>,
    generation: u64,
    running: Option<JoinHandle<()>>,
}

/// [`Acquisition`] backed by [`RFU_TABLE`].
///
/// A new trigger supersedes a shot that has not completed yet.
pub struct RfuEmulator {
    delay: Duration,
    state: Arc<Mutex<EmulatorState>>,
}

impl RfuEmulator {
    /// Emulator completing every shot after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(EmulatorState::default())),
        }
    }
}

#[async_trait]
impl Acquisition for RfuEmulator {
    fn trigger(&self, request: ShotRequest) -> Result<(), ShotError> {
        let delay = self.delay;
        let shared = self.state.clone();
        let value = rfu_value(request.fluorescence, request.cycle);

        let mut state = self.state.lock();
        state.intensity = None;
        state.generation += 1;
        let generation = state.generation;
        if let Some(previous) = state.running.take() {
            previous.abort();
        }
        state.running = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = shared.lock();
            if state.generation == generation {
                state.intensity = Some(value);
                state.running = None;
                debug!("Emulated shot done: {}", value);
            }
        }));
        info!(
            "Emulated shot {} cycle {} ({})",
            request.fluorescence, request.cycle, request.experiment_date
        );
        Ok(())
    }

    fn intensity(&self) -> Result<Option<i32>, ShotError> {
        Ok(self.state.lock().intensity)
    }

    fn cancel_pending(&self) -> bool {
        let mut state = self.state.lock();
        state.generation += 1;
        match state.running.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn close(&self) {
        self.cancel_pending();
    }
}
