//! Typed command channel to the LED/indicator controller.
//!
//! Wraps a discovered [`SerialTransport`] and adds the controller's line
//! protocol on top of it: commands are terminated with `\r\n`, answers are a
//! single `\n`-terminated line. Transport failures are retried locally (the
//! relevant OS buffer is cleared before each new attempt); only exhaustion
//! reaches the caller, as [`SerialError::Disconnected`].
//!
//! Blocking transport I/O runs on tokio's blocking pool. The link sits behind a
//! `tokio::sync::Mutex` so that a query's write and read are never interleaved
//! with another caller's traffic.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapters::serial_adapter::{ClearBuffer, SerialTransport};
use crate::error::SerialError;
use crate::error_recovery::RetryPolicy;
use crate::state::DeviceState;

const LINE_TERMINATOR: &str = "\r\n";

/// Shared handle to the controller link.
#[derive(Clone)]
pub struct SerialChannel {
    link: Arc<Mutex<Box<dyn SerialTransport>>>,
    name: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish()
    }
}

impl SerialChannel {
    /// Wrap an already identified link.
    pub fn new(link: Box<dyn SerialTransport>, retry: RetryPolicy) -> Self {
        let name = link.name().to_string();
        Self {
            link: Arc::new(Mutex::new(link)),
            name,
            retry,
        }
    }

    /// Port name of the underlying link.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring-up sequence: apply the LED PWM and make sure the excitation LED is off.
    pub async fn initialize(&self, led_pwm: u32) -> Result<(), SerialError> {
        self.set_led_pwm(led_pwm).await?;
        self.set_excitation_led(false).await?;
        info!("Serial controller on {} initialized (LED PWM {})", self.name, led_pwm);
        Ok(())
    }

    /// Send one command line.
    pub async fn write(&self, command: &str) -> Result<(), SerialError> {
        let command = command.to_string();
        self.with_link(move |link, retry| write_line(link, &command, retry))
            .await
    }

    /// Read one response line, terminator and surrounding whitespace removed.
    pub async fn read(&self) -> Result<String, SerialError> {
        self.with_link(read_line).await
    }

    /// Send `command` and read its response while holding the link.
    pub async fn query(&self, command: &str) -> Result<String, SerialError> {
        let command = command.to_string();
        self.with_link(move |link, retry| {
            write_line(link, &command, retry)?;
            read_line(link, retry)
        })
        .await
    }

    /// `P <n>`
    pub async fn set_led_pwm(&self, value: u32) -> Result<(), SerialError> {
        self.write(&format!("P {}", value)).await?;
        debug!("Set LED PWM {}", value);
        Ok(())
    }

    /// `p`
    pub async fn led_pwm(&self) -> Result<u32, SerialError> {
        let response = self.query("p").await?;
        parse_response("p", &response)
    }

    /// `E <0|1>`
    pub async fn set_excitation_led(&self, on: bool) -> Result<(), SerialError> {
        self.write(&format!("E {}", u8::from(on))).await?;
        debug!("Set excitation LED {}", if on { "on" } else { "off" });
        Ok(())
    }

    /// `e`
    pub async fn excitation_led(&self) -> Result<bool, SerialError> {
        let response = self.query("e").await?;
        let value: u8 = parse_response("e", &response)?;
        Ok(value != 0)
    }

    /// `I <n>`
    pub async fn set_device_state(&self, state: DeviceState) -> Result<(), SerialError> {
        self.write(&format!("I {}", state.as_u8())).await?;
        info!("Set device state {}", state);
        Ok(())
    }

    /// `i`
    pub async fn device_state(&self) -> Result<DeviceState, SerialError> {
        let response = self.query("i").await?;
        let value: u8 = parse_response("i", &response)?;
        DeviceState::try_from(value).map_err(|_| SerialError::InvalidResponse {
            command: "i".to_string(),
            response,
        })
    }

    /// `m`, answered with `"<x> <y>"`.
    pub async fn reference_position(&self) -> Result<(i32, i32), SerialError> {
        let response = self.query("m").await?;
        let invalid = || SerialError::InvalidResponse {
            command: "m".to_string(),
            response: response.clone(),
        };

        let mut parts = response.split_whitespace();
        let x = parts.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
        let y = parts.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        debug!("Reference position ({}, {})", x, y);
        Ok((x, y))
    }

    async fn with_link<T, F>(&self, op: F) -> Result<T, SerialError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialTransport, &RetryPolicy) -> Result<T, SerialError> + Send + 'static,
    {
        let link = self.link.clone();
        let retry = self.retry.clone();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || {
            let mut guard = link.blocking_lock();
            op(guard.as_mut(), &retry)
        })
        .await
        .unwrap_or_else(|e| {
            error!("Serial I/O task failed: {}", e);
            Err(SerialError::Disconnected)
        })
    }
}

fn write_line(
    link: &mut dyn SerialTransport,
    command: &str,
    retry: &RetryPolicy,
) -> Result<(), SerialError> {
    let bytes = format!("{}{}", command, LINE_TERMINATOR).into_bytes();
    retry
        .run_blocking(
            |attempt| {
                if attempt > 1 {
                    link.clear(ClearBuffer::Output)?;
                }
                link.write_all(&bytes)
            },
            |attempt, e| warn!("Serial write '{}' failed (attempt {}): {}", command, attempt, e),
        )
        .map_err(|e| {
            error!("Serial write '{}' failed: {}", command, e);
            SerialError::Disconnected
        })
}

fn read_line(link: &mut dyn SerialTransport, retry: &RetryPolicy) -> Result<String, SerialError> {
    retry
        .run_blocking(
            |attempt| {
                if attempt > 1 {
                    link.clear(ClearBuffer::Input)?;
                }
                link.read_line()
            },
            |attempt, e| warn!("Serial read failed (attempt {}): {}", attempt, e),
        )
        .map(|line| line.trim().to_string())
        .map_err(|e| {
            error!("Serial read failed: {}", e);
            SerialError::Disconnected
        })
}

fn parse_response<T: std::str::FromStr>(command: &str, response: &str) -> Result<T, SerialError> {
    response
        .trim()
        .parse()
        .map_err(|_| SerialError::InvalidResponse {
            command: command.to_string(),
            response: response.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedController;

    fn channel(controller: &SimulatedController, retries: u32) -> SerialChannel {
        SerialChannel::new(
            Box::new(controller.clone()),
            RetryPolicy::with_retries(retries),
        )
    }

    #[tokio::test]
    async fn test_device_commands() {
        let controller = SimulatedController::with_reference("HelloPCR00001", 1000, 600);
        let channel = channel(&controller, 3);

        channel.set_led_pwm(250).await.unwrap();
        assert_eq!(channel.led_pwm().await.unwrap(), 250);

        channel.set_excitation_led(true).await.unwrap();
        assert!(channel.excitation_led().await.unwrap());
        channel.set_excitation_led(false).await.unwrap();
        assert!(!channel.excitation_led().await.unwrap());

        channel.set_device_state(DeviceState::Running).await.unwrap();
        assert_eq!(channel.device_state().await.unwrap(), DeviceState::Running);

        assert_eq!(channel.reference_position().await.unwrap(), (1000, 600));

        assert_eq!(
            controller.commands(),
            vec!["P 250", "p", "E 1", "e", "E 0", "e", "I 2", "i", "m"]
        );
    }

    #[tokio::test]
    async fn test_initialize_sets_pwm_and_turns_led_off() {
        let controller = SimulatedController::new("HelloPCR00001");
        let channel = channel(&controller, 3);

        channel.initialize(250).await.unwrap();
        assert_eq!(controller.led_pwm(), 250);
        assert!(!controller.excitation_led());
        assert_eq!(controller.commands(), vec!["P 250", "E 0"]);
    }

    #[tokio::test]
    async fn test_continuous_write_failure_exhausts_retries() {
        let controller = SimulatedController::new("HelloPCR00001");
        controller.fail_writes(u32::MAX);
        let channel = channel(&controller, 3);

        let result = channel.set_excitation_led(true).await;
        assert_eq!(result, Err(SerialError::Disconnected));
        assert_eq!(controller.write_attempts(), 4);
        assert!(controller.commands().is_empty());
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let controller = SimulatedController::new("HelloPCR00001");
        controller.fail_writes(2);
        let channel = channel(&controller, 3);

        channel.set_excitation_led(true).await.unwrap();
        assert_eq!(controller.write_attempts(), 3);
        assert!(controller.excitation_led());
    }

    #[tokio::test]
    async fn test_continuous_read_failure_exhausts_retries() {
        let controller = SimulatedController::new("HelloPCR00001");
        let channel = channel(&controller, 2);
        controller.fail_reads(u32::MAX);

        assert_eq!(channel.led_pwm().await, Err(SerialError::Disconnected));
        assert_eq!(controller.read_attempts(), 3);
    }

    #[tokio::test]
    async fn test_unparseable_reference_is_invalid_response() {
        let controller = SimulatedController::new("HelloPCR00001");
        controller.override_response("m", "12 abc");
        let channel = channel(&controller, 3);

        let result = channel.reference_position().await;
        assert!(matches!(
            result,
            Err(SerialError::InvalidResponse { ref command, .. }) if command == "m"
        ));
    }

    #[tokio::test]
    async fn test_unknown_device_state_is_invalid_response() {
        let controller = SimulatedController::new("HelloPCR00001");
        controller.override_response("i", "7");
        let channel = channel(&controller, 3);

        assert!(matches!(
            channel.device_state().await,
            Err(SerialError::InvalidResponse { .. })
        ));
    }
}
