//! Per-connection command handling.
//!
//! The dispatcher reads fixed 128-byte request frames until the peer closes
//! the connection or `EXIT` arrives. Once a fault is recorded every command
//! except `EXIT` is skipped; `STATUS` is still answered so the client can see
//! the fault. Only `STATUS` produces a response frame.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::acquisition::{Acquisition, ShotRequest};
use crate::error::{ErrorCode, RunnerError, RunnerResult};
use crate::protocol::{Command, Request, Response, NO_INTENSITY, REQUEST_LEN};
use crate::state::{DeviceState, Supervisor};

/// Routes decoded requests to the state machine and the acquisition.
#[derive(Clone)]
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    acquisition: Option<Arc<dyn Acquisition>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Dispatcher {
    /// Dispatcher signalling `EXIT` through `shutdown`.
    ///
    /// `acquisition` is `None` when hardware bring-up failed; the supervisor
    /// then already holds the startup fault.
    pub fn new(
        supervisor: Arc<Supervisor>,
        acquisition: Option<Arc<dyn Acquisition>>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            supervisor,
            acquisition,
            shutdown,
        }
    }

    /// Serve one client connection to completion.
    ///
    /// Runs the accept path before the first frame and the teardown path after
    /// the last one, whatever ended the connection.
    pub async fn serve<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.supervisor.on_accept().await;
        let result = self.command_loop(&mut stream).await;
        info!("Server command handling loop done.");
        self.supervisor.power_off().await;
        result
    }

    async fn command_loop<S>(&self, stream: &mut S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frame = [0u8; REQUEST_LEN];
        while !*self.shutdown.borrow() {
            if let Err(e) = stream.read_exact(&mut frame).await {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    info!("Client closed the connection");
                    return Ok(());
                }
                return Err(e);
            }

            let request = Request::decode(&frame);
            if let Some(response) = self.handle(&request).await {
                stream.write_all(&response.encode()).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    /// Process one request. Returns the response to send, if any.
    pub async fn handle(&self, request: &Request) -> Option<Response> {
        let command = request.command();
        debug!(
            "Request opcode 0x{:02X} filter {} cycle {} date '{}'",
            request.opcode, request.filter_index, request.cycle, request.experiment_date
        );

        if command == Ok(Command::Exit) {
            info!("server recv exit command");
            self.shutdown.send_replace(true);
            return None;
        }

        let mut intensity = NO_INTENSITY;
        if !self.supervisor.has_fault() {
            match self.execute(request).await {
                Ok(Some(value)) => intensity = value,
                Ok(None) => {}
                Err(e) => self.supervisor.report(&e).await,
            }
        }

        if command != Ok(Command::Status) {
            return None;
        }
        let fault = self.supervisor.fault();
        Some(Response {
            error_code: fault.as_ref().map_or(ErrorCode::None, |f| f.code),
            intensity,
            message: fault.map(|f| f.message).unwrap_or_default(),
        })
    }

    async fn execute(&self, request: &Request) -> RunnerResult<Option<i32>> {
        let command = request.command().map_err(RunnerError::CommandNotDefined)?;
        match command {
            Command::Status => {
                if let Some(serial) = self.supervisor.serial() {
                    serial.excitation_led().await?;
                }
                let intensity = self.acquisition()?.intensity()?;
                Ok(Some(intensity.unwrap_or(NO_INTENSITY)))
            }
            Command::Shot => {
                let shot = ShotRequest::from_wire(
                    request.filter_index,
                    request.cycle,
                    &request.experiment_date,
                )?;
                self.acquisition()?.trigger(shot)?;
                Ok(None)
            }
            Command::Off => self.transition(DeviceState::Off).await,
            Command::Ready => self.transition(DeviceState::Ready).await,
            Command::Run => self.transition(DeviceState::Running).await,
            Command::Error => self.transition(DeviceState::Error).await,
            Command::Exit => Ok(None),
        }
    }

    async fn transition(&self, target: DeviceState) -> RunnerResult<Option<i32>> {
        self.supervisor.request_state(target).await?;
        Ok(None)
    }

    fn acquisition(&self) -> RunnerResult<&Arc<dyn Acquisition>> {
        self.acquisition
            .as_ref()
            .ok_or_else(|| RunnerError::Unknown("acquisition not initialized".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::RfuEmulator;
    use crate::error_recovery::RetryPolicy;
    use crate::hardware::mock::SimulatedController;
    use crate::instrument::serial_channel::SerialChannel;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Harness {
        dispatcher: Dispatcher,
        controller: SimulatedController,
        supervisor: Arc<Supervisor>,
        shutdown: watch::Receiver<bool>,
    }

    fn harness() -> Harness {
        let controller = SimulatedController::new("HelloPCR00001");
        let serial = SerialChannel::new(Box::new(controller.clone()), RetryPolicy::with_retries(1));
        let supervisor = Arc::new(Supervisor::with_serial(serial));
        let acquisition: Arc<dyn Acquisition> = Arc::new(RfuEmulator::new(Duration::from_millis(20)));
        let (tx, rx) = watch::channel(false);
        Harness {
            dispatcher: Dispatcher::new(supervisor.clone(), Some(acquisition), Arc::new(tx)),
            controller,
            supervisor,
            shutdown: rx,
        }
    }

    #[tokio::test]
    async fn test_status_before_shot() {
        let h = harness();
        let response = h.dispatcher.handle(&Request::new(Command::Status)).await.unwrap();
        assert_eq!(response.error_code, ErrorCode::None);
        assert_eq!(response.intensity, NO_INTENSITY);
        assert!(response.message.is_empty());
    }

    #[tokio::test]
    async fn test_only_status_is_answered() {
        let h = harness();
        assert!(h.dispatcher.handle(&Request::new(Command::Run)).await.is_none());
        assert!(h.dispatcher.handle(&Request::shot(1, 10, "20240101")).await.is_none());
        assert_eq!(h.controller.device_state(), DeviceState::Running.as_u8());
    }

    #[tokio::test]
    async fn test_unknown_opcode_is_server_error() {
        let h = harness();
        let mut request = Request::new(Command::Status);
        request.opcode = 0x09;
        assert!(h.dispatcher.handle(&request).await.is_none());

        let response = h.dispatcher.handle(&Request::new(Command::Status)).await.unwrap();
        assert_eq!(response.error_code, ErrorCode::ServerError);
        assert_eq!(response.intensity, NO_INTENSITY);
        assert!(response.message.contains("Command not defined"));
        assert_eq!(h.supervisor.device_state(), Some(DeviceState::Error));
    }

    #[tokio::test]
    async fn test_invalid_filter_is_shot_worker_error() {
        let h = harness();
        h.dispatcher.handle(&Request::shot(7, 1, "20240101")).await;
        assert_eq!(h.supervisor.error_code(), ErrorCode::ShotWorkerError);
    }

    #[tokio::test]
    async fn test_fault_gates_commands() {
        let h = harness();
        h.supervisor
            .report(&RunnerError::CommandNotDefined(0x42))
            .await;
        h.controller.clear_commands();

        h.dispatcher.handle(&Request::new(Command::Ready)).await;
        h.dispatcher.handle(&Request::shot(0, 1, "20240101")).await;
        let response = h.dispatcher.handle(&Request::new(Command::Status)).await.unwrap();

        assert!(h.controller.commands().is_empty());
        assert_eq!(response.intensity, NO_INTENSITY);
        assert_eq!(response.error_code, ErrorCode::ServerError);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_exit_passes_the_gate() {
        let h = harness();
        h.supervisor
            .report(&RunnerError::CommandNotDefined(0x42))
            .await;
        assert!(h.dispatcher.handle(&Request::new(Command::Exit)).await.is_none());
        assert!(*h.shutdown.borrow());
        assert!(logs_contain("server recv exit command"));
    }

    #[tokio::test]
    async fn test_serve_over_stream() {
        let h = harness();
        let (mut client, server) = tokio::io::duplex(1024);
        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.serve(server).await });

        client.write_all(&Request::shot(1, 10, "20240101").encode()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.write_all(&Request::new(Command::Status).encode()).await.unwrap();

        let mut frame = [0u8; crate::protocol::RESPONSE_LEN];
        client.read_exact(&mut frame).await.unwrap();
        let response = Response::decode(&frame);
        assert_eq!(response.error_code, ErrorCode::None);
        assert_eq!(response.intensity, 16);

        drop(client);
        task.await.unwrap().unwrap();
        // Accept forces READY, teardown powers off
        assert_eq!(h.controller.commands().first().map(String::as_str), Some("I 1"));
        assert_eq!(h.controller.commands().last().map(String::as_str), Some("I 0"));
    }

    #[tokio::test]
    async fn test_scripted_session() {
        let h = harness();
        let idle = Response {
            error_code: ErrorCode::None,
            intensity: NO_INTENSITY,
            message: String::new(),
        };
        let stream = tokio_test::io::Builder::new()
            .read(&Request::new(Command::Run).encode())
            .read(&Request::new(Command::Status).encode())
            .write(&idle.encode())
            .build();

        h.dispatcher.serve(stream).await.unwrap();
        assert_eq!(h.controller.commands(), vec!["I 1", "I 2", "e", "I 0"]);
    }

    #[tokio::test]
    async fn test_exit_ends_serve() {
        let h = harness();
        let (mut client, server) = tokio::io::duplex(1024);
        let dispatcher = h.dispatcher.clone();
        let task = tokio::spawn(async move { dispatcher.serve(server).await });

        client.write_all(&Request::new(Command::Exit).encode()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(*h.shutdown.borrow());
    }
}
