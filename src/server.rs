//! Hardware bring-up and the TCP accept loop.
//!
//! The runner is built once per process. A bring-up failure (controller or
//! camera missing, unusable mask) is recorded as the startup fault instead of
//! aborting: the server still accepts clients and reports the fault through
//! `STATUS`. Clients are served one at a time; a disconnect keeps the hardware
//! for the next client and only `EXIT` ends the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::acquisition::{Acquisition, Mask, RfuEmulator, ShotPipeline, ShotSettings};
use crate::adapters::serial_adapter;
use crate::config::RunnerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{RunnerError, RunnerResult};
use crate::hardware::mock::SimulatedController;
use crate::instrument::camera::{CameraProvider, CameraWorker, FrameSource};
use crate::instrument::serial_channel::SerialChannel;
use crate::state::Supervisor;

/// Where the hardware comes from.
pub enum Hardware {
    /// Simulated controller plus the RFU curve emulator
    Emulated,
    /// Discovered controller plus the camera located by the provider
    Physical(CameraProvider),
}

/// A brought-up instrument and its command server.
pub struct Runner {
    config: RunnerConfig,
    instrument_id: String,
    supervisor: Arc<Supervisor>,
    acquisition: Option<Arc<dyn Acquisition>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Runner {
    /// Bring up the hardware for `instrument_id`.
    ///
    /// Never fails: bring-up errors become the recorded startup fault.
    pub async fn start(config: RunnerConfig, instrument_id: &str, hardware: Hardware) -> Self {
        let supervisor = Arc::new(Supervisor::new());

        let result = match hardware {
            Hardware::Emulated => bring_up_emulated(&config, instrument_id, &supervisor).await,
            Hardware::Physical(provider) => {
                bring_up_physical(&config, instrument_id, provider, &supervisor).await
            }
        };

        let acquisition = match result {
            Ok(acquisition) => {
                info!("Instrument {} ready", instrument_id);
                Some(acquisition)
            }
            Err(e) => {
                error!("Hardware bring-up failed: {}", e);
                supervisor.report(&e).await;
                None
            }
        };

        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            instrument_id: instrument_id.to_string(),
            supervisor,
            acquisition,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Instrument id this runner serves.
    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    /// Shared fault record and device state.
    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener =
            TcpListener::bind((self.config.server.host.as_str(), self.config.server.port)).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Stop the accept loop after the current connection.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Accept clients until `EXIT` (or [`Runner::request_shutdown`]).
    pub async fn serve(&self, listener: TcpListener) -> RunnerResult<()> {
        let dispatcher = Dispatcher::new(
            self.supervisor.clone(),
            self.acquisition.clone(),
            self.shutdown.clone(),
        );
        let mut shutdown = self.shutdown.subscribe();

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer): (_, SocketAddr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    info!("Client connected from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Cannot disable Nagle on {}: {}", peer, e);
                    }
                    if let Err(e) = dispatcher.serve(stream).await {
                        info!("Disconnected {}", e);
                    }
                }
                _ = shutdown.changed() => {}
            }
        }

        info!("Terminate Server...");
        Ok(())
    }

    /// Power the indicator off and release the hardware.
    ///
    /// Also covers a connection cut short by an interrupt, whose own
    /// teardown never ran.
    pub async fn close(&self) {
        self.supervisor.power_off().await;
        if let Some(acquisition) = &self.acquisition {
            acquisition.close().await;
        }
        info!("Runner closed");
    }
}

async fn bring_up_emulated(
    config: &RunnerConfig,
    instrument_id: &str,
    supervisor: &Supervisor,
) -> RunnerResult<Arc<dyn Acquisition>> {
    info!("Emulator mode");
    let controller = SimulatedController::emulated(
        instrument_id,
        config.emulator.reference_x,
        config.emulator.reference_y,
    );
    let serial = SerialChannel::new(Box::new(controller), config.serial.retry_policy());
    serial.initialize(config.serial.led_pwm).await?;
    supervisor.attach_serial(serial);

    Ok(Arc::new(RfuEmulator::new(config.emulator.shot_delay())))
}

async fn bring_up_physical(
    config: &RunnerConfig,
    instrument_id: &str,
    provider: CameraProvider,
    supervisor: &Arc<Supervisor>,
) -> RunnerResult<Arc<dyn Acquisition>> {
    let target = instrument_id.to_string();
    let serial_config = config.serial.clone();
    let link = tokio::task::spawn_blocking(move || serial_adapter::discover(&target, &serial_config))
        .await
        .map_err(|e| RunnerError::Unknown(format!("serial discovery task failed: {}", e)))??;

    let serial = SerialChannel::new(link, config.serial.retry_policy());
    serial.initialize(config.serial.led_pwm).await?;
    supervisor.attach_serial(serial.clone());

    let mask = Mask::load(&config.mask.path)?;

    let device = provider(instrument_id)?;
    let camera = Arc::new(CameraWorker::new(device));
    camera.start()?;

    let pipeline = ShotPipeline::new(
        camera.clone(),
        serial,
        mask,
        config.roi,
        ShotSettings::from_config(config, instrument_id),
        supervisor.clone(),
    )
    .await;

    match pipeline {
        Ok(pipeline) => Ok(Arc::new(pipeline)),
        Err(e) => {
            camera.stop();
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::instrument::camera::no_camera_driver;

    fn test_config() -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.server.port = 1;
        config.emulator.shot_delay_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_emulated_bring_up() {
        let runner = Runner::start(test_config(), "HelloPCR00001", Hardware::Emulated).await;
        assert!(!runner.supervisor().has_fault());
        assert!(runner.supervisor().serial().is_some());
        assert_eq!(runner.instrument_id(), "HelloPCR00001");
        runner.close().await;
    }

    #[tokio::test]
    async fn test_missing_hardware_becomes_startup_fault() {
        let runner = Runner::start(
            test_config(),
            "HelloPCR00001",
            Hardware::Physical(Box::new(no_camera_driver)),
        )
        .await;

        // No controller is attached in the test environment
        assert_eq!(runner.supervisor().error_code(), ErrorCode::SerialError);
        assert!(runner.supervisor().serial().is_none());
        runner.close().await;
    }

    #[tokio::test]
    async fn test_close_powers_off_after_interrupted_connection() {
        use crate::client::RunnerClient;
        use crate::protocol::Command;
        use crate::state::DeviceState;

        let runner = Arc::new(Runner::start(test_config(), "HelloPCR00001", Hardware::Emulated).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = runner.clone();
        let serving = tokio::spawn(async move { server.serve(listener).await });

        let mut client = RunnerClient::connect(addr).await.unwrap();
        client.set_state(Command::Run).await.unwrap();
        client.status().await.unwrap();
        assert_eq!(runner.supervisor().device_state(), Some(DeviceState::Running));

        // Same as ctrl-c winning the select in main
        serving.abort();
        let _ = serving.await;
        runner.close().await;
        assert_eq!(runner.supervisor().device_state(), Some(DeviceState::Off));
    }

    #[tokio::test]
    async fn test_request_shutdown_ends_serve() {
        let runner = Runner::start(test_config(), "HelloPCR00001", Hardware::Emulated).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        runner.request_shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), runner.serve(listener))
            .await
            .unwrap()
            .unwrap();
    }
}
