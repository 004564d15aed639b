//! LED/camera shot sequence.
//!
//! A single worker task owns the sequence. Triggers land in a one-deep
//! pending slot; the worker takes the request when it starts, so a trigger
//! that arrives mid-sequence is run right after the current one and sequences
//! never overlap.
//!
//! Sequence per request:
//!
//! 1. focus the camera (transient driver failures retried)
//! 2. excitation LED on
//! 3. wait for the exposure to settle
//! 4. grab the latest frame
//! 5. crop to the ROI
//! 6. mean of the dye's channel over the mask, times 256
//! 7. excitation LED off
//! 8. publish the intensity
//! 9. save the crop as PNG under the experiment's record directory

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::roi::{compute_intensity, Mask, Roi};
use super::{Acquisition, ShotRequest};
use crate::config::{RoiConfig, RunnerConfig};
use crate::error::{CameraError, RunnerError, ShotError};
use crate::instrument::camera::{Frame, FrameSource};
use crate::instrument::serial_channel::SerialChannel;
use crate::state::Supervisor;

/// Timing and storage parameters of the sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ShotSettings {
    /// Focus value applied before each shot
    pub focus: i32,
    /// Focus write attempts
    pub focus_retries: u32,
    /// Wait between LED on and frame grab
    pub exposure_settle: Duration,
    /// `<record_dir>/<instrument_id>`
    pub instrument_dir: PathBuf,
}

impl ShotSettings {
    /// Settings for `instrument_id` from the runner configuration.
    pub fn from_config(config: &RunnerConfig, instrument_id: &str) -> Self {
        Self {
            focus: config.camera.focus,
            focus_retries: config.camera.focus_retries,
            exposure_settle: config.camera.exposure_settle(),
            instrument_dir: config.instrument.instrument_dir(instrument_id),
        }
    }
}

#[derive(Debug, Default)]
struct ShotStatus {
    intensity: Option<i32>,
    busy: bool,
    fault: Option<ShotError>,
}

struct Shared {
    pending: Mutex<Option<ShotRequest>>,
    status: Mutex<ShotStatus>,
    wake: Notify,
    closing: AtomicBool,
}

struct Sequence {
    camera: Arc<dyn FrameSource>,
    serial: SerialChannel,
    mask: Mask,
    roi: Roi,
    settings: ShotSettings,
}

/// Hardware-backed [`Acquisition`].
pub struct ShotPipeline {
    shared: Arc<Shared>,
    camera: Arc<dyn FrameSource>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ShotPipeline {
    /// Validate the mask, place the ROI and start the worker.
    ///
    /// The mask is checked before any controller command is sent.
    pub async fn new(
        camera: Arc<dyn FrameSource>,
        serial: SerialChannel,
        mask: Mask,
        roi_config: RoiConfig,
        settings: ShotSettings,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self, ShotError> {
        mask.validate(&roi_config)?;

        let reference = serial.reference_position().await?;
        let roi = Roi::from_reference(reference, &roi_config)?;
        info!(
            "ROI at row {}, column {} ({}x{})",
            roi.top, roi.left, roi.height, roi.width
        );

        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            status: Mutex::new(ShotStatus::default()),
            wake: Notify::new(),
            closing: AtomicBool::new(false),
        });

        let sequence = Sequence {
            camera: camera.clone(),
            serial,
            mask,
            roi,
            settings,
        };
        let worker = tokio::spawn(run_worker(shared.clone(), sequence, supervisor));

        Ok(Self {
            shared,
            camera,
            worker: Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl Acquisition for ShotPipeline {
    fn trigger(&self, request: ShotRequest) -> Result<(), ShotError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(ShotError::WorkerStopped);
        }

        self.shared.status.lock().intensity = None;
        let replaced = self.shared.pending.lock().replace(request);
        if let Some(previous) = replaced {
            warn!(
                "Pending shot {} cycle {} replaced before it started",
                previous.fluorescence, previous.cycle
            );
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    fn intensity(&self) -> Result<Option<i32>, ShotError> {
        if self.camera.disconnected() {
            return Err(CameraError::Disconnected.into());
        }

        let status = self.shared.status.lock();
        if let Some(fault) = &status.fault {
            return Err(fault.clone());
        }
        if status.busy || self.shared.pending.lock().is_some() {
            return Ok(None);
        }
        Ok(status.intensity)
    }

    fn cancel_pending(&self) -> bool {
        let cancelled = self.shared.pending.lock().take();
        if let Some(request) = &cancelled {
            info!(
                "Cancelled pending shot {} cycle {}",
                request.fluorescence, request.cycle
            );
        }
        cancelled.is_some()
    }

    async fn close(&self) {
        debug!("Shot pipeline close start");
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Shot worker task failed: {}", e);
            }
        }

        let camera = self.camera.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || camera.stop()).await {
            error!("Camera stop failed: {}", e);
        }
        debug!("Shot pipeline closed");
    }
}

async fn run_worker(shared: Arc<Shared>, sequence: Sequence, supervisor: Arc<Supervisor>) {
    loop {
        let request = loop {
            if shared.closing.load(Ordering::SeqCst) {
                debug!("Shot worker stopping");
                return;
            }
            {
                let mut status = shared.status.lock();
                if let Some(request) = shared.pending.lock().take() {
                    status.busy = true;
                    status.intensity = None;
                    break request;
                }
            }
            shared.wake.notified().await;
        };

        let start = Instant::now();
        let result = sequence.run(&request).await;

        let crop = match result {
            Ok((intensity, crop)) => {
                {
                    let mut status = shared.status.lock();
                    status.intensity = Some(intensity);
                    status.busy = false;
                }
                debug!(
                    "Shot spend time: {:?}, intensity: {}",
                    start.elapsed(),
                    intensity
                );
                crop
            }
            Err(e) => {
                fail(&shared, &supervisor, e).await;
                return;
            }
        };

        if let Err(e) = sequence.save(&request, crop).await {
            fail(&shared, &supervisor, e).await;
            return;
        }
    }
}

async fn fail(shared: &Shared, supervisor: &Supervisor, err: ShotError) {
    {
        let mut status = shared.status.lock();
        status.fault = Some(err.clone());
        status.busy = false;
    }
    supervisor.report(&RunnerError::Shot(err)).await;
    error!("Shot worker stopped after fault");
}

impl Sequence {
    async fn run(&self, request: &ShotRequest) -> Result<(i32, Frame), ShotError> {
        debug!(
            "Shot {} cycle {} ({})",
            request.fluorescence, request.cycle, request.experiment_date
        );

        self.focus().await?;
        self.serial.set_excitation_led(true).await?;
        tokio::time::sleep(self.settings.exposure_settle).await;

        match self.measure(request) {
            Ok(measured) => {
                self.serial.set_excitation_led(false).await?;
                Ok(measured)
            }
            Err(e) => {
                if let Err(off) = self.serial.set_excitation_led(false).await {
                    error!("Cannot turn excitation LED off after failed shot: {}", off);
                }
                Err(e)
            }
        }
    }

    fn measure(&self, request: &ShotRequest) -> Result<(i32, Frame), ShotError> {
        let frame = self.camera.latest_frame()?;
        let crop = self.roi.crop(&frame)?;
        let intensity = compute_intensity(&crop, &self.mask, request.fluorescence.channel())?;
        Ok((intensity, crop))
    }

    /// Transient focus failures are retried; running out of attempts is logged
    /// and the shot continues with whatever focus the camera holds.
    async fn focus(&self) -> Result<(), ShotError> {
        let camera = self.camera.clone();
        let focus = self.settings.focus;
        let attempts = self.settings.focus_retries;

        let outcome = tokio::task::spawn_blocking(move || {
            for attempt in 1..=attempts {
                match camera.set_focus(focus) {
                    Ok(()) => return Ok(()),
                    Err(CameraError::Transient(reason)) => {
                        error!("Camera set focus retry-{}: {}", attempt, reason);
                    }
                    Err(e) => return Err(e),
                }
            }
            // Exhaustion does not abort the shot
            error!("Camera set focus retry failed after {} attempts", attempts);
            Ok(())
        })
        .await
        .map_err(|e| ShotError::Camera(CameraError::Transient(e.to_string())))?;

        outcome.map_err(ShotError::from)
    }

    async fn save(&self, request: &ShotRequest, crop: Frame) -> Result<(), ShotError> {
        let dir = self
            .settings
            .instrument_dir
            .join(sanitize_component(&request.experiment_date));
        let timestamp = chrono::Local::now().format("%H%M%S");
        let path = dir.join(format!(
            "{}_{}_{}.png",
            request.fluorescence.label(),
            request.cycle,
            timestamp
        ));

        let result = tokio::task::spawn_blocking(move || save_png(&crop, &path).map(|()| path))
            .await
            .map_err(|e| ShotError::ImageSave(e.to_string()))?;

        match result {
            Ok(path) => {
                debug!("Saved image '{}'", path.display());
                Ok(())
            }
            Err(e) => {
                error!("image save error: {}", e);
                Err(e)
            }
        }
    }
}

/// Write a BGR frame as an RGB PNG, creating parent directories.
pub fn save_png(frame: &Frame, path: &Path) -> Result<(), ShotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ShotError::ImageSave(format!("{}: {}", parent.display(), e)))?;
    }

    let rgb: Vec<u8> = frame
        .as_bytes()
        .chunks_exact(3)
        .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
        .collect();
    let image = image::RgbImage::from_raw(frame.width(), frame.height(), rgb)
        .ok_or_else(|| ShotError::ImageSave("frame buffer size mismatch".to_string()))?;
    image
        .save(path)
        .map_err(|e| ShotError::ImageSave(format!("{}: {}", path.display(), e)))
}

/// Experiment labels become a single directory name.
fn sanitize_component(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, SerialError};
    use crate::error_recovery::RetryPolicy;
    use crate::hardware::mock::{SimulatedController, SyntheticCamera};
    use crate::instrument::camera::CameraWorker;
    use crate::state::DeviceState;

    const FRAME_W: u32 = 64;
    const FRAME_H: u32 = 48;

    fn roi_config() -> RoiConfig {
        RoiConfig {
            dx: 10,
            dy: 5,
            width: 8,
            height: 6,
        }
    }

    struct Rig {
        controller: SimulatedController,
        camera: Arc<SyntheticCamera>,
        worker: Arc<CameraWorker>,
        supervisor: Arc<Supervisor>,
        dir: tempfile::TempDir,
    }

    impl Rig {
        async fn new() -> Self {
            // Reference (20, 12) puts the crop at row 7, column 10
            let controller = SimulatedController::with_reference("HelloPCR00001", 20, 12);
            let mut frame = Frame::filled(FRAME_W, FRAME_H, [0, 0, 0]);
            for y in 7..13 {
                for x in 10..18 {
                    frame.set_pixel(x, y, [5, 40, 80]);
                }
            }
            let camera = Arc::new(SyntheticCamera::with_interval(frame, Duration::from_millis(1)));
            let worker = Arc::new(CameraWorker::new(camera.clone()));
            worker.start().unwrap();
            let mut rx = worker.slot().subscribe();
            rx.wait_for(|f| f.is_some()).await.unwrap();

            Self {
                controller,
                camera,
                worker,
                supervisor: Arc::new(Supervisor::new()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn serial(&self) -> SerialChannel {
            SerialChannel::new(Box::new(self.controller.clone()), RetryPolicy::with_retries(1))
        }

        fn settings(&self) -> ShotSettings {
            ShotSettings {
                focus: 1023,
                focus_retries: 5,
                exposure_settle: Duration::from_millis(20),
                instrument_dir: self.dir.path().join("HelloPCR00001"),
            }
        }

        async fn pipeline(&self, mask: Mask) -> Result<ShotPipeline, ShotError> {
            ShotPipeline::new(
                self.worker.clone(),
                self.serial(),
                mask,
                roi_config(),
                self.settings(),
                self.supervisor.clone(),
            )
            .await
        }
    }

    async fn wait_for_intensity(pipeline: &ShotPipeline) -> Result<i32, ShotError> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(value) = pipeline.intensity()? {
                    return Ok(value);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("shot did not finish")
    }

    fn request(index: u8, cycle: u8) -> ShotRequest {
        ShotRequest::from_wire(index, cycle, "20240101").unwrap()
    }

    #[tokio::test]
    async fn test_shot_sequence() {
        let rig = Rig::new().await;
        let pipeline = rig.pipeline(Mask::full(8, 6)).await.unwrap();
        assert_eq!(pipeline.intensity().unwrap(), None);

        pipeline.trigger(request(0, 5)).unwrap();
        assert_eq!(wait_for_intensity(&pipeline).await.unwrap(), 40 * 256);

        pipeline.trigger(request(2, 6)).unwrap();
        assert_eq!(wait_for_intensity(&pipeline).await.unwrap(), 80 * 256);

        assert_eq!(
            rig.controller.commands(),
            vec!["m", "E 1", "E 0", "E 1", "E 0"]
        );
        assert_eq!(rig.camera.focus(), 1023);
        pipeline.close().await;
        assert!(rig.camera.is_closed());
    }

    #[tokio::test]
    async fn test_mask_mismatch_sends_no_commands() {
        let rig = Rig::new().await;
        let result = rig.pipeline(Mask::full(6, 8)).await;
        assert!(matches!(result, Err(ShotError::MaskShape { .. })));
        assert!(rig.controller.commands().is_empty());
        rig.worker.stop();
    }

    #[tokio::test]
    async fn test_negative_origin_fails_construction() {
        let rig = Rig::new().await;
        rig.controller.override_response("m", "3 3");
        let result = rig.pipeline(Mask::full(8, 6)).await;
        assert_eq!(
            result.err(),
            Some(ShotError::InvalidReference { x: 3, y: 3 })
        );
        rig.worker.stop();
    }

    #[tokio::test]
    async fn test_saves_crop_under_experiment_dir() {
        let rig = Rig::new().await;
        let pipeline = rig.pipeline(Mask::full(8, 6)).await.unwrap();
        pipeline.trigger(request(3, 12)).unwrap();
        wait_for_intensity(&pipeline).await.unwrap();

        let dir = rig.dir.path().join("HelloPCR00001").join("20240101");
        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(mut entries) = std::fs::read_dir(&dir) {
                    if let Some(Ok(entry)) = entries.next() {
                        return entry.file_name().to_string_lossy().to_string();
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(saved.starts_with("CY5_12_"), "{}", saved);
        assert!(saved.ends_with(".png"));
        let image = image::open(dir.join(&saved)).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (8, 6));
        assert_eq!(image.get_pixel(0, 0).0, [80, 40, 5]);
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_focus_exhaustion_does_not_abort_shot() {
        let rig = Rig::new().await;
        rig.camera.fail_focus(u32::MAX);
        let pipeline = rig.pipeline(Mask::full(8, 6)).await.unwrap();

        pipeline.trigger(request(1, 1)).unwrap();
        assert_eq!(wait_for_intensity(&pipeline).await.unwrap(), 40 * 256);
        assert_eq!(rig.camera.focus_attempts(), 5);
        assert!(!rig.supervisor.has_fault());
        pipeline.close().await;
    }

    async fn wait_for_fault(supervisor: &Supervisor) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !supervisor.has_fault() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no fault reported");
    }

    #[tokio::test]
    async fn test_camera_loss_is_reported() {
        let rig = Rig::new().await;
        let pipeline = rig.pipeline(Mask::full(8, 6)).await.unwrap();
        rig.camera.unplug();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !rig.worker.disconnected() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        pipeline.trigger(request(0, 1)).unwrap();
        wait_for_fault(&rig.supervisor).await;
        assert_eq!(rig.supervisor.error_code(), ErrorCode::CameraError);
        assert_eq!(
            pipeline.intensity(),
            Err(ShotError::Camera(CameraError::Disconnected))
        );
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_crop_failure_turns_led_off() {
        let rig = Rig::new().await;
        // Column 60 + 8 runs past the 64 pixel wide frame
        rig.controller.override_response("m", "70 12");
        let pipeline = rig.pipeline(Mask::full(8, 6)).await.unwrap();

        pipeline.trigger(request(0, 1)).unwrap();
        wait_for_fault(&rig.supervisor).await;
        assert_eq!(rig.supervisor.error_code(), ErrorCode::ShotWorkerError);
        assert_eq!(pipeline.intensity(), Err(ShotError::RoiOutOfFrame));
        assert_eq!(rig.controller.commands(), vec!["m", "E 1", "E 0"]);
        assert!(!rig.controller.excitation_led());
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_save_failure_faults_after_led_off() {
        let rig = Rig::new().await;
        rig.supervisor.attach_serial(rig.serial());
        // A regular file where the instrument directory's parent should be
        let blocker = rig.dir.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut settings = rig.settings();
        settings.instrument_dir = blocker.join("HelloPCR00001");

        let pipeline = ShotPipeline::new(
            rig.worker.clone(),
            rig.serial(),
            Mask::full(8, 6),
            roi_config(),
            settings,
            rig.supervisor.clone(),
        )
        .await
        .unwrap();

        pipeline.trigger(request(0, 2)).unwrap();
        wait_for_fault(&rig.supervisor).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while rig.controller.device_state() != DeviceState::Error.as_u8() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ERROR not mirrored to the indicator");

        assert_eq!(rig.supervisor.error_code(), ErrorCode::ShotWorkerError);
        assert_eq!(rig.supervisor.device_state(), Some(DeviceState::Error));
        assert_eq!(rig.controller.commands(), vec!["m", "E 1", "E 0", "I 3"]);
        assert!(!rig.controller.excitation_led());
        assert!(matches!(pipeline.intensity(), Err(ShotError::ImageSave(_))));
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_serial_loss_during_shot() {
        let rig = Rig::new().await;
        let pipeline = rig.pipeline(Mask::full(8, 6)).await.unwrap();
        rig.controller.unplug();

        pipeline.trigger(request(0, 1)).unwrap();
        wait_for_fault(&rig.supervisor).await;

        assert_eq!(rig.supervisor.error_code(), ErrorCode::SerialError);
        assert_eq!(
            pipeline.intensity(),
            Err(ShotError::Serial(SerialError::Disconnected))
        );
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let rig = Rig::new().await;
        let mut settings = rig.settings();
        settings.exposure_settle = Duration::from_millis(300);
        let pipeline = ShotPipeline::new(
            rig.worker.clone(),
            rig.serial(),
            Mask::full(8, 6),
            roi_config(),
            settings,
            rig.supervisor.clone(),
        )
        .await
        .unwrap();

        pipeline.trigger(request(0, 1)).unwrap();
        // Wait until the first shot has started
        tokio::time::timeout(Duration::from_secs(2), async {
            while !rig.controller.excitation_led() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        pipeline.trigger(request(1, 2)).unwrap();
        assert!(pipeline.cancel_pending());
        assert!(!pipeline.cancel_pending());

        wait_for_intensity(&pipeline).await.unwrap();
        assert_eq!(rig.controller.commands(), vec!["m", "E 1", "E 0"]);
        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_trigger_during_shot_is_deferred() {
        let rig = Rig::new().await;
        let mut settings = rig.settings();
        settings.exposure_settle = Duration::from_millis(100);
        let pipeline = ShotPipeline::new(
            rig.worker.clone(),
            rig.serial(),
            Mask::full(8, 6),
            roi_config(),
            settings,
            rig.supervisor.clone(),
        )
        .await
        .unwrap();

        pipeline.trigger(request(0, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.trigger(request(2, 2)).unwrap();
        assert_eq!(pipeline.intensity().unwrap(), None);

        assert_eq!(wait_for_intensity(&pipeline).await.unwrap(), 80 * 256);
        // LED on/off pairs never interleave
        assert_eq!(
            rig.controller.commands(),
            vec!["m", "E 1", "E 0", "E 1", "E 0"]
        );
        pipeline.close().await;
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("20240101"), "20240101");
        assert_eq!(sanitize_component("../etc"), ".._etc");
        assert_eq!(sanitize_component(""), "_");
    }
}
