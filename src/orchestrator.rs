//! Sequencing of synthesis, transport and reception for the four hardware operations.
//!
//! ```text
//! Idle -> WaveformsPending -> Sent -> AwaitingResponse -> Complete
//!   \________(cached)______/    \          \
//!                                \--------> Failed
//! ```
//!
//! The orchestrator owns the only cross-request state: the configuration the hardware
//! last received waveforms for, and the per-frame time estimate used to size receive
//! deadlines. Both change only after a fully successful exchange; a failure clears the
//! cached configuration so the next scan regenerates waveforms. Every operation takes
//! `&mut self`, so two exchanges can never interleave.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::data::raster_file::load_photometry_archive;
use crate::data::stack::ChannelMeans;
use crate::error::{AppResult, DaqError};
use crate::protocol::archive::{encode_f64, ArchiveEntry, ROW_PAIR_FILE};
use crate::protocol::client::{AcquisitionClient, ResponseListener};
use crate::protocol::manifest::{Manifest, Section};
use crate::protocol::{ScanFunction, IMAGE_DESCRIPTION_FILE, PHOTOMETRY_DESCRIPTION_FILE};
use crate::scan::{PhotometryConfiguration, ScanConfiguration};
use crate::waveform::{synthesize, Saturation, ScanPattern, WaveformSet};

/// Sweep duration forced for test photometry (ms).
pub const TEST_PHOTOMETRY_DURATION_MS: f64 = 7.0;

/// Receive deadline of test photometry.
pub const TEST_PHOTOMETRY_TIMEOUT: Duration = Duration::from_secs(2);

/// File the test photometry data is written to, inside the temp folder.
pub const TEST_PHOTOMETRY_FILE: &str = "testPhotometry.gsi";

/// Samples averaged by test photometry: 1 ms shutter settle, then 5 ms at 1 MHz.
pub const TEST_PHOTOMETRY_WINDOW: std::ops::Range<usize> = 1000..6000;

/// Where an exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Nothing in flight
    Idle,
    /// Waveforms and descriptor being generated
    WaveformsPending,
    /// Command archive delivered
    Sent,
    /// Waiting for the controller to return data
    AwaitingResponse,
    /// Last exchange succeeded
    Complete,
    /// Last exchange failed
    Failed,
}

/// Parameters of one raster acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    /// Frames to acquire
    pub frames: usize,
    /// Where the returned archive is written
    pub destination: PathBuf,
    /// Live focus frame (passed through to the controller)
    pub focus: bool,
    /// Regenerate waveforms even if the configuration is unchanged
    pub force_refresh: bool,
    /// Ask the controller to return stage position data
    pub position_data: bool,
}

impl ScanRequest {
    /// Single-frame request writing to `destination`.
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            frames: 1,
            destination: destination.into(),
            focus: false,
            force_refresh: false,
            position_data: false,
        }
    }

    /// Builder-style frame count.
    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Builder-style force-refresh flag.
    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

/// One hardware operation.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Acquire raster frames
    Scan {
        /// Scan parameters
        config: ScanConfiguration,
        /// Frames, destination and flags
        request: ScanRequest,
    },
    /// One-way named command, e.g. `CloseShutter`
    Command(String),
    /// Load photometry waveforms for a later trigger
    ArmPhotometry {
        /// Photometry parameters
        config: PhotometryConfiguration,
        /// Ask for position data with the photometry episode
        position_data: bool,
    },
    /// Short photometry sweep at a spot, reporting mean responses
    TestPhotometry {
        /// Photometry parameters (duration is overridden)
        config: PhotometryConfiguration,
    },
}

/// Outcome of a successful exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcquisitionResult {
    /// Returned data archive
    pub artifact: Option<PathBuf>,
    /// Descriptor written for this request (only when waveforms were regenerated)
    pub descriptor: Option<PathBuf>,
    /// Saturation of freshly synthesized waveforms
    pub saturation: Option<Saturation>,
    /// Synthesis summary of freshly synthesized waveforms
    pub status_msg: Option<String>,
    /// Mean responses of test photometry
    pub means: Option<ChannelMeans>,
    /// Size of the command archive
    pub bytes_sent: usize,
    /// Size of the returned archive
    pub bytes_received: u64,
}

/// Normalized report of any operation, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionReport {
    /// The exchange completed
    pub success: bool,
    /// Returned data archive
    pub artifact: Option<PathBuf>,
    /// Descriptor written for this request
    pub descriptor: Option<PathBuf>,
    /// Status on success, diagnostic on failure
    pub message: String,
    /// Mean responses of test photometry
    pub means: Option<ChannelMeans>,
}

/// Drives exchanges with the hardware controller, one at a time.
#[derive(Debug)]
pub struct AcquisitionOrchestrator {
    settings: Settings,
    client: AcquisitionClient,
    state: AcquisitionState,
    last_config: Option<ScanConfiguration>,
    est_sec_per_frame: Option<f64>,
}

impl AcquisitionOrchestrator {
    /// Orchestrator for the given settings.
    pub fn new(settings: Settings) -> Self {
        let client = AcquisitionClient::from_settings(&settings.system);
        Self {
            settings,
            client,
            state: AcquisitionState::Idle,
            last_config: None,
            est_sec_per_frame: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Per-frame time estimate carried over from the last successful scan.
    pub fn est_sec_per_frame(&self) -> Option<f64> {
        self.est_sec_per_frame
    }

    /// True if the hardware holds waveforms for `config` from a previous scan.
    pub fn is_cached(&self, config: &ScanConfiguration) -> bool {
        self.last_config.as_ref() == Some(&waveform_key(config))
    }

    fn transition(&mut self, next: AcquisitionState) {
        debug!(from = ?self.state, to = ?next, "acquisition state");
        self.state = next;
    }

    /// Run any operation and fold the outcome into a report.
    pub async fn execute(&mut self, operation: Operation) -> AcquisitionReport {
        let outcome = match operation {
            Operation::Scan { config, request } => self.run_scan(&config, &request).await,
            Operation::Command(name) => self.generic_command(&name).await,
            Operation::ArmPhotometry {
                config,
                position_data,
            } => self.arm_photometry(&config, position_data).await,
            Operation::TestPhotometry { config } => self.test_photometry(&config).await,
        };
        match outcome {
            Ok(result) => AcquisitionReport {
                success: true,
                message: result
                    .status_msg
                    .clone()
                    .unwrap_or_else(|| "ok".to_string()),
                artifact: result.artifact,
                descriptor: result.descriptor,
                means: result.means,
            },
            Err(err) => {
                error!(error = %err, "acquisition failed");
                AcquisitionReport {
                    success: false,
                    artifact: None,
                    descriptor: None,
                    message: err.to_string(),
                    means: None,
                }
            }
        }
    }

    /// Acquire `request.frames` raster frames with `config`.
    pub async fn run_scan(
        &mut self,
        config: &ScanConfiguration,
        request: &ScanRequest,
    ) -> AppResult<AcquisitionResult> {
        self.transition(AcquisitionState::Idle);
        let outcome = self.scan_exchange(config, request).await;
        self.settle(outcome)
    }

    /// Send a one-way named command (e.g. `CloseShutter`).
    pub async fn generic_command(&mut self, name: &str) -> AppResult<AcquisitionResult> {
        self.transition(AcquisitionState::Idle);
        let outcome = self.command_exchange(name).await;
        self.settle(outcome)
    }

    /// Load photometry waveforms into the controller for a later trigger.
    pub async fn arm_photometry(
        &mut self,
        config: &PhotometryConfiguration,
        position_data: bool,
    ) -> AppResult<AcquisitionResult> {
        self.transition(AcquisitionState::Idle);
        let outcome = self.arm_exchange(config, position_data).await;
        self.settle(outcome)
    }

    /// Run a short photometry sweep and report the mean response of channels A and B.
    pub async fn test_photometry(
        &mut self,
        config: &PhotometryConfiguration,
    ) -> AppResult<AcquisitionResult> {
        self.transition(AcquisitionState::Idle);
        let outcome = self.test_exchange(config).await;
        self.settle(outcome)
    }

    async fn scan_exchange(
        &mut self,
        config: &ScanConfiguration,
        request: &ScanRequest,
    ) -> AppResult<AcquisitionResult> {
        let config = config.clone().with_frames(request.frames);
        config.validate()?;

        let update = request.force_refresh || !self.is_cached(&config);
        let waveforms = if update {
            self.transition(AcquisitionState::WaveformsPending);
            Some(synthesize(ScanPattern::Raster(&config))?)
        } else {
            None
        };
        let input = self.prepare_input_folder().await?;
        let mut files = Vec::new();
        let mut result = AcquisitionResult::default();
        let mut fresh_estimate = None;

        if let Some(waveforms) = waveforms {
            let mut derived = waveforms.derived_section(&timestamp());
            if config.save_row_pair {
                let path = self.settings.system.temp_folder.join(ROW_PAIR_FILE);
                tokio::fs::write(&path, encode_f64(&waveforms.row_pair)).await?;
                derived.set("rowpairfilename", path.display());
            }
            let (major, minor) = config.to_sections();
            let descriptor = Manifest::new()
                .with_section(major)
                .with_section(minor)
                .with_section(derived)
                .with_section(self.settings.system.to_section());
            let descriptor_path = write_request_files(
                &input,
                IMAGE_DESCRIPTION_FILE,
                &descriptor,
                &waveforms,
                &mut files,
            )
            .await?;
            fresh_estimate = waveforms.estimated_frame_ms().map(|ms| ms / 1000.0);
            result.descriptor = Some(descriptor_path);
            result.saturation = Some(waveforms.saturation);
            result.status_msg = Some(waveforms.status_msg.clone());
            info!(status = %waveforms.status_msg, "created new scan waveforms");
        } else {
            info!("configuration unchanged; controller reuses its cached descriptor");
        }

        let est_sec_per_frame = fresh_estimate.or(self.est_sec_per_frame);
        let deadline = self.receive_deadline(config.frame_count, est_sec_per_frame);

        let listener = self.client.listen(self.settings.system.return_addr()).await?;
        let mut commands = self.command_section(ScanFunction::RunScanner, "DoScan", &listener, &input);
        commands
            .set("imagedesc", IMAGE_DESCRIPTION_FILE)
            .set("updatescanwaveforms", u8::from(update))
            .set("numframes", config.frame_count)
            .set("focusmode", u8::from(request.focus))
            .set("destfilename", request.destination.display())
            .set("positiondata", u8::from(request.position_data))
            .set("returnpositiondata", u8::from(request.position_data));
        if let Some(est) = est_sec_per_frame {
            commands.set("estsecperframe", est);
        }

        result.bytes_sent = self.send(&files, commands).await?;
        result.bytes_received = self
            .await_response(listener, &request.destination, deadline)
            .await?;
        result.artifact = Some(request.destination.clone());

        self.last_config = Some(waveform_key(&config));
        if fresh_estimate.is_some() {
            self.est_sec_per_frame = fresh_estimate;
        }
        info!(
            path = %request.destination.display(),
            frames = config.frame_count,
            "scan complete"
        );
        Ok(result)
    }

    async fn command_exchange(&mut self, name: &str) -> AppResult<AcquisitionResult> {
        if name.trim().is_empty() {
            return Err(DaqError::configuration("specificcommand", "command name is empty"));
        }
        let input = self.prepare_input_folder().await?;
        let mut commands = self.base_commands(ScanFunction::GenericCommand, name, &input);
        commands
            .set("specificcommand", name)
            .set("returnport", self.settings.system.return_port);

        let bytes_sent = self.send(&[], commands).await?;
        info!(command = name, "sent generic command");
        Ok(AcquisitionResult {
            bytes_sent,
            status_msg: Some(format!("sent {}", name)),
            ..Default::default()
        })
    }

    async fn arm_exchange(
        &mut self,
        config: &PhotometryConfiguration,
        position_data: bool,
    ) -> AppResult<AcquisitionResult> {
        config.validate()?;
        let input = self.prepare_input_folder().await?;
        let (descriptor, waveforms, files) = self.photometry_files(config, &input).await?;

        let mut commands = self.base_commands(ScanFunction::ArmPhotometry, "DoLoadPhotometry", &input);
        commands
            .set("imagedesc", PHOTOMETRY_DESCRIPTION_FILE)
            .set("updatescanwaveforms", 1)
            .set("positiondata", u8::from(position_data))
            .set("positionepisode", config.position_episode)
            .set("returnport", self.settings.system.return_port);

        let bytes_sent = self.send(&files, commands).await?;
        info!(shape = %config.shape, spot = %config.spot_name, "photometry armed");
        Ok(AcquisitionResult {
            descriptor: Some(descriptor),
            saturation: Some(waveforms.saturation),
            status_msg: Some(waveforms.status_msg),
            bytes_sent,
            ..Default::default()
        })
    }

    async fn test_exchange(
        &mut self,
        config: &PhotometryConfiguration,
    ) -> AppResult<AcquisitionResult> {
        let mut config = config.clone();
        config.duration_ms = TEST_PHOTOMETRY_DURATION_MS;
        config.validate()?;

        let input = self.prepare_input_folder().await?;
        let (descriptor, waveforms, files) = self.photometry_files(&config, &input).await?;
        let destination = self.settings.system.temp_folder.join(TEST_PHOTOMETRY_FILE);

        let listener = self.client.listen(self.settings.system.return_addr()).await?;
        let mut commands =
            self.command_section(ScanFunction::TestPhotometry, "DoTestPhotometry", &listener, &input);
        commands
            .set("imagedesc", PHOTOMETRY_DESCRIPTION_FILE)
            .set("updatescanwaveforms", 1)
            .set("destfilename", destination.display());

        let bytes_sent = self.send(&files, commands).await?;
        let bytes_received = self
            .await_response(listener, &destination, TEST_PHOTOMETRY_TIMEOUT)
            .await?;

        let trace = load_photometry_archive(&destination)?;
        let Some(means) = trace.window_means(TEST_PHOTOMETRY_WINDOW) else {
            return Err(DaqError::Protocol(format!(
                "not enough photometry data returned: {} samples, need {}",
                trace.a.len().min(trace.b.len()),
                TEST_PHOTOMETRY_WINDOW.end
            )));
        };
        info!(mean_a = means.a, mean_b = means.b, "test photometry complete");
        Ok(AcquisitionResult {
            artifact: Some(destination),
            descriptor: Some(descriptor),
            saturation: Some(waveforms.saturation),
            status_msg: Some(waveforms.status_msg),
            means: Some(means),
            bytes_sent,
            bytes_received,
        })
    }

    /// `grace + frames * estimate`, or `frames * fallback` when nothing is known yet.
    fn receive_deadline(&self, frames: usize, est_sec_per_frame: Option<f64>) -> Duration {
        let system = &self.settings.system;
        let seconds = match est_sec_per_frame {
            Some(est) => system.receive_grace_secs + frames as f64 * est,
            None => frames as f64 * system.fallback_sec_per_frame,
        };
        debug!(seconds, frames, "receive deadline");
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Synthesize photometry waveforms and write their descriptor; the hardware cache no
    /// longer holds raster waveforms afterwards.
    async fn photometry_files(
        &mut self,
        config: &PhotometryConfiguration,
        input: &Path,
    ) -> AppResult<(PathBuf, WaveformSet, Vec<ArchiveEntry>)> {
        self.transition(AcquisitionState::WaveformsPending);
        self.last_config = None;
        let waveforms = synthesize(ScanPattern::Photometry(config))?;
        let descriptor = Manifest::new()
            .with_section(waveforms.derived_section(&timestamp()))
            .with_section(self.settings.system.to_section());
        let mut files = Vec::new();
        let path = write_request_files(
            input,
            PHOTOMETRY_DESCRIPTION_FILE,
            &descriptor,
            &waveforms,
            &mut files,
        )
        .await?;
        Ok((path, waveforms, files))
    }

    /// Interface keys shared by every command file.
    fn base_commands(&self, function: ScanFunction, current: &str, input: &Path) -> Section {
        let system = &self.settings.system;
        Section::new("Commands")
            .with("doscanfunction", function)
            .with("currentcommand", current)
            .with("localinputfolder", input.display())
            .with("commandtimestamp", timestamp())
            .with("returnipaddress", system.return_ip)
            .with("diagmode", u8::from(self.settings.application.diag_mode))
    }

    /// Interface keys for an exchange that expects data back on `listener`.
    fn command_section(
        &self,
        function: ScanFunction,
        current: &str,
        listener: &ResponseListener,
        input: &Path,
    ) -> Section {
        self.base_commands(function, current, input)
            .with("returnport", listener.local_addr().port())
    }

    async fn send(&mut self, files: &[ArchiveEntry], commands: Section) -> AppResult<usize> {
        let command = Manifest::new().with_section(commands);
        let hardware = self.settings.system.hardware_addr();
        let bytes = self.client.send(files, &command, hardware).await?;
        self.transition(AcquisitionState::Sent);
        Ok(bytes)
    }

    async fn await_response(
        &mut self,
        listener: ResponseListener,
        destination: &Path,
        deadline: Duration,
    ) -> AppResult<u64> {
        self.transition(AcquisitionState::AwaitingResponse);
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        listener.accept_into(destination, deadline).await
    }

    /// Fold the outcome of an exchange into the orchestrator state.
    fn settle(&mut self, outcome: AppResult<AcquisitionResult>) -> AppResult<AcquisitionResult> {
        match outcome {
            Ok(result) => {
                self.transition(AcquisitionState::Complete);
                Ok(result)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Record a failed exchange and hand the error back.
    fn fail(&mut self, err: DaqError) -> DaqError {
        warn!(error = %err, state = ?self.state, "exchange failed");
        self.last_config = None;
        self.transition(AcquisitionState::Failed);
        err
    }

    /// Create (or empty) `<temp>/Input`.
    async fn prepare_input_folder(&self) -> AppResult<PathBuf> {
        let input = self.settings.system.input_folder();
        if tokio::fs::try_exists(&input).await? {
            let mut entries = tokio::fs::read_dir(&input).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        } else {
            tokio::fs::create_dir_all(&input).await?;
        }
        Ok(input)
    }
}

/// Configuration with the fields that do not affect waveforms normalized away.
fn waveform_key(config: &ScanConfiguration) -> ScanConfiguration {
    config.clone().with_frames(1)
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Write the descriptor and waveform binaries into `input` and collect them as archive
/// entries. Returns the descriptor path.
async fn write_request_files(
    input: &Path,
    descriptor_name: &str,
    descriptor: &Manifest,
    waveforms: &WaveformSet,
    files: &mut Vec<ArchiveEntry>,
) -> AppResult<PathBuf> {
    files.push(ArchiveEntry::manifest(descriptor_name, descriptor));
    files.extend(waveforms.entries());
    for entry in files.iter() {
        tokio::fs::write(input.join(&entry.name), &entry.bytes).await?;
    }
    Ok(input.join(descriptor_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;

    fn settings(temp: &Path) -> Settings {
        Settings {
            system: SystemConfig {
                temp_folder: temp.to_path_buf(),
                return_port: 0,
                connect_timeout_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_receive_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(settings(dir.path()));
        assert_eq!(
            orchestrator.receive_deadline(5, Some(0.5)),
            Duration::from_secs_f64(2.0 + 2.5)
        );
        assert_eq!(orchestrator.receive_deadline(3, None), Duration::from_secs(6));
    }

    #[test]
    fn test_cache_key_ignores_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = AcquisitionOrchestrator::new(settings(dir.path()));
        let config = ScanConfiguration::default();
        orchestrator.last_config = Some(waveform_key(&config.clone().with_frames(7)));
        assert!(orchestrator.is_cached(&config));
        let zoomed = ScanConfiguration {
            zoom: 3.0,
            ..config
        };
        assert!(!orchestrator.is_cached(&zoomed));
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = AcquisitionOrchestrator::new(settings(dir.path()));
        let config = ScanConfiguration {
            bidirectional: false,
            linear_percentage: 20.0,
            ..Default::default()
        };
        let input = orchestrator.prepare_input_folder().await.unwrap();
        let previous = input.join(IMAGE_DESCRIPTION_FILE);
        std::fs::write(&previous, b"[Major]\r\n").unwrap();

        let err = orchestrator
            .run_scan(&config, &ScanRequest::new(dir.path().join("x.gsi")))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration { .. }), "{}", err);
        assert_eq!(orchestrator.state(), AcquisitionState::Failed);
        assert!(previous.exists());
    }

    #[tokio::test]
    async fn test_invalid_photometry_keeps_input_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = AcquisitionOrchestrator::new(settings(dir.path()));
        let input = orchestrator.prepare_input_folder().await.unwrap();
        let previous = input.join(IMAGE_DESCRIPTION_FILE);
        std::fs::write(&previous, b"[Major]\r\n").unwrap();

        let report = orchestrator
            .execute(Operation::ArmPhotometry {
                config: PhotometryConfiguration {
                    rev_per_ms: 0.0,
                    ..Default::default()
                },
                position_data: false,
            })
            .await;
        assert!(!report.success);
        assert_eq!(orchestrator.state(), AcquisitionState::Failed);
        assert!(previous.exists());
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        // Bind and drop to find a port with nothing listening.
        s.system.hardware_adc_port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let mut orchestrator = AcquisitionOrchestrator::new(s);
        let report = orchestrator
            .execute(Operation::Command("CloseShutter".to_string()))
            .await;
        assert!(!report.success);
        assert!(report.message.contains("connect"), "{}", report.message);
        assert_eq!(orchestrator.state(), AcquisitionState::Failed);
    }

    #[tokio::test]
    async fn test_input_folder_is_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = AcquisitionOrchestrator::new(settings(dir.path()));
        let input = orchestrator.prepare_input_folder().await.unwrap();
        std::fs::write(input.join("stale.bin"), b"old").unwrap();
        std::fs::create_dir(input.join("nested")).unwrap();
        let input = orchestrator.prepare_input_folder().await.unwrap();
        assert_eq!(std::fs::read_dir(input).unwrap().count(), 0);
    }
}
