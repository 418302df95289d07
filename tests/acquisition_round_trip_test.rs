//! End-to-end exchanges between the orchestrator and the mock scan head over localhost TCP.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use raster_daq::config::{Settings, SystemConfig};
use raster_daq::data::{load_raster_archive, LoadOptions};
use raster_daq::hardware::{MockScanHead, ReceivedCommand};
use raster_daq::protocol::archive::{SCAN_POINTS_X, SCAN_POINTS_Y};
use raster_daq::protocol::{ScanFunction, COMMAND_FILE, IMAGE_DESCRIPTION_FILE};
use raster_daq::{
    synthesize, AcquisitionOrchestrator, AcquisitionState, DaqError, Operation,
    PhotometryConfiguration, ScanConfiguration, ScanPattern, ScanRequest,
};
use tokio::task::JoinHandle;

/// Mock head on an ephemeral port plus settings pointing at it.
async fn setup(temp: &Path, frame_time: Duration) -> (Arc<MockScanHead>, JoinHandle<()>, Settings) {
    let head = Arc::new(
        MockScanHead::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_frame_time(frame_time),
    );
    let task = head.clone().spawn();
    let settings = Settings {
        system: SystemConfig {
            hardware_adc_port: head.local_addr().port(),
            return_port: 0,
            temp_folder: temp.to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    };
    (head, task, settings)
}

/// Small bidirectional scan with a 5-pixel detector lag.
fn small_scan() -> ScanConfiguration {
    ScanConfiguration {
        x_size: 32,
        y_size: 8,
        zoom: 6.0,
        lag_tweak_us: 10.0,
        ..Default::default()
    }
}

/// Wait until the head has recorded `count` commands.
async fn received_eventually(head: &MockScanHead, count: usize) -> Vec<ReceivedCommand> {
    let start = Instant::now();
    loop {
        let received = head.received().await;
        if received.len() >= count || start.elapsed() > Duration::from_secs(2) {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn counts(volts: f64) -> i16 {
    (volts * raster_daq::hardware::COUNTS_PER_VOLT).round() as i16
}

#[tokio::test]
async fn test_scan_round_trip_recovers_drive_ramp() {
    let dir = tempfile::tempdir().unwrap();
    let (head, task, settings) = setup(dir.path(), Duration::ZERO).await;
    let mut orchestrator = AcquisitionOrchestrator::new(settings);
    let config = small_scan();
    let destination = dir.path().join("out").join("scan1.gsi");

    let result = orchestrator
        .run_scan(&config, &ScanRequest::new(&destination).frames(2))
        .await
        .unwrap();
    assert_eq!(orchestrator.state(), AcquisitionState::Complete);
    assert_eq!(result.artifact.as_deref(), Some(destination.as_path()));
    assert!(result.descriptor.unwrap().ends_with(IMAGE_DESCRIPTION_FILE));
    assert!(!result.saturation.unwrap().any());
    assert!(orchestrator.est_sec_per_frame().unwrap() > 0.0);

    let received = received_eventually(&head, 1).await;
    assert_eq!(received[0].function, ScanFunction::RunScanner);
    assert_eq!(received[0].get("currentcommand"), Some("DoScan"));
    assert_eq!(received[0].get("updatescanwaveforms"), Some("1"));
    assert_eq!(received[0].get("numframes"), Some("2"));
    for name in [COMMAND_FILE, IMAGE_DESCRIPTION_FILE, SCAN_POINTS_X, SCAN_POINTS_Y] {
        assert!(received[0].files.iter().any(|f| f == name), "missing {}", name);
    }

    let stack = load_raster_archive(&destination, &LoadOptions::default()).unwrap();
    assert_eq!(stack.letters(), "AB");
    assert_eq!(stack.frame_count, 2);
    assert_eq!(stack.parameter("lagpixels"), Some("5"));

    let waveforms = synthesize(ScanPattern::Raster(&config)).unwrap();
    let tl = waveforms.turn_length();
    let line = config.x_size + tl;
    for frame in &stack.channel('A').unwrap().frames {
        assert_eq!(frame.dim(), (config.y_size, config.x_size));
        for row in 0..config.y_size {
            let start = row * line + tl;
            let mut expected: Vec<i16> = waveforms.x[start..start + config.x_size]
                .iter()
                .map(|v| counts(*v))
                .collect();
            if row % 2 == 1 {
                expected.reverse();
            }
            assert_eq!(frame.row(row).to_vec(), expected, "row {}", row);
        }
    }
    task.abort();
}

#[tokio::test]
async fn test_unchanged_configuration_reuses_cached_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let (head, task, settings) = setup(dir.path(), Duration::ZERO).await;
    let mut orchestrator = AcquisitionOrchestrator::new(settings);
    let config = small_scan();

    orchestrator
        .run_scan(&config, &ScanRequest::new(dir.path().join("a.gsi")))
        .await
        .unwrap();
    let second = orchestrator
        .run_scan(&config, &ScanRequest::new(dir.path().join("b.gsi")).frames(3))
        .await
        .unwrap();
    assert!(second.descriptor.is_none());
    assert!(second.saturation.is_none());

    let received = received_eventually(&head, 2).await;
    assert_eq!(received[1].files, vec![COMMAND_FILE.to_string()]);
    assert_eq!(received[1].get("updatescanwaveforms"), Some("0"));
    assert!(received[1].get("estsecperframe").is_some());

    // The cached descriptor still decodes the new data.
    let stack = load_raster_archive(dir.path().join("b.gsi"), &LoadOptions::default()).unwrap();
    assert_eq!(stack.frame_count, 3);

    // A forced refresh resends everything.
    orchestrator
        .run_scan(
            &config,
            &ScanRequest::new(dir.path().join("c.gsi")).force_refresh(true),
        )
        .await
        .unwrap();
    let received = received_eventually(&head, 3).await;
    assert_eq!(received[2].get("updatescanwaveforms"), Some("1"));
    task.abort();
}

#[tokio::test]
async fn test_photometry_invalidates_cached_scan() {
    let dir = tempfile::tempdir().unwrap();
    let (head, task, settings) = setup(dir.path(), Duration::ZERO).await;
    let mut orchestrator = AcquisitionOrchestrator::new(settings);
    let config = small_scan();

    orchestrator
        .run_scan(&config, &ScanRequest::new(dir.path().join("a.gsi")))
        .await
        .unwrap();
    assert!(orchestrator.is_cached(&config));

    let report = orchestrator
        .execute(Operation::ArmPhotometry {
            config: PhotometryConfiguration::default().at(0.5, 0.5),
            position_data: true,
        })
        .await;
    assert!(report.success, "{}", report.message);
    assert!(!orchestrator.is_cached(&config));

    let received = received_eventually(&head, 2).await;
    assert_eq!(received[1].function, ScanFunction::ArmPhotometry);
    assert_eq!(received[1].get("currentcommand"), Some("DoLoadPhotometry"));
    assert_eq!(received[1].get("positiondata"), Some("1"));

    let result = orchestrator
        .run_scan(&config, &ScanRequest::new(dir.path().join("b.gsi")))
        .await
        .unwrap();
    assert!(result.descriptor.is_some());
    task.abort();
}

#[tokio::test]
async fn test_generic_command_is_one_way() {
    let dir = tempfile::tempdir().unwrap();
    let (head, task, settings) = setup(dir.path(), Duration::ZERO).await;
    let mut orchestrator = AcquisitionOrchestrator::new(settings);

    let report = orchestrator
        .execute(Operation::Command("CloseShutter".to_string()))
        .await;
    assert!(report.success, "{}", report.message);
    assert!(report.artifact.is_none());

    let received = received_eventually(&head, 1).await;
    assert_eq!(received[0].function, ScanFunction::GenericCommand);
    assert_eq!(received[0].get("specificcommand"), Some("CloseShutter"));
    assert_eq!(received[0].get("currentcommand"), Some("CloseShutter"));
    task.abort();
}

#[tokio::test]
async fn test_photometry_test_reports_channel_means() {
    let dir = tempfile::tempdir().unwrap();
    let (_head, task, settings) = setup(dir.path(), Duration::ZERO).await;
    let mut orchestrator = AcquisitionOrchestrator::new(settings);

    let report = orchestrator
        .execute(Operation::TestPhotometry {
            config: PhotometryConfiguration::default().at(1.0, 0.0),
        })
        .await;
    assert!(report.success, "{}", report.message);
    assert!(report
        .artifact
        .unwrap()
        .ends_with(raster_daq::orchestrator::TEST_PHOTOMETRY_FILE));
    let means = report.means.unwrap();
    assert!((means.a - 100.0).abs() < 0.5, "mean A {}", means.a);
    assert!(means.b.abs() < 0.5, "mean B {}", means.b);
    task.abort();
}

#[tokio::test]
async fn test_slow_controller_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let (_head, task, mut settings) = setup(dir.path(), Duration::from_secs(3)).await;
    settings.system.receive_grace_secs = 0.2;
    let mut orchestrator = AcquisitionOrchestrator::new(settings);
    let config = small_scan();

    let start = Instant::now();
    let err = orchestrator
        .run_scan(&config, &ScanRequest::new(dir.path().join("late.gsi")))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();
    assert!(
        matches!(err, DaqError::Timeout { operation: "accept", .. }),
        "{}",
        err
    );
    assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    assert_eq!(orchestrator.state(), AcquisitionState::Failed);
    assert!(!orchestrator.is_cached(&config));
    assert!(orchestrator.est_sec_per_frame().is_none());
    assert!(!dir.path().join("late.gsi").exists());
    task.abort();
}
