//! Mock Hardware Controller
//!
//! Simulated scan head for testing the acquisition exchange without a real controller.
//! It speaks the same protocol: accepts one command archive per connection, caches the
//! last descriptor and waveforms it received, and for data-returning commands connects
//! back to the return address named in `Cmd.txt` with a `.gsi` archive.
//!
//! # Simulated Detector
//!
//! Every ADC reads the fast-axis drive delayed by the descriptor's `lagpixels`, at
//! [`COUNTS_PER_VOLT`] counts per volt, with [`FRAME_DRIFT_SAMPLES`] padding samples after
//! each frame. Test photometry returns the X drive on ADC0 and the Y drive on ADC1.
//!
//! All waiting uses `tokio::time::sleep`, never `std::thread::sleep`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::data::decoder::{ScanGeometry, FRAME_DRIFT_SAMPLES};
use crate::error::{AppResult, DaqError};
use crate::protocol::archive::{
    adc_file_name, bundle, channel_index, ArchiveEntry, ArchiveReader, SCAN_POINTS_X,
    SCAN_POINTS_Y,
};
use crate::protocol::manifest::Manifest;
use crate::protocol::{ScanFunction, COMMAND_FILE};

/// ADC counts per volt of drive signal.
pub const COUNTS_PER_VOLT: f64 = 100.0;

/// One command archive as the mock received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    /// Parsed `doscanfunction`
    pub function: ScanFunction,
    /// Contents of `Cmd.txt`
    pub command: Manifest,
    /// Names of every file in the archive
    pub files: Vec<String>,
}

impl ReceivedCommand {
    /// Interface key from `Cmd.txt`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.command
            .sections()
            .iter()
            .find_map(|section| section.get(key))
    }
}

#[derive(Debug, Default)]
struct HeadState {
    descriptor: Option<(String, Manifest)>,
    x: Vec<f64>,
    y: Vec<f64>,
    received: Vec<ReceivedCommand>,
}

// =============================================================================
// MockScanHead - Simulated Hardware Controller
// =============================================================================

/// Mock scan head listening for command archives
///
/// # Example
///
/// ```rust,ignore
/// let head = Arc::new(MockScanHead::bind("127.0.0.1:0".parse()?).await?);
/// let task = head.clone().spawn();
/// // point SystemConfig::hardware_adc_port at head.local_addr().port()
/// ```
#[derive(Debug)]
pub struct MockScanHead {
    listener: TcpListener,
    address: SocketAddr,
    state: Arc<RwLock<HeadState>>,
    frame_time: Duration,
}

impl MockScanHead {
    /// Bind the command port.
    pub async fn bind(address: SocketAddr) -> AppResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| DaqError::Transport {
                operation: "bind",
                address,
                source,
            })?;
        let address = listener.local_addr()?;
        info!(%address, "mock scan head listening");
        Ok(Self {
            listener,
            address,
            state: Arc::new(RwLock::new(HeadState::default())),
            frame_time: Duration::ZERO,
        })
    }

    /// Simulated acquisition time per frame before data is returned.
    pub fn with_frame_time(mut self, frame_time: Duration) -> Self {
        self.frame_time = frame_time;
        self
    }

    /// Bound command address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Every command received so far, oldest first.
    pub async fn received(&self) -> Vec<ReceivedCommand> {
        self.state.read().await.received.clone()
    }

    /// Name and contents of the cached descriptor.
    pub async fn cached_descriptor(&self) -> Option<(String, Manifest)> {
        self.state.read().await.descriptor.clone()
    }

    /// Accept and handle one command connection.
    pub async fn serve_one(&self) -> AppResult<ReceivedCommand> {
        let (mut stream, peer) = self.listener.accept().await?;
        let mut payload = Vec::new();
        stream.read_to_end(&mut payload).await?;
        debug!(%peer, bytes = payload.len(), "mock scan head received archive");

        let mut archive = ArchiveReader::from_bytes(payload)?;
        let command = archive.read_manifest(COMMAND_FILE)?;
        let function = command
            .get("commands", "doscanfunction")
            .and_then(ScanFunction::parse)
            .ok_or_else(|| DaqError::Protocol("missing or unknown doscanfunction".to_string()))?;
        let received = ReceivedCommand {
            function,
            command,
            files: archive.names(),
        };

        if let Some(name) = received.get("imagedesc") {
            if archive.contains(name) {
                let descriptor = archive.read_manifest(name)?;
                let x = archive.read_samples(SCAN_POINTS_X)?.into_f64(SCAN_POINTS_X)?;
                let y = archive.read_samples(SCAN_POINTS_Y)?.into_f64(SCAN_POINTS_Y)?;
                let mut state = self.state.write().await;
                state.descriptor = Some((name.to_string(), descriptor));
                state.x = x;
                state.y = y;
            }
        }

        self.state.write().await.received.push(received.clone());

        match function {
            ScanFunction::RunScanner => self.return_scan(&received).await?,
            ScanFunction::TestPhotometry => self.return_photometry(&received).await?,
            ScanFunction::GenericCommand | ScanFunction::ArmPhotometry => {
                info!(function = %function, "mock scan head acknowledged command");
            }
        }
        Ok(received)
    }

    /// Serve connections until the task is aborted.
    pub async fn run(&self) {
        loop {
            if let Err(err) = self.serve_one().await {
                warn!(error = %err, "mock scan head failed to handle command");
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn return_scan(&self, received: &ReceivedCommand) -> AppResult<()> {
        let state = self.state.read().await;
        let (name, descriptor) = state
            .descriptor
            .clone()
            .ok_or_else(|| DaqError::Protocol("no cached scan descriptor".to_string()))?;
        let frames: usize = received
            .get("numframes")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1);

        let mut params = descriptor.flatten();
        params.insert("numframes".to_string(), frames.to_string());
        let geometry = ScanGeometry::from_parameters(&params)?;
        let mut raw = vec![0i16; geometry.lag_pixels.max(0) as usize];
        for _ in 0..frames {
            raw.extend(state.x.iter().map(|v| counts(*v)));
            raw.extend(std::iter::repeat(0).take(FRAME_DRIFT_SAMPLES));
        }
        drop(state);

        let mut entries = vec![
            ArchiveEntry::manifest(COMMAND_FILE, &received.command),
            ArchiveEntry::manifest(name, &descriptor),
        ];
        let letters = params.get("adcchanletters").cloned().unwrap_or_default();
        for index in letters.chars().filter_map(channel_index) {
            entries.push(ArchiveEntry::int16(adc_file_name(index), &raw));
        }

        sleep(self.frame_time * frames as u32).await;
        self.deliver(received, &bundle(&entries)?).await
    }

    async fn return_photometry(&self, received: &ReceivedCommand) -> AppResult<()> {
        let state = self.state.read().await;
        let a: Vec<i16> = state.x.iter().map(|v| counts(*v)).collect();
        let b: Vec<i16> = state.y.iter().map(|v| counts(*v)).collect();
        drop(state);

        let entries = vec![
            ArchiveEntry::int16(adc_file_name(0), &a),
            ArchiveEntry::int16(adc_file_name(1), &b),
        ];
        self.deliver(received, &bundle(&entries)?).await
    }

    /// Connect back to the return address from `Cmd.txt` and stream `payload`.
    async fn deliver(&self, received: &ReceivedCommand, payload: &[u8]) -> AppResult<()> {
        let ip = received.get("returnipaddress").unwrap_or("127.0.0.1");
        let port = received.get("returnport").unwrap_or("0");
        let address: SocketAddr = format!("{}:{}", ip.trim(), port.trim())
            .parse()
            .map_err(|_| DaqError::Protocol(format!("bad return address {}:{}", ip, port)))?;
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|source| DaqError::Transport {
                operation: "connect",
                address,
                source,
            })?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        info!(%address, bytes = payload.len(), "mock scan head returned data");
        Ok(())
    }
}

fn counts(volts: f64) -> i16 {
    (volts * COUNTS_PER_VOLT).round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::AcquisitionClient;
    use crate::protocol::manifest::Section;

    #[tokio::test]
    async fn test_generic_command_is_recorded() {
        let head = Arc::new(MockScanHead::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let client = AcquisitionClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let command = Manifest::new().with_section(
            Section::new("Commands")
                .with("doscanfunction", "genericCommand")
                .with("specificcommand", "CloseShutter"),
        );
        let served = tokio::spawn({
            let head = head.clone();
            async move { head.serve_one().await }
        });
        client.send(&[], &command, head.local_addr()).await.unwrap();
        let received = served.await.unwrap().unwrap();
        assert_eq!(received.function, ScanFunction::GenericCommand);
        assert_eq!(received.get("specificcommand"), Some("CloseShutter"));
        assert_eq!(received.files, vec![COMMAND_FILE.to_string()]);
        assert_eq!(head.received().await.len(), 1);
        assert!(head.cached_descriptor().await.is_none());
    }

    #[tokio::test]
    async fn test_scan_without_descriptor_is_rejected() {
        let head = Arc::new(MockScanHead::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let client = AcquisitionClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let command = Manifest::new().with_section(
            Section::new("Commands")
                .with("doscanfunction", "runScanner")
                .with("numframes", 1),
        );
        let served = tokio::spawn({
            let head = head.clone();
            async move { head.serve_one().await }
        });
        client.send(&[], &command, head.local_addr()).await.unwrap();
        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
    }

    #[test]
    fn test_counts() {
        assert_eq!(counts(1.0), 100);
        assert_eq!(counts(-0.126), -13);
    }
}
