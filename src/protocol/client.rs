//! TCP request/response exchange with the remote hardware controller.
//!
//! Protocol Overview:
//! - Request: one zip archive (`Cmd.txt` plus optional descriptor and waveform files),
//!   written over a freshly opened connection to the controller, which is then closed.
//! - Response: the controller connects back to our return address and streams a single
//!   `.gsi` archive until it closes the connection.
//! - Timing: connect is bounded by a short timeout (LAN peer); accept is bounded by a
//!   deadline derived from the expected acquisition time; each read is bounded by an
//!   idle timeout.
//!
//! Nothing here retries. A failed exchange is reported and the caller decides.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SystemConfig;
use crate::error::{AppResult, DaqError};
use crate::protocol::archive::{bundle, ArchiveEntry};
use crate::protocol::manifest::Manifest;

/// Name of the command manifest inside every request archive.
pub const COMMAND_FILE: &str = "Cmd.txt";

/// Read buffer for the returned data stream.
const RETURN_BUFFER_BYTES: usize = 4096 * 2;

/// Client side of one command/response exchange.
#[derive(Debug, Clone)]
pub struct AcquisitionClient {
    connect_timeout: Duration,
    idle_read_timeout: Duration,
}

impl AcquisitionClient {
    /// Create a client with explicit timeouts.
    pub fn new(connect_timeout: Duration, idle_read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_read_timeout,
        }
    }

    /// Create a client from the installation settings.
    pub fn from_settings(system: &SystemConfig) -> Self {
        Self::new(system.connect_timeout(), system.idle_read_timeout())
    }

    /// Bundle the command manifest (as `Cmd.txt`) with the given files.
    pub fn package(&self, files: &[ArchiveEntry], command: &Manifest) -> AppResult<Vec<u8>> {
        let mut entries = Vec::with_capacity(files.len() + 1);
        entries.push(ArchiveEntry::manifest(COMMAND_FILE, command));
        entries.extend(files.iter().filter(|f| f.name != COMMAND_FILE).cloned());
        bundle(&entries)
    }

    /// Package and transmit a request. Returns the number of bytes sent.
    pub async fn send(
        &self,
        files: &[ArchiveEntry],
        command: &Manifest,
        hardware: SocketAddr,
    ) -> AppResult<usize> {
        let payload = self.package(files, command)?;
        self.send_payload(&payload, hardware).await?;
        Ok(payload.len())
    }

    /// Transmit an already packaged archive over a fresh connection, then close it.
    pub async fn send_payload(&self, payload: &[u8], hardware: SocketAddr) -> AppResult<()> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(hardware)).await {
            Err(_) => {
                warn!(%hardware, "hardware controller did not accept connection in time");
                return Err(DaqError::Timeout {
                    operation: "connect",
                    address: hardware,
                    waited: self.connect_timeout,
                });
            }
            Ok(Err(source)) => {
                warn!(%hardware, error = %source, "could not connect to hardware controller");
                return Err(DaqError::Transport {
                    operation: "connect",
                    address: hardware,
                    source,
                });
            }
            Ok(Ok(stream)) => stream,
        };
        debug!(%hardware, "hardware client connected");

        stream
            .write_all(payload)
            .await
            .map_err(|source| DaqError::Transport {
                operation: "send",
                address: hardware,
                source,
            })?;
        stream
            .shutdown()
            .await
            .map_err(|source| DaqError::Transport {
                operation: "close",
                address: hardware,
                source,
            })?;
        info!(%hardware, bytes = payload.len(), "command archive sent");
        Ok(())
    }

    /// Bind the return address ahead of sending, so a fast controller cannot connect
    /// before anyone is listening.
    pub async fn listen(&self, address: SocketAddr) -> AppResult<ResponseListener> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| DaqError::Transport {
                operation: "bind",
                address,
                source,
            })?;
        let local = listener.local_addr()?;
        debug!(address = %local, "listening for return of acquired data");
        Ok(ResponseListener {
            listener,
            address: local,
            idle_read_timeout: self.idle_read_timeout,
        })
    }

    /// Bind, accept one connection within `deadline` and stream it into `destination`.
    /// Returns the number of bytes written.
    pub async fn receive(
        &self,
        address: SocketAddr,
        destination: &Path,
        deadline: Duration,
    ) -> AppResult<u64> {
        self.listen(address)
            .await?
            .accept_into(destination, deadline)
            .await
    }
}

/// A bound return socket waiting for the controller to deliver data.
#[derive(Debug)]
pub struct ResponseListener {
    listener: TcpListener,
    address: SocketAddr,
    idle_read_timeout: Duration,
}

impl ResponseListener {
    /// The actual bound address (resolves port 0 to the ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Accept exactly one connection within `deadline` and copy everything it sends into
    /// `destination` until the peer closes. Consumes the listener.
    pub async fn accept_into(self, destination: &Path, deadline: Duration) -> AppResult<u64> {
        let (mut stream, peer) = match timeout(deadline, self.listener.accept()).await {
            Err(_) => {
                warn!(
                    address = %self.address,
                    waited = ?deadline,
                    "hardware controller did not respond with acquired data within max time allowed"
                );
                return Err(DaqError::Timeout {
                    operation: "accept",
                    address: self.address,
                    waited: deadline,
                });
            }
            Ok(Err(source)) => {
                return Err(DaqError::Transport {
                    operation: "accept",
                    address: self.address,
                    source,
                })
            }
            Ok(Ok(conn)) => conn,
        };
        debug!(%peer, "hardware controller connected");

        let mut file = File::create(destination).await?;
        let mut buf = vec![0u8; RETURN_BUFFER_BYTES];
        let mut total: u64 = 0;
        loop {
            let n = match timeout(self.idle_read_timeout, stream.read(&mut buf)).await {
                Err(_) => {
                    return Err(DaqError::Timeout {
                        operation: "receive",
                        address: peer,
                        waited: self.idle_read_timeout,
                    })
                }
                Ok(Err(source)) => {
                    return Err(DaqError::Transport {
                        operation: "receive",
                        address: peer,
                        source,
                    })
                }
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        file.flush().await?;
        info!(%peer, bytes = total, path = %destination.display(), "received acquired data");
        Ok(total)
    }
}
