//! Unix-socket round trips to micad.
//!
//! Each call opens its own connection, writes the whole payload, reads the
//! reply under a deadline and drops the stream. There is no pooling: one
//! request is in flight per container action.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::DaemonConfig;
use crate::daemon::codec::{ControlCommand, CreateMessage, DaemonReply};
use crate::error::DaemonError;

/// Client for micad's control and creation sockets.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    control_socket: PathBuf,
    create_socket: PathBuf,
    control_timeout: Duration,
    create_timeout: Duration,
    control_buffer_size: usize,
    create_buffer_size: usize,
}

impl DaemonClient {
    /// Create a client from the daemon section of the runtime config.
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            control_socket: config.control_socket.clone(),
            create_socket: config.create_socket.clone(),
            control_timeout: config.control_timeout,
            create_timeout: config.create_timeout,
            control_buffer_size: config.control_buffer_size,
            create_buffer_size: config.create_buffer_size,
        }
    }

    /// Path of the control socket.
    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    /// Path of the creation socket.
    pub fn create_socket(&self) -> &Path {
        &self.create_socket
    }

    /// Send a control command and return micad's raw reply.
    ///
    /// An empty string means micad did not answer in time; callers treat
    /// that as a soft failure.
    pub fn send_command(&self, command: &ControlCommand) -> Result<String, DaemonError> {
        self.send(&self.control_socket, command.encode().as_bytes())
    }

    /// One control-protocol round trip on `path`.
    ///
    /// Reads at most one buffer. A read that times out (or reports EAGAIN)
    /// before any byte arrives yields `Ok("")`, not an error.
    pub fn send(&self, path: &Path, payload: &[u8]) -> Result<String, DaemonError> {
        tracing::debug!(
            socket = %path.display(),
            payload = %String::from_utf8_lossy(payload),
            "Sending to micad"
        );

        let mut stream = connect(path, self.control_timeout)?;
        stream.write_all(payload).map_err(|e| DaemonError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut buf = vec![0u8; self.control_buffer_size];
        let n = loop {
            match stream.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_no_data(&e) => {
                    tracing::debug!(socket = %path.display(), "No data from micad yet");
                    break 0;
                }
                Err(e) => {
                    return Err(DaemonError::Read {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        };

        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        tracing::info!(socket = %path.display(), response = %response, "Received response from micad");
        Ok(response)
    }

    /// Send the creation record and wait for a sentinel.
    ///
    /// Reads accumulate until `MICA-SUCCESS` or `MICA-FAILED` appears.
    /// A timeout or EOF without a sentinel is an error.
    pub fn send_create(&self, message: &CreateMessage) -> Result<DaemonReply, DaemonError> {
        let path = self.create_socket.as_path();
        tracing::debug!(
            socket = %path.display(),
            name = %message.name,
            cpu = message.cpu,
            "Sending create message to micad"
        );

        let mut stream = connect(path, self.create_timeout)?;
        stream
            .write_all(&message.pack())
            .map_err(|e| DaemonError::Write {
                path: path.to_path_buf(),
                source: e,
            })?;

        let deadline = Instant::now() + self.create_timeout;
        let mut buf = vec![0u8; self.create_buffer_size];
        let mut response = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DaemonError::Timeout {
                    path: path.to_path_buf(),
                });
            }
            stream
                .set_read_timeout(Some(remaining))
                .map_err(|e| DaemonError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })?;

            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buf[..n]);
                    if let Some(reply) = DaemonReply::scan(&response) {
                        tracing::info!(
                            socket = %path.display(),
                            success = reply.is_success(),
                            "micad answered create"
                        );
                        return Ok(reply);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_no_data(&e) => {
                    return Err(DaemonError::Timeout {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) => {
                    return Err(DaemonError::Read {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }

        Err(DaemonError::NoSentinel {
            response: String::from_utf8_lossy(&response).into_owned(),
        })
    }
}

/// Stat the path, require a socket, then dial it.
fn connect(path: &Path, read_timeout: Duration) -> Result<UnixStream, DaemonError> {
    let metadata = std::fs::metadata(path).map_err(|e| DaemonError::SocketNotFound {
        path: path.to_path_buf(),
        source: e,
    })?;

    if !metadata.file_type().is_socket() {
        return Err(DaemonError::NotASocket {
            path: path.to_path_buf(),
        });
    }

    let stream = UnixStream::connect(path).map_err(|e| DaemonError::Connect {
        path: path.to_path_buf(),
        source: e,
    })?;

    stream
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| DaemonError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;

    Ok(stream)
}

fn is_no_data(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        || e.raw_os_error() == Some(libc::EAGAIN)
}
