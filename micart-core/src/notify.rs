//! sd_notify-style readiness relay.
//!
//! When a supervisor exported a readiness address, the runtime binds a
//! world-writable datagram socket under the container's state directory,
//! bind-mounts it into the bundle, and after a successful start tells the
//! supervisor `READY=1`, `MAINPID=<n>` and `BARRIER=1`.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixDatagram;

use crate::bundle::{Mount, Process, Spec};
use crate::container::Container;
use crate::error::{MicaResult, NotifyError};
use crate::registry::{NotifyPhase, NotifyRegistry};
use crate::types::ContainerId;

/// Environment variable naming the supervisor's readiness address.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Where the socket directory is mounted inside the guest bundle.
pub const NOTIFY_MOUNT_DIR: &str = "/run/notify";

const NOTIFY_SOCKET_NAME: &str = "notify.sock";
const NOTIFY_DIR_NAME: &str = "notify";

/// Datagram payloads written to the supervisor, in order.
pub const READY_MESSAGE: &[u8] = b"READY=1\n";
pub const BARRIER_MESSAGE: &[u8] = b"BARRIER=1\n";

/// Readiness relay for one container.
#[derive(Debug)]
pub struct ReadinessNotifier {
    container_id: ContainerId,
    /// Supervisor address; `None` turns every method into a no-op.
    host: Option<PathBuf>,
    socket_path: PathBuf,
    socket: Option<UnixDatagram>,
    registry: Arc<NotifyRegistry>,
    wait_timeout: Duration,
}

impl ReadinessNotifier {
    /// Relay for `<root>/<id>/notify/notify.sock`.
    pub fn new(
        root: &Path,
        container_id: ContainerId,
        host: Option<PathBuf>,
        registry: Arc<NotifyRegistry>,
        wait_timeout: Duration,
    ) -> Self {
        let socket_path = root
            .join(container_id.as_str())
            .join(NOTIFY_DIR_NAME)
            .join(NOTIFY_SOCKET_NAME);

        Self {
            container_id,
            host: host.filter(|h| !h.as_os_str().is_empty()),
            socket_path,
            socket: None,
            registry,
            wait_timeout,
        }
    }

    /// Relay configured from `$NOTIFY_SOCKET`.
    pub fn from_env(
        root: &Path,
        container_id: ContainerId,
        registry: Arc<NotifyRegistry>,
        wait_timeout: Duration,
    ) -> Self {
        let host = std::env::var_os(NOTIFY_SOCKET_ENV).map(PathBuf::from);
        Self::new(root, container_id, host, registry, wait_timeout)
    }

    pub fn is_enabled(&self) -> bool {
        self.host.is_some()
    }

    pub fn phase(&self) -> NotifyPhase {
        if self.host.is_none() {
            return NotifyPhase::Absent;
        }
        self.registry.phase(&self.container_id)
    }

    /// Host-side rendezvous socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Path of the rendezvous socket as seen from inside the guest.
    pub fn guest_socket_path() -> String {
        format!("{}/{}", NOTIFY_MOUNT_DIR, NOTIFY_SOCKET_NAME)
    }

    /// Bind-mount the socket directory and export `NOTIFY_SOCKET` in `spec`.
    pub fn setup_spec(&self, spec: &mut Spec) {
        if self.host.is_none() {
            return;
        }

        let source = self
            .socket_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        spec.mounts.push(Mount {
            destination: NOTIFY_MOUNT_DIR.to_string(),
            kind: None,
            source: Some(source),
            options: ["bind", "nosuid", "noexec", "nodev", "ro"]
                .iter()
                .map(|o| o.to_string())
                .collect(),
        });

        let env = format!("{}={}", NOTIFY_SOCKET_ENV, Self::guest_socket_path());
        spec.process
            .get_or_insert_with(Process::default)
            .env
            .push(env);
    }

    /// Create `<stateDir>/notify`. Safe to call more than once.
    pub fn setup_socket_directory(&self) -> MicaResult<()> {
        if self.host.is_none() {
            return Ok(());
        }

        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| NotifyError::Socket {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        self.registry.mark_configured(&self.container_id);
        Ok(())
    }

    /// Bind the rendezvous datagram socket, mode 0777.
    ///
    /// Fails with `AlreadyBound` if this container's socket was bound
    /// before in this process.
    pub fn bind_socket(&mut self) -> MicaResult<()> {
        if self.host.is_none() {
            return Ok(());
        }

        self.registry.claim_bind(&self.container_id)?;
        match self.bind_inner() {
            Ok(socket) => {
                self.socket = Some(socket);
                tracing::debug!(
                    container_id = %self.container_id,
                    path = %self.socket_path.display(),
                    phase = self.phase().name(),
                    "Notify socket bound"
                );
                Ok(())
            }
            Err(e) => {
                self.registry.release(&self.container_id);
                Err(e.into())
            }
        }
    }

    fn bind_inner(&self) -> Result<UnixDatagram, NotifyError> {
        let socket_error = |e| NotifyError::Socket {
            path: self.socket_path.clone(),
            source: e,
        };

        // A stale socket from a previous run would make bind fail.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(socket_error(e)),
        }

        let socket = UnixDatagram::bind(&self.socket_path).map_err(socket_error)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o777))
            .map_err(socket_error)?;
        Ok(socket)
    }

    /// Tell the supervisor the container is up, then wait.
    ///
    /// Writes `READY=1`, `MAINPID=<n>` and `BARRIER=1` as three datagrams.
    /// MAINPID is the attached init pid, or this process when none is
    /// attached. The wait ends when `shutdown` completes or the configured
    /// timeout elapses; datagrams the guest sends to the rendezvous socket
    /// meanwhile are forwarded to the supervisor.
    pub async fn wait_for_container<F>(&mut self, container: &Container, shutdown: F) -> MicaResult<()>
    where
        F: Future<Output = ()>,
    {
        let Some(host) = self.host.clone() else {
            return Ok(());
        };

        let state = container.oci_state();
        let main_pid = if state.pid != 0 {
            state.pid
        } else {
            std::process::id()
        };
        tracing::info!(
            container_id = %state.id,
            status = %state.status,
            main_pid,
            "Signalling readiness"
        );

        let client = UnixDatagram::unbound().map_err(|e| NotifyError::Socket {
            path: host.clone(),
            source: e,
        })?;
        client.connect(&host).map_err(|e| NotifyError::Socket {
            path: host.clone(),
            source: e,
        })?;

        let main_pid_line = format!("MAINPID={}\n", main_pid);
        for payload in [READY_MESSAGE, main_pid_line.as_bytes(), BARRIER_MESSAGE] {
            client.send(payload).await.map_err(|e| NotifyError::Socket {
                path: host.clone(),
                source: e,
            })?;
        }

        if self.socket.is_some() {
            self.registry.mark_signaled(&self.container_id)?;
        }

        self.relay_until(&client, shutdown).await;
        Ok(())
    }

    async fn relay_until<F>(&self, client: &UnixDatagram, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let deadline = tokio::time::sleep(self.wait_timeout);
        tokio::pin!(deadline);
        let mut buf = [0u8; 4096];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!(container_id = %self.container_id, "Readiness wait cancelled");
                    return;
                }
                _ = &mut deadline => {
                    tracing::debug!(container_id = %self.container_id, "Readiness wait timed out");
                    return;
                }
                received = recv_from(self.socket.as_ref(), &mut buf) => match received {
                    Ok(n) => {
                        if let Err(e) = client.send(&buf[..n]).await {
                            tracing::warn!(error = %e, "Failed to forward notify datagram");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Notify socket read failed");
                        return;
                    }
                },
            }
        }
    }
}

/// Receive from the rendezvous socket, or never resolve if none is bound.
async fn recv_from(socket: Option<&UnixDatagram>, buf: &mut [u8]) -> std::io::Result<usize> {
    match socket {
        Some(socket) => socket.recv(buf).await,
        None => std::future::pending().await,
    }
}

impl Drop for ReadinessNotifier {
    fn drop(&mut self) {
        if self.socket.take().is_some() {
            self.registry.release(&self.container_id);
        }
    }
}
