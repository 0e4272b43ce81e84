// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container entity and lifecycle operations.
//!
//! Every public method takes the container's single lock for its whole
//! duration, including the one micad round trip it makes. The in-memory
//! variant only advances after the daemon answered and the new record hit
//! disk.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid};
use serde::Serialize;

use crate::bundle::{MicaAnnotations, Spec};
use crate::config::ForceDeleteConfig;
use crate::daemon::{ControlCommand, DaemonClient, DaemonReply};
use crate::error::{MicaError, MicaResult};
use crate::state::{ContainerState, ContainerStateMachine, OciStatus, StateMachineMetrics};
use crate::store::{StateRecord, StateStore, STATE_VERSION};
use crate::types::{ContainerId, ProcessId};

/// Name of the exec FIFO inside the state directory.
pub const EXEC_FIFO_FILENAME: &str = "exec.fifo";

const EXEC_FIFO_MODE: u32 = 0o622;

/// OCI runtime state document, as printed by `state`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: String,
    pub id: ContainerId,
    pub status: OciStatus,
    pub pid: u32,
    pub bundle: PathBuf,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug)]
struct ContainerInner {
    machine: ContainerStateMachine,
    spec: Spec,
    bundle: PathBuf,
    init_pid: Option<ProcessId>,
    created: Option<DateTime<Utc>>,
}

impl ContainerInner {
    fn attached(&self) -> bool {
        self.init_pid.is_some()
    }

    /// Project the container as it would look in `variant`.
    fn record_as(&self, id: &ContainerId, variant: ContainerState) -> StateRecord {
        let init_pid = if variant.accepts_init() {
            self.init_pid
        } else {
            None
        };
        StateRecord {
            version: STATE_VERSION.to_string(),
            id: id.clone(),
            status: variant.status(),
            lifecycle: Some(variant),
            pid: ProcessId::raw(init_pid),
            bundle: self.bundle.clone(),
            annotations: self.spec.annotations.clone(),
            created: self.created,
        }
    }
}

/// A container driven through micad.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    store: StateStore,
    client: DaemonClient,
    span: tracing::Span,
    inner: Mutex<ContainerInner>,
}

impl Container {
    /// Allocate `<root>/<id>` and write the first record. Initial variant
    /// is `Created`.
    pub fn create(
        store: StateStore,
        client: DaemonClient,
        id: ContainerId,
        bundle: impl Into<PathBuf>,
        spec: Spec,
    ) -> MicaResult<Self> {
        let span = tracing::info_span!("container", container_id = %id);
        let _enter = span.enter();

        store.allocate(&id)?;

        let inner = ContainerInner {
            machine: ContainerStateMachine::new(id.clone(), ContainerState::Created),
            spec,
            bundle: bundle.into(),
            init_pid: None,
            created: Some(Utc::now()),
        };

        if let Err(e) = store.save(&inner.record_as(&id, ContainerState::Created)) {
            if let Err(cleanup) = store.remove(&id) {
                tracing::warn!(error = %cleanup, "Failed to clean up state directory");
            }
            return Err(e);
        }

        tracing::info!(bundle = %inner.bundle.display(), "Container created");
        drop(_enter);

        Ok(Self {
            id,
            store,
            client,
            span,
            inner: Mutex::new(inner),
        })
    }

    /// Rehydrate a container from its persisted record.
    ///
    /// The variant defaults to `Stopped`. It is only trusted when the record
    /// names a lifecycle variant whose status tag agrees with the persisted
    /// status, or when the status is `created`.
    pub fn load(store: StateStore, client: DaemonClient, id: ContainerId) -> MicaResult<Self> {
        let span = tracing::info_span!("container", container_id = %id);
        let _enter = span.enter();

        let record = store.load(&id)?;
        let variant = match record.lifecycle {
            Some(variant) if variant.status() == record.status => variant,
            _ if record.status == OciStatus::Created => ContainerState::Created,
            _ => ContainerState::Stopped,
        };

        let init_pid = if variant.accepts_init() {
            ProcessId::new(record.pid).ok()
        } else {
            None
        };

        let mut spec = match Spec::load(&record.bundle) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::debug!(error = %e, "Bundle spec unavailable, using persisted annotations");
                Spec::default()
            }
        };
        // The record is authoritative for annotations.
        spec.annotations = record.annotations;

        tracing::debug!(state = variant.name(), "Container loaded");
        drop(_enter);

        Ok(Self {
            id: id.clone(),
            store,
            client,
            span,
            inner: Mutex::new(ContainerInner {
                machine: ContainerStateMachine::new(id, variant),
                spec,
                bundle: record.bundle,
                init_pid,
                created: record.created,
            }),
        })
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// `<root>/<id>`.
    pub fn state_dir(&self) -> PathBuf {
        self.store.state_dir(&self.id)
    }

    /// Logging span every operation on this container runs in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    fn lock(&self) -> MutexGuard<'_, ContainerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Create the exec FIFO, send `start` and move to `Running`.
    pub fn start(&self) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        inner.machine.check(ContainerState::Running, inner.attached())?;
        self.create_exec_fifo()?;
        self.dispatch("start", ControlCommand::Start)?;
        self.advance(&mut inner, ContainerState::Running)
    }

    /// Ask micad to run the task in an already running guest.
    ///
    /// Legal from `Running` and `Restored`; a paused guest is refused.
    pub fn exec(&self) -> MicaResult<()> {
        let _enter = self.span.enter();
        let inner = self.lock();

        if !matches!(
            inner.machine.state(),
            ContainerState::Running | ContainerState::Restored
        ) {
            return Err(MicaError::NotRunning {
                id: self.id.clone(),
            });
        }
        self.dispatch("exec", ControlCommand::Exec)?;
        self.store.save(&inner.record_as(&self.id, inner.machine.state()))
    }

    /// Create-and-start in one daemon command.
    pub fn run(&self) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        inner.machine.check(ContainerState::Running, inner.attached())?;
        self.create_exec_fifo()?;
        self.dispatch("run", ControlCommand::Run)?;
        self.advance(&mut inner, ContainerState::Running)
    }

    pub fn stop(&self) -> MicaResult<()> {
        self.transition("stop", ControlCommand::Stop, ContainerState::Stopped)
    }

    pub fn pause(&self) -> MicaResult<()> {
        self.transition("pause", ControlCommand::Pause, ContainerState::Paused)
    }

    /// Resume a paused guest. Only legal from `Paused`.
    pub fn resume(&self) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        if inner.machine.state() != ContainerState::Paused {
            return Err(MicaError::NotPaused {
                id: self.id.clone(),
            });
        }
        inner.machine.check(ContainerState::Running, inner.attached())?;
        self.dispatch("resume", ControlCommand::Resume)?;
        self.advance(&mut inner, ContainerState::Running)
    }

    pub fn restore(&self) -> MicaResult<()> {
        self.transition("restore", ControlCommand::Restore, ContainerState::Restored)
    }

    /// Tear the guest down and remove the state directory.
    ///
    /// Refused while `Running`/`Paused` with an attached init process.
    pub fn destroy(&self) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();
        let attached = inner.attached();
        self.destroy_locked(&mut inner, attached)
    }

    /// Memory is only touched once `rm` and the directory removal succeeded.
    fn destroy_locked(&self, inner: &mut ContainerInner, init_attached: bool) -> MicaResult<()> {
        inner.machine.check_destroy(init_attached)?;

        let hooks = inner.spec.hooks();
        if !hooks.is_empty() {
            tracing::info!(
                poststop = hooks.poststop.len(),
                total = hooks.len(),
                "Lifecycle hooks are not executed"
            );
        }

        self.dispatch("destroy", ControlCommand::Remove(self.id.clone()))?;
        self.store.remove(&self.id)?;

        inner.init_pid = None;
        inner.machine.mark_destroyed();
        tracing::info!("Container destroyed");
        Ok(())
    }

    /// Send `kill <id> <signo>` through the control protocol.
    ///
    /// `None` sends the zero-signal liveness probe.
    pub fn signal(&self, signal: Option<Signal>) -> MicaResult<()> {
        let _enter = self.span.enter();
        let _inner = self.lock();
        self.dispatch("signal", ControlCommand::kill(&self.id, signal))
            .map(|_| ())
    }

    /// Kill, then poll with the liveness probe until it fails.
    ///
    /// The first failed probe destroys the container as if its init process
    /// were already detached. If that destroy fails the container keeps its
    /// variant and init pid. Running out of attempts is `InitStillRunning`
    /// and leaves the state directory in place.
    pub fn force_delete(&self, options: ForceDeleteConfig) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        if let Err(e) = self.dispatch("kill", ControlCommand::kill(&self.id, Some(Signal::SIGKILL))) {
            tracing::warn!(error = %e, "Kill request failed, probing anyway");
        }

        for attempt in 1..=options.max_attempts {
            std::thread::sleep(options.poll_interval);

            if let Err(e) = self.dispatch("probe", ControlCommand::kill(&self.id, None)) {
                tracing::debug!(attempt, error = %e, "Init gone");
                inner.machine.check(ContainerState::Stopped, false)?;
                return self.destroy_locked(&mut inner, false);
            }
        }

        tracing::error!(attempts = options.max_attempts, "Container init still running");
        Err(MicaError::InitStillRunning {
            id: self.id.clone(),
            attempts: options.max_attempts,
        })
    }

    /// Send the creation record built from the reserved annotations.
    ///
    /// A `MICA-FAILED` verdict is returned as a reply, not an error; the
    /// caller decides what to do with the guest.
    pub fn allocate_guest(&self) -> MicaResult<DaemonReply> {
        let _enter = self.span.enter();
        let inner = self.lock();

        let annotations = MicaAnnotations::from_spec(&inner.spec)?;
        let message = annotations.create_message(&self.id);
        tracing::debug!(
            client_os = annotations.client_os.as_deref().unwrap_or("unknown"),
            task = annotations.task_command_line().as_deref().unwrap_or(""),
            task_env = ?annotations.task_env,
            "Guest configuration"
        );

        let reply = self
            .client
            .send_create(&message)
            .map_err(|source| MicaError::Daemon {
                id: self.id.clone(),
                action: "allocate",
                source,
            })?;

        if !reply.advisory().is_empty() {
            tracing::info!(advisory = reply.advisory(), "micad output");
        }
        if reply.is_success() {
            tracing::info!(cpu = message.cpu, name = %message.name, "Guest allocated");
        } else {
            tracing::error!(name = %message.name, "micad refused guest allocation");
        }
        Ok(reply)
    }

    /// Record the observed init process. Only legal while the guest runs.
    pub fn attach_init(&self, pid: ProcessId) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        let state = inner.machine.state();
        if !state.accepts_init() {
            return Err(MicaError::NotRunning {
                id: self.id.clone(),
            });
        }

        let previous = inner.init_pid.replace(pid);
        if let Err(e) = self.store.save(&inner.record_as(&self.id, state)) {
            inner.init_pid = previous;
            return Err(e);
        }
        tracing::debug!(pid = pid.value(), "Init process attached");
        Ok(())
    }

    /// Forget the init process.
    pub fn detach_init(&self) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        let previous = inner.init_pid.take();
        if let Err(e) = self.store.save(&inner.record_as(&self.id, inner.machine.state())) {
            inner.init_pid = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Replace the bundle spec of a live container and re-persist.
    pub fn set(&self, spec: Spec) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        if inner.machine.state().status() == OciStatus::Stopped {
            return Err(MicaError::NotRunning {
                id: self.id.clone(),
            });
        }

        let previous = std::mem::replace(&mut inner.spec, spec);
        if let Err(e) = self.store.save(&inner.record_as(&self.id, inner.machine.state())) {
            inner.spec = previous;
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Queries (no daemon round trip)
    // =========================================================================

    /// Active lifecycle variant.
    pub fn lifecycle(&self) -> ContainerState {
        self.lock().machine.state()
    }

    /// Externally visible status tag.
    pub fn status(&self) -> OciStatus {
        self.lock().machine.state().status()
    }

    pub fn init_pid(&self) -> Option<ProcessId> {
        self.lock().init_pid
    }

    pub fn bundle(&self) -> PathBuf {
        self.lock().bundle.clone()
    }

    pub fn spec(&self) -> Spec {
        self.lock().spec.clone()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.lock().created
    }

    /// Snapshot in the persisted-record shape.
    pub fn state(&self) -> StateRecord {
        let inner = self.lock();
        inner.record_as(&self.id, inner.machine.state())
    }

    /// Snapshot in the OCI runtime state shape.
    pub fn oci_state(&self) -> OciState {
        let inner = self.lock();
        OciState {
            oci_version: STATE_VERSION.to_string(),
            id: self.id.clone(),
            status: inner.machine.state().status(),
            pid: ProcessId::raw(inner.init_pid),
            bundle: inner.bundle.clone(),
            annotations: inner.spec.annotations.clone(),
        }
    }

    pub fn metrics(&self) -> StateMachineMetrics {
        StateMachineMetrics::from(&self.lock().machine)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Check, dispatch, persist, then advance.
    fn transition(
        &self,
        action: &'static str,
        command: ControlCommand,
        target: ContainerState,
    ) -> MicaResult<()> {
        let _enter = self.span.enter();
        let mut inner = self.lock();

        inner.machine.check(target, inner.attached())?;
        self.dispatch(action, command)?;
        self.advance(&mut inner, target)
    }

    /// Persist the record for `target`, then apply the transition.
    fn advance(&self, inner: &mut ContainerInner, target: ContainerState) -> MicaResult<()> {
        self.store.save(&inner.record_as(&self.id, target))?;
        let attached = inner.attached();
        inner.machine.transition_to(target, attached)?;
        tracing::info!(state = target.name(), "Container {}", target.status());
        Ok(())
    }

    /// One control round trip. Empty replies are soft failures.
    fn dispatch(&self, action: &'static str, command: ControlCommand) -> MicaResult<String> {
        let reply = self
            .client
            .send_command(&command)
            .map_err(|source| MicaError::Daemon {
                id: self.id.clone(),
                action,
                source,
            })?;

        if reply.is_empty() {
            tracing::warn!(action, command = %command, "Empty response from micad");
            return Err(MicaError::EmptyResponse {
                id: self.id.clone(),
                action,
            });
        }

        tracing::debug!(action, response = %reply.trim_end(), "micad accepted command");
        Ok(reply)
    }

    /// (Re)create `<stateDir>/exec.fifo` owned by the host root identity.
    fn create_exec_fifo(&self) -> MicaResult<PathBuf> {
        let path = exec_fifo_path(&self.state_dir());

        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(MicaError::Io {
                    context: "removing stale exec fifo",
                    source: e,
                })
            }
        }

        nix::unistd::mkfifo(&path, Mode::from_bits_truncate(EXEC_FIFO_MODE)).map_err(|e| {
            MicaError::Syscall {
                syscall: "mkfifo",
                message: e.to_string(),
            }
        })?;

        // mkfifo is subject to the umask.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(EXEC_FIFO_MODE))
            .map_err(|e| MicaError::Io {
                context: "chmod exec fifo",
                source: e,
            })?;

        let (uid, gid) = host_root_identity();
        nix::unistd::chown(&path, Some(uid), Some(gid)).map_err(|e| MicaError::Syscall {
            syscall: "chown",
            message: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "Exec fifo created");
        Ok(path)
    }
}

/// Owner of runtime-created files. No user namespace remapping is done:
/// root stays root, and a rootless runtime keeps its own identity.
pub fn host_root_identity() -> (Uid, Gid) {
    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        (Uid::from_raw(0), Gid::from_raw(0))
    } else {
        (euid, nix::unistd::getegid())
    }
}

/// Path of a container's exec FIFO under `state_dir`.
pub fn exec_fifo_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EXEC_FIFO_FILENAME)
}
