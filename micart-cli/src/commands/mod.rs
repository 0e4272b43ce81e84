// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use micart_core::{
    ConfigLoader, Container, ContainerId, DaemonClient, MicaError, NotifyRegistry, OciStatus,
    ReadinessNotifier, RuntimeConfig, StateStore,
};
use thiserror::Error;

pub mod create;
pub mod delete;
pub mod kill;
pub mod list;
pub mod run;
pub mod simple;
pub mod spec;
pub mod start;
pub mod state;

/// Failures the CLI adds on top of the core's.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot start a container that is not created: {id} is {status}")]
    NotCreated { id: ContainerId, status: OciStatus },

    #[error("cannot delete container {id} that is not stopped: {status}")]
    NotStopped { id: ContainerId, status: OciStatus },

    #[error("micad failed to create guest for {id}: {advisory}")]
    AllocationFailed { id: ContainerId, advisory: String },

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] MicaError),
}

/// Everything a command needs: validated config, store, micad client.
pub struct RuntimeContext {
    pub config: RuntimeConfig,
    pub store: StateStore,
    pub client: DaemonClient,
    pub registry: Arc<NotifyRegistry>,
}

impl RuntimeContext {
    /// Load the config file (defaults if absent) and apply `--root`.
    pub fn new(root: Option<&Path>, config_path: &Path) -> Result<Self, CliError> {
        let mut config = ConfigLoader::load_file_or_default(config_path)?;
        if let Some(root) = root {
            config.root = ConfigLoader::validate_root(&root.to_string_lossy())
                .map_err(MicaError::from)?;
        }

        tracing::debug!(root = %config.root.display(), "Runtime context ready");

        Ok(Self {
            store: StateStore::new(config.root.clone()),
            client: DaemonClient::new(&config.daemon),
            registry: NotifyRegistry::new_shared(),
            config,
        })
    }

    pub fn container_id(id: &str) -> Result<ContainerId, CliError> {
        ContainerId::new(id).map_err(|e| CliError::Core(e.into()))
    }

    /// Load an existing container.
    pub fn load(&self, id: &str) -> Result<Container, CliError> {
        let id = Self::container_id(id)?;
        Ok(Container::load(
            self.store.clone(),
            self.client.clone(),
            id,
        )?)
    }

    /// Readiness relay driven by `$NOTIFY_SOCKET`.
    pub fn notifier(&self, id: &ContainerId) -> ReadinessNotifier {
        ReadinessNotifier::from_env(
            &self.config.root,
            id.clone(),
            self.registry.clone(),
            self.config.notify.wait_timeout,
        )
    }
}

/// Absolute form of a bundle path.
pub fn absolute_bundle(bundle: &Path) -> Result<PathBuf, CliError> {
    std::fs::canonicalize(bundle).map_err(|e| {
        CliError::Core(MicaError::Io {
            context: "resolving bundle path",
            source: e,
        })
    })
}

/// Write `pid` to `path` via a temp file and rename.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), CliError> {
    let pid_error = |source| CliError::PidFile {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".pid")
        .tempfile_in(dir)
        .map_err(pid_error)?;
    tmp.write_all(pid.to_string().as_bytes()).map_err(pid_error)?;
    tmp.persist(path).map_err(|e| pid_error(e.error))?;
    Ok(())
}

/// Resolves on Ctrl-C. Used to cut the readiness wait short.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
