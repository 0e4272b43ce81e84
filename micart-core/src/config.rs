// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML runtime configuration with strict validation.
//!
//! Every key is optional. A missing file means "all defaults"; a present
//! but invalid file is a hard error before any container is touched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MicaError, MicaResult, ValidationError};

/// Default state root.
pub const DEFAULT_ROOT: &str = "/run/micart";
/// Default micad socket. micad serves control and creation on one path.
pub const DEFAULT_MICA_SOCKET: &str = "/tmp/mica/mica-create.socket";
/// Default config file consulted by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/micart/config.yaml";

/// Longest timeout accepted anywhere in the config.
const MAX_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const MIN_BUFFER: usize = 64;
const MAX_BUFFER: usize = 64 * 1024;

/// Raw daemon section as parsed from YAML.
#[derive(Debug, Deserialize)]
struct RawDaemonConfig {
    #[serde(default = "default_socket")]
    control_socket: String,
    #[serde(default = "default_socket")]
    create_socket: String,
    #[serde(default = "default_timeout_ms")]
    control_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    create_timeout_ms: u64,
    #[serde(default = "default_control_buffer")]
    control_buffer_size: usize,
    #[serde(default = "default_create_buffer")]
    create_buffer_size: usize,
}

fn default_socket() -> String {
    DEFAULT_MICA_SOCKET.to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_control_buffer() -> usize {
    1024
}

fn default_create_buffer() -> usize {
    512
}

impl Default for RawDaemonConfig {
    fn default() -> Self {
        Self {
            control_socket: default_socket(),
            create_socket: default_socket(),
            control_timeout_ms: default_timeout_ms(),
            create_timeout_ms: default_timeout_ms(),
            control_buffer_size: default_control_buffer(),
            create_buffer_size: default_create_buffer(),
        }
    }
}

/// Raw force-delete section.
#[derive(Debug, Deserialize)]
struct RawForceDeleteConfig {
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    100
}

impl Default for RawForceDeleteConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Raw readiness-notify section.
#[derive(Debug, Deserialize)]
struct RawNotifyConfig {
    #[serde(default = "default_wait_timeout_ms")]
    wait_timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    30_000
}

impl Default for RawNotifyConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    daemon: RawDaemonConfig,
    #[serde(default)]
    force_delete: RawForceDeleteConfig,
    #[serde(default)]
    notify: RawNotifyConfig,
}

/// Validated micad connection settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub control_socket: PathBuf,
    pub create_socket: PathBuf,
    pub control_timeout: Duration,
    pub create_timeout: Duration,
    pub control_buffer_size: usize,
    pub create_buffer_size: usize,
}

/// Validated liveness-poll settings for forced deletion.
#[derive(Debug, Clone, Copy)]
pub struct ForceDeleteConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

/// Validated readiness relay settings.
#[derive(Debug, Clone, Copy)]
pub struct NotifyConfig {
    /// Upper bound on the post-barrier wait.
    pub wait_timeout: Duration,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub root: PathBuf,
    pub daemon: DaemonConfig,
    pub force_delete: ForceDeleteConfig,
    pub notify: NotifyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // The built-in defaults always pass validation.
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            daemon: DaemonConfig {
                control_socket: PathBuf::from(DEFAULT_MICA_SOCKET),
                create_socket: PathBuf::from(DEFAULT_MICA_SOCKET),
                control_timeout: Duration::from_millis(default_timeout_ms()),
                create_timeout: Duration::from_millis(default_timeout_ms()),
                control_buffer_size: default_control_buffer(),
                create_buffer_size: default_create_buffer(),
            },
            force_delete: ForceDeleteConfig {
                poll_interval: Duration::from_millis(default_poll_interval_ms()),
                max_attempts: default_max_attempts(),
            },
            notify: NotifyConfig {
                wait_timeout: Duration::from_millis(default_wait_timeout_ms()),
            },
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> MicaResult<RuntimeConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MicaError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| MicaError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Like `load_file`, but a missing file yields the defaults.
    pub fn load_file_or_default(path: impl AsRef<Path>) -> MicaResult<RuntimeConfig> {
        match Self::load_file(path) {
            Err(MicaError::ConfigNotFound { path }) => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(RuntimeConfig::default())
            }
            other => other,
        }
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> MicaResult<RuntimeConfig> {
        // An empty document is valid and means "all defaults".
        if content.trim().is_empty() {
            return Self::validate(RawConfig::default());
        }

        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| MicaError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> MicaResult<RuntimeConfig> {
        let root = match raw.root {
            Some(root) => Self::validate_root(&root)?,
            None => PathBuf::from(DEFAULT_ROOT),
        };

        Ok(RuntimeConfig {
            root,
            daemon: Self::validate_daemon(raw.daemon)?,
            force_delete: Self::validate_force_delete(raw.force_delete)?,
            notify: NotifyConfig {
                wait_timeout: Self::timeout("notify.wait_timeout_ms", raw.notify.wait_timeout_ms)?,
            },
        })
    }

    /// The state root must be a real directory below `/`.
    pub fn validate_root(root: &str) -> Result<PathBuf, ValidationError> {
        let trimmed = root.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ValidationError::InvalidRoot);
        }
        Ok(PathBuf::from(trimmed))
    }

    fn validate_daemon(raw: RawDaemonConfig) -> MicaResult<DaemonConfig> {
        for (field, value) in [
            ("daemon.control_socket", &raw.control_socket),
            ("daemon.create_socket", &raw.create_socket),
        ] {
            if value.is_empty() {
                return Err(ValidationError::MissingRequiredField {
                    field,
                    context: "daemon".to_string(),
                }
                .into());
            }
        }

        Ok(DaemonConfig {
            control_socket: PathBuf::from(raw.control_socket),
            create_socket: PathBuf::from(raw.create_socket),
            control_timeout: Self::timeout("daemon.control_timeout_ms", raw.control_timeout_ms)?,
            create_timeout: Self::timeout("daemon.create_timeout_ms", raw.create_timeout_ms)?,
            control_buffer_size: Self::buffer(
                "daemon.control_buffer_size",
                raw.control_buffer_size,
            )?,
            create_buffer_size: Self::buffer("daemon.create_buffer_size", raw.create_buffer_size)?,
        })
    }

    fn validate_force_delete(raw: RawForceDeleteConfig) -> MicaResult<ForceDeleteConfig> {
        if raw.max_attempts == 0 || raw.max_attempts > 10_000 {
            return Err(ValidationError::InvalidFieldValue {
                field: "force_delete.max_attempts",
                value: raw.max_attempts.to_string(),
                reason: "Must be between 1 and 10000".to_string(),
            }
            .into());
        }

        Ok(ForceDeleteConfig {
            poll_interval: Self::timeout("force_delete.poll_interval_ms", raw.poll_interval_ms)?,
            max_attempts: raw.max_attempts,
        })
    }

    fn timeout(field: &'static str, ms: u64) -> Result<Duration, ValidationError> {
        if ms == 0 || ms > MAX_TIMEOUT_MS {
            return Err(ValidationError::InvalidFieldValue {
                field,
                value: ms.to_string(),
                reason: format!("Must be between 1 and {} ms", MAX_TIMEOUT_MS),
            });
        }
        Ok(Duration::from_millis(ms))
    }

    fn buffer(field: &'static str, size: usize) -> Result<usize, ValidationError> {
        if !(MIN_BUFFER..=MAX_BUFFER).contains(&size) {
            return Err(ValidationError::InvalidFieldValue {
                field,
                value: size.to_string(),
                reason: format!("Must be between {} and {} bytes", MIN_BUFFER, MAX_BUFFER),
            });
        }
        Ok(size)
    }
}
