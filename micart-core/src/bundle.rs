// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! OCI bundle specification subset.
//!
//! Only the parts of `config.json` this runtime reads are typed. Every
//! other key is carried through untouched so a spec written back out is
//! the spec that was read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::daemon::CreateMessage;
use crate::error::{MicaError, MicaResult, ValidationError};
use crate::types::ContainerId;

/// File name of the bundle specification.
pub const SPEC_CONFIG: &str = "config.json";

/// Annotation keys with this prefix configure the guest.
pub const MICA_ANNOTATION_PREFIX: &str = "org.openeuler.mica.";

/// OCI runtime spec version written by `Spec::example`.
pub const OCI_VERSION: &str = "1.0.2";

/// Bundle `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Hooks>,
    /// Keys this runtime does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// A single lifecycle hook entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_runtime: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create_container: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_container: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<Hook>,
}

impl Hooks {
    /// Total number of configured hooks across all phases.
    pub fn len(&self) -> usize {
        self.prestart.len()
            + self.create_runtime.len()
            + self.create_container.len()
            + self.start_container.len()
            + self.poststart.len()
            + self.poststop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Spec {
    /// Read `<bundle>/config.json`.
    pub fn load(bundle: impl AsRef<Path>) -> MicaResult<Self> {
        let path = bundle.as_ref().join(SPEC_CONFIG);

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MicaError::Spec {
                    message: format!("JSON specification file {} not found", path.display()),
                })
            }
            Err(e) => {
                return Err(MicaError::Io {
                    context: "reading bundle spec",
                    source: e,
                })
            }
        };

        let spec: Option<Spec> =
            serde_json::from_str(&content).map_err(|e| MicaError::Spec {
                message: format!("{}: {}", path.display(), e),
            })?;

        spec.ok_or_else(|| MicaError::Spec {
            message: "config cannot be null".to_string(),
        })
    }

    /// Write a fresh `config.json` into `bundle`, refusing to overwrite.
    pub fn write_new(&self, bundle: impl AsRef<Path>) -> MicaResult<PathBuf> {
        let path = bundle.as_ref().join(SPEC_CONFIG);
        if path.exists() {
            return Err(MicaError::Spec {
                message: format!("file {} exists. Remove it first", path.display()),
            });
        }

        let data = serde_json::to_vec_pretty(self).map_err(|e| MicaError::Spec {
            message: e.to_string(),
        })?;
        std::fs::write(&path, data).map_err(|e| MicaError::Io {
            context: "writing bundle spec",
            source: e,
        })?;
        Ok(path)
    }

    /// A minimal spec suitable as a starting point for a new bundle.
    pub fn example() -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            process: Some(Process {
                terminal: true,
                args: vec!["sh".to_string()],
                env: vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                        .to_string(),
                    "TERM=xterm".to_string(),
                ],
                cwd: "/".to_string(),
                extra: Default::default(),
            }),
            root: Some(Root {
                path: "rootfs".to_string(),
                readonly: true,
            }),
            hostname: Some("micart".to_string()),
            mounts: vec![
                Mount {
                    destination: "/proc".to_string(),
                    kind: Some("proc".to_string()),
                    source: Some("proc".to_string()),
                    options: Vec::new(),
                },
                Mount {
                    destination: "/dev".to_string(),
                    kind: Some("tmpfs".to_string()),
                    source: Some("tmpfs".to_string()),
                    options: vec![
                        "nosuid".to_string(),
                        "strictatime".to_string(),
                        "mode=755".to_string(),
                        "size=65536k".to_string(),
                    ],
                },
            ],
            annotations: BTreeMap::new(),
            hooks: None,
            extra: Default::default(),
        }
    }

    /// Configured hooks, empty if the bundle declares none.
    pub fn hooks(&self) -> Hooks {
        self.hooks.clone().unwrap_or_default()
    }
}

/// Guest configuration read from the reserved annotation namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicaAnnotations {
    pub cpu: Option<u32>,
    pub client_name: Option<String>,
    pub client_os: Option<String>,
    pub firmware: Option<String>,
    pub pedestal: Option<String>,
    pub pedestal_conf: Option<String>,
    pub debug: bool,
    pub task_path: Option<String>,
    /// `task.args`, split on whitespace.
    pub task_args: Vec<String>,
    /// `task.env`, comma separated `KEY=VALUE` pairs.
    pub task_env: Vec<String>,
}

impl MicaAnnotations {
    /// Collect the reserved keys from `annotations`. Unknown reserved keys
    /// are logged and ignored.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> MicaResult<Self> {
        let mut parsed = Self::default();

        for (key, value) in annotations {
            let Some(name) = key.strip_prefix(MICA_ANNOTATION_PREFIX) else {
                continue;
            };
            let owned = || Some(value.clone());

            match name {
                "cpu" => {
                    let cpu = value.trim().parse::<u32>().map_err(|_| {
                        ValidationError::InvalidFieldValue {
                            field: "annotation cpu",
                            value: value.clone(),
                            reason: "Must be an unsigned integer".to_string(),
                        }
                    })?;
                    parsed.cpu = Some(cpu);
                }
                "client-name" => parsed.client_name = owned(),
                "client-os" => parsed.client_os = owned(),
                "firmware" => parsed.firmware = owned(),
                "pedestal" => parsed.pedestal = owned(),
                "pedestal-conf" => parsed.pedestal_conf = owned(),
                "debug" => parsed.debug = parse_flag(value)?,
                "task.path" => parsed.task_path = owned(),
                "task.args" => {
                    parsed.task_args = value.split_whitespace().map(str::to_string).collect()
                }
                "task.env" => {
                    parsed.task_env = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                other => tracing::warn!(key = other, "Ignoring unknown mica annotation"),
            }
        }

        Ok(parsed)
    }

    pub fn from_spec(spec: &Spec) -> MicaResult<Self> {
        Self::from_annotations(&spec.annotations)
    }

    /// `task.path` followed by `task.args`, or `None` without a task path.
    pub fn task_command_line(&self) -> Option<String> {
        let path = self.task_path.as_deref()?;
        let mut line = path.to_string();
        for arg in &self.task_args {
            line.push(' ');
            line.push_str(arg);
        }
        Some(line)
    }

    /// Build the guest allocation request for container `id`.
    ///
    /// The client name defaults to the container id and the client path
    /// to the firmware, then the task path.
    pub fn create_message(&self, id: &ContainerId) -> CreateMessage {
        CreateMessage {
            cpu: self.cpu.unwrap_or(0),
            name: self
                .client_name
                .clone()
                .unwrap_or_else(|| id.to_string()),
            client_path: self
                .firmware
                .clone()
                .or_else(|| self.task_path.clone())
                .unwrap_or_default(),
            pedestal: self.pedestal.clone().unwrap_or_default(),
            pedestal_conf: self.pedestal_conf.clone().unwrap_or_default(),
            debug: self.debug,
        }
    }
}

fn parse_flag(value: &str) -> Result<bool, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ValidationError::InvalidFieldValue {
            field: "annotation debug",
            value: value.to_string(),
            reason: "Must be a boolean".to_string(),
        }),
    }
}
