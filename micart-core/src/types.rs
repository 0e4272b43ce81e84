// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Every type checks its invariants at construction so the rest of the
//! crate never sees an id that could escape the state root.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Longest container id accepted.
const MAX_CONTAINER_ID_LEN: usize = 1024;

/// Validated container identifier.
///
/// Allowed characters are `0-9 A-Z a-z _ + - .`. The ids `.` and `..` are
/// rejected because `root/<id>` must always name a child of `root`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a new ContainerId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(ValidationError::InvalidContainerId {
                id,
                reason: "container id cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_CONTAINER_ID_LEN {
            let reason = format!(
                "container id too long: {} chars (max {})",
                id.len(),
                MAX_CONTAINER_ID_LEN
            );
            return Err(ValidationError::InvalidContainerId { id, reason });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '.'))
        {
            return Err(ValidationError::InvalidContainerId {
                id,
                reason: "only 0-9 A-Z a-z _ + - . are allowed".to_string(),
            });
        }

        if id == "." || id == ".." {
            return Err(ValidationError::InvalidContainerId {
                id,
                reason: "container id must not be a relative path component".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Validated process ID of an attached init process.
/// Must be positive; "no process" is modelled as `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, ValidationError> {
        if pid == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pid",
                value: "0".to_string(),
                reason: "Process ID 0 means no attached process".to_string(),
            });
        }
        Ok(Self(pid))
    }

    /// Get the inner PID value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Wire form used by `state.json`, where 0 means none.
    pub fn raw(pid: Option<ProcessId>) -> u32 {
        pid.map_or(0, |p| p.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}
