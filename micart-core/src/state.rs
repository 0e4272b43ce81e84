// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container state machine with typed state transitions.
//!
//! Lifecycle variants: Created, Running, Paused, Stopped, Restored.
//! Legal edges:
//!
//! ```text
//!   Created  ──▶ Running | Paused | Stopped
//!   Running  ──▶ Paused  | Stopped*
//!   Paused   ──▶ Running | Stopped*
//!   Stopped  ──▶ Running | Restored
//!   Restored ──▶ Running | Stopped
//!
//!   * only while no init process is attached
//! ```
//!
//! Self-transitions are no-ops. Anything else is a StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::ContainerId;

/// Status vocabulary of the OCI runtime state document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OciStatus {
    Creating,
    Created,
    Running,
    Stopped,
}

impl OciStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for OciStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Container lifecycle variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Guest allocated, user task not started yet.
    Created,

    /// Guest is executing the task.
    Running,

    /// Guest execution suspended by micad.
    Paused,

    /// No guest activity; also the conservative variant after a reload.
    Stopped,

    /// Guest brought back from a checkpoint.
    Restored,
}

/// Why a transition or destroy was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The edge is not in the table.
    Illegal,
    /// The edge is legal but an init process is still attached.
    InitAttached,
}

impl ContainerState {
    /// Every variant, in declaration order.
    pub const ALL: [ContainerState; 5] = [
        Self::Created,
        Self::Running,
        Self::Paused,
        Self::Stopped,
        Self::Restored,
    ];

    /// Get the variant name for logs and error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Restored => "restored",
        }
    }

    /// Externally visible status tag. Paused and Restored have no OCI
    /// equivalent and report as running.
    pub const fn status(&self) -> OciStatus {
        match self {
            Self::Created => OciStatus::Created,
            Self::Running | Self::Paused | Self::Restored => OciStatus::Running,
            Self::Stopped => OciStatus::Stopped,
        }
    }

    /// Decide whether moving to `target` is legal.
    ///
    /// Pure: returns the variant that should become active, never mutates.
    pub fn check_transition(
        self,
        target: ContainerState,
        init_attached: bool,
    ) -> Result<ContainerState, Refusal> {
        use ContainerState::*;

        match (self, target) {
            (from, to) if from == to => Ok(to),
            // From Created
            (Created, Running | Paused | Stopped) => Ok(target),
            // From Running / Paused
            (Running | Paused, Stopped) if init_attached => Err(Refusal::InitAttached),
            (Running, Paused | Stopped) => Ok(target),
            (Paused, Running | Stopped) => Ok(target),
            // From Stopped
            (Stopped, Running | Restored) => Ok(target),
            // From Restored
            (Restored, Running | Stopped) => Ok(target),
            _ => Err(Refusal::Illegal),
        }
    }

    /// Decide whether the container may be destroyed in this variant.
    pub fn check_destroy(self, init_attached: bool) -> Result<(), Refusal> {
        match self {
            Self::Created | Self::Stopped | Self::Restored => Ok(()),
            Self::Running | Self::Paused if init_attached => Err(Refusal::InitAttached),
            Self::Running | Self::Paused => Ok(()),
        }
    }

    /// Whether an init process may be attached in this variant.
    pub fn accepts_init(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one container's lifecycle.
/// Enforces the transition table and tracks timing metrics.
#[derive(Debug)]
pub struct ContainerStateMachine {
    container_id: ContainerId,
    current_state: ContainerState,
    last_transition: Instant,
    transition_count: u64,
}

impl ContainerStateMachine {
    /// Create a new state machine in the given initial variant.
    pub fn new(container_id: ContainerId, initial: ContainerState) -> Self {
        Self {
            container_id,
            current_state: initial,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> ContainerState {
        self.current_state
    }

    /// Get the container ID.
    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Validate a transition without applying it.
    pub fn check(
        &self,
        target: ContainerState,
        init_attached: bool,
    ) -> Result<ContainerState, StateTransitionError> {
        self.current_state
            .check_transition(target, init_attached)
            .map_err(|refusal| self.refused(refusal, target))
    }

    /// Attempt to transition to a new state.
    /// On error the active variant is left untouched.
    pub fn transition_to(
        &mut self,
        target: ContainerState,
        init_attached: bool,
    ) -> Result<(), StateTransitionError> {
        let next = self.check(target, init_attached)?;
        if next == self.current_state {
            return Ok(());
        }

        tracing::debug!(
            container_id = %self.container_id,
            from = self.current_state.name(),
            to = next.name(),
            "State transition"
        );

        self.current_state = next;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }

    /// Validate that the container may be destroyed right now.
    pub fn check_destroy(&self, init_attached: bool) -> Result<(), StateTransitionError> {
        self.current_state
            .check_destroy(init_attached)
            .map_err(|refusal| self.refused(refusal, ContainerState::Stopped))
    }

    /// Reset to Stopped after the state directory has been removed.
    pub(crate) fn mark_destroyed(&mut self) {
        if self.current_state != ContainerState::Stopped {
            tracing::debug!(
                container_id = %self.container_id,
                from = self.current_state.name(),
                "Destroyed, resetting to stopped"
            );
            self.current_state = ContainerState::Stopped;
            self.last_transition = Instant::now();
            self.transition_count += 1;
        }
    }

    fn refused(&self, refusal: Refusal, target: ContainerState) -> StateTransitionError {
        let err = match refusal {
            Refusal::Illegal => StateTransitionError::InvalidTransition {
                container_id: self.container_id.clone(),
                from: self.current_state.name(),
                to: target.name(),
            },
            Refusal::InitAttached => StateTransitionError::InitAttached {
                container_id: self.container_id.clone(),
                state: self.current_state.name(),
            },
        };
        tracing::error!(container_id = %self.container_id, error = %err, "Transition refused");
        err
    }
}

/// Metrics for the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineMetrics {
    pub container_id: String,
    pub current_state: String,
    pub time_in_state_ms: u64,
    pub transition_count: u64,
}

impl From<&ContainerStateMachine> for StateMachineMetrics {
    fn from(sm: &ContainerStateMachine) -> Self {
        Self {
            container_id: sm.container_id.to_string(),
            current_state: sm.current_state.name().to_string(),
            time_in_state_ms: sm.time_in_current_state().as_millis() as u64,
            transition_count: sm.transition_count,
        }
    }
}
