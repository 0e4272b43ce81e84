//! Custom error types for micart.
//!
//! Every failure is an explicit enum variant. No `Box<dyn Error>` and no
//! `anyhow::Result` in the library; the CLI decides how to print them.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerId;

/// Top-level error type for container operations.
#[derive(Debug, Error)]
pub enum MicaError {
    // =========================================================================
    // Usage and Configuration Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    #[error("Bundle spec error: {message}")]
    Spec { message: String },

    // =========================================================================
    // Container Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Container not found: {id}")]
    ContainerNotFound { id: ContainerId },

    #[error("Container with given ID already exists: {id}")]
    ContainerExists { id: ContainerId },

    #[error("Container {id} is not running")]
    NotRunning { id: ContainerId },

    #[error("Container {id} is not paused")]
    NotPaused { id: ContainerId },

    #[error("Container init still running: {id} did not exit after {attempts} probes")]
    InitStillRunning { id: ContainerId, attempts: u32 },

    // =========================================================================
    // Daemon Errors
    // =========================================================================
    /// Transport failure while talking to micad on behalf of a container.
    #[error("Failed to {action} container {id}: {source}")]
    Daemon {
        id: ContainerId,
        action: &'static str,
        #[source]
        source: DaemonError,
    },

    /// micad accepted the connection but did not answer.
    #[error("Failed to {action} container {id}: empty response from micad")]
    EmptyResponse {
        id: ContainerId,
        action: &'static str,
    },

    #[error("Daemon error: {0}")]
    Transport(#[from] DaemonError),

    #[error("Readiness notification error: {0}")]
    Notify(#[from] NotifyError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call failed: {syscall} - {message}")]
    Syscall {
        syscall: &'static str,
        message: String,
    },
}

/// Usage errors. Reported synchronously, never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid container ID: {id:?} - {reason}")]
    InvalidContainerId { id: String, reason: String },

    #[error("Root directory must not be empty or /")]
    InvalidRoot,
}

/// State transition errors for the container state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("invalid state transition from {from} to {to} for container {container_id}")]
    InvalidTransition {
        container_id: ContainerId,
        from: &'static str,
        to: &'static str,
    },

    /// Running and Paused guests cannot be stopped or destroyed while an
    /// init process is attached.
    #[error("container {container_id} is {state}")]
    InitAttached {
        container_id: ContainerId,
        state: &'static str,
    },
}

/// Transport and protocol errors from a single micad round trip.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to stat socket file {path}: {source}")]
    SocketNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a socket file")]
    NotASocket { path: PathBuf },

    #[error("failed to connect to socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to socket {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read response from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout while waiting for micad response on {path}")]
    Timeout { path: PathBuf },

    /// The creation socket closed without either sentinel.
    #[error("micad closed the connection without a verdict: {response:?}")]
    NoSentinel { response: String },

    #[error("malformed create message: {size} bytes (expected {expected})")]
    MalformedCreateMessage { size: usize, expected: usize },
}

/// Readiness relay errors.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify socket for container {container_id} is already bound")]
    AlreadyBound { container_id: ContainerId },

    #[error("notify socket for container {container_id} is not bound")]
    NotBound { container_id: ContainerId },

    #[error("notify socket error on {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using MicaError.
pub type MicaResult<T> = Result<T, MicaError>;
