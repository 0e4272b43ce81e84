//! micart Core Library
//!
//! Control layer of an OCI-shaped runtime for RTOS guests managed by the
//! mica daemon (micad). Provides the container lifecycle state machine,
//! persisted state records, the micad wire protocols and the readiness
//! relay.

pub mod bundle;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod notify;
pub mod registry;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use bundle::{MicaAnnotations, Spec};
pub use config::{ConfigLoader, DaemonConfig, ForceDeleteConfig, NotifyConfig, RuntimeConfig};
pub use container::{Container, OciState};
pub use daemon::{ControlCommand, CreateMessage, DaemonClient, DaemonReply};
pub use error::{DaemonError, MicaError, MicaResult, StateTransitionError, ValidationError};
pub use notify::ReadinessNotifier;
pub use registry::{NotifyPhase, NotifyRegistry};
pub use state::{ContainerState, ContainerStateMachine, OciStatus};
pub use store::{StateRecord, StateStore};
pub use types::{ContainerId, ProcessId};
