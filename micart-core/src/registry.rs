//! Thread-safe readiness-socket registry using DashMap.
//!
//! Tracks which containers have a notify socket set up or bound in this
//! process so the one-time setup steps cannot run twice for the same id.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::NotifyError;
use crate::types::ContainerId;

/// How far a container's readiness relay has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPhase {
    /// No readiness address; the relay is a no-op.
    Absent,
    /// Socket directory exists, nothing bound yet.
    Configured,
    /// Rendezvous socket bound.
    Bound,
    /// Readiness datagrams written.
    Signaled,
}

impl NotifyPhase {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Configured => "configured",
            Self::Bound => "bound",
            Self::Signaled => "signaled",
        }
    }
}

/// Per-process registry of notify socket phases, keyed by container id.
#[derive(Debug, Default)]
pub struct NotifyRegistry {
    phases: DashMap<ContainerId, NotifyPhase>,
}

impl NotifyRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            phases: DashMap::new(),
        }
    }

    /// Create a registry wrapped in an Arc for sharing across tasks.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current phase; `Absent` for unknown ids.
    pub fn phase(&self, id: &ContainerId) -> NotifyPhase {
        self.phases
            .get(id)
            .map(|p| *p)
            .unwrap_or(NotifyPhase::Absent)
    }

    /// Record that the socket directory is in place. Idempotent, and never
    /// moves a container backwards.
    pub fn mark_configured(&self, id: &ContainerId) {
        self.phases
            .entry(id.clone())
            .and_modify(|phase| {
                if *phase == NotifyPhase::Absent {
                    *phase = NotifyPhase::Configured;
                }
            })
            .or_insert(NotifyPhase::Configured);
    }

    /// Claim the right to bind. Fails if another notifier already bound.
    pub fn claim_bind(&self, id: &ContainerId) -> Result<(), NotifyError> {
        match self.phases.entry(id.clone()) {
            Entry::Occupied(mut entry) => match *entry.get() {
                NotifyPhase::Bound | NotifyPhase::Signaled => Err(NotifyError::AlreadyBound {
                    container_id: id.clone(),
                }),
                NotifyPhase::Absent | NotifyPhase::Configured => {
                    entry.insert(NotifyPhase::Bound);
                    Ok(())
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(NotifyPhase::Bound);
                Ok(())
            }
        }
    }

    /// Record that readiness was signaled. Requires a prior bind.
    pub fn mark_signaled(&self, id: &ContainerId) -> Result<(), NotifyError> {
        let mut phase = self
            .phases
            .get_mut(id)
            .ok_or_else(|| NotifyError::NotBound {
                container_id: id.clone(),
            })?;

        match *phase {
            NotifyPhase::Bound | NotifyPhase::Signaled => {
                *phase = NotifyPhase::Signaled;
                Ok(())
            }
            NotifyPhase::Absent | NotifyPhase::Configured => Err(NotifyError::NotBound {
                container_id: id.clone(),
            }),
        }
    }

    /// Forget a container, e.g. when its notifier is dropped.
    pub fn release(&self, id: &ContainerId) -> Option<NotifyPhase> {
        self.phases.remove(id).map(|(_, phase)| phase)
    }

    /// Get the number of tracked containers.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ContainerId {
        ContainerId::new(s).unwrap()
    }

    #[test]
    fn test_unknown_is_absent() {
        let registry = NotifyRegistry::new();
        assert_eq!(registry.phase(&id("c1")), NotifyPhase::Absent);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bind_only_once() {
        let registry = NotifyRegistry::new();
        registry.mark_configured(&id("c1"));
        registry.mark_configured(&id("c1"));
        assert_eq!(registry.phase(&id("c1")), NotifyPhase::Configured);

        registry.claim_bind(&id("c1")).unwrap();
        assert!(matches!(
            registry.claim_bind(&id("c1")),
            Err(NotifyError::AlreadyBound { .. })
        ));
        // Other containers are independent.
        registry.claim_bind(&id("c2")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_configure_does_not_regress() {
        let registry = NotifyRegistry::new();
        registry.claim_bind(&id("c1")).unwrap();
        registry.mark_configured(&id("c1"));
        assert_eq!(registry.phase(&id("c1")), NotifyPhase::Bound);
    }

    #[test]
    fn test_signal_requires_bind() {
        let registry = NotifyRegistry::new();
        assert!(registry.mark_signaled(&id("c1")).is_err());
        registry.mark_configured(&id("c1"));
        assert!(registry.mark_signaled(&id("c1")).is_err());
        registry.claim_bind(&id("c1")).unwrap();
        registry.mark_signaled(&id("c1")).unwrap();
        assert_eq!(registry.release(&id("c1")), Some(NotifyPhase::Signaled));
        assert_eq!(registry.phase(&id("c1")), NotifyPhase::Absent);
    }
}
