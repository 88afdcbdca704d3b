// src/utils/errors.rs
//! Error types for the Warden engine
//!
//! One taxonomy for the whole crate. Admission-time failures (constraint,
//! budget, policy checks) are rejected before any side effect; execution-time
//! failures inside the sandbox are contained to the single invocation and
//! carry a [`FaultReason`].

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Reason code for a contained sandbox fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// The operation panicked or failed inside the isolation boundary
    Trapped,

    /// The operation used a capability it was not granted
    CapabilityDenied,

    /// The operation breached its sandbox sub-budget mid-execution
    BudgetBreached,

    /// The operation exceeded its wall-clock deadline or was cancelled
    Timeout,
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultReason::Trapped => "trapped",
            FaultReason::CapabilityDenied => "capability-denied",
            FaultReason::BudgetBreached => "budget-breached",
            FaultReason::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent is terminated: {0}")]
    AgentTerminated(String),

    #[error("agent is suspended: {0}")]
    AgentSuspended(String),

    #[error("module verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid capability declaration: {0}")]
    CapabilityDeclarationInvalid(String),

    #[error("plugin sub-budget does not fit agent headroom: {0}")]
    BudgetExceeded(String),

    #[error("resource admission denied: {0}")]
    ResourceExhausted(String),

    #[error("denied by policy: {0}")]
    PolicyDenied(String),

    #[error("plugin execution failed ({reason}): {detail}")]
    PluginExecution { reason: FaultReason, detail: String },

    #[error("operation not attached: {0}")]
    OperationNotFound(String),

    #[error("operation already exported by another plugin: {0}")]
    OperationConflict(String),

    #[error("module not available: {0}")]
    ModuleUnavailable(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("snapshot {snapshot_id} belongs to agent {owner}, not {requested}")]
    AgentMismatch {
        snapshot_id: String,
        owner: String,
        requested: String,
    },

    #[error("agreement not found: {0}")]
    AgreementNotFound(String),

    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("agreement expired at creation")]
    ExpiredAtCreation,

    #[error("agreement expired: {0}")]
    AgreementExpired(String),

    #[error("agreement quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("storage operation failed: {0}")]
    StorageFailed(String),

    #[error("configuration error: {0}")]
    ConfigFailed(String),
}

impl EngineError {
    /// Shorthand for a contained sandbox fault
    pub fn fault(reason: FaultReason, detail: impl Into<String>) -> Self {
        EngineError::PluginExecution {
            reason,
            detail: detail.into(),
        }
    }

    /// Reason code, if this error is a contained sandbox fault
    pub fn fault_reason(&self) -> Option<FaultReason> {
        match self {
            EngineError::PluginExecution { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let err = EngineError::fault(FaultReason::CapabilityDenied, "state-write");
        assert!(err.to_string().contains("capability-denied"));
        assert_eq!(err.fault_reason(), Some(FaultReason::CapabilityDenied));
    }

    #[test]
    fn test_non_fault_has_no_reason() {
        let err = EngineError::AgentNotFound("01H0000000000000000000000".to_string());
        assert!(err.fault_reason().is_none());
    }
}
