// src/runtime/policy.rs
//! Execution policy hook
//!
//! An injected predicate consulted before every dispatch. The engine carries
//! only the enforcement point; rule content belongs to the embedding system.

use crate::runtime::agent::AgentId;
use serde_json::Value;

/// Verdict hook consulted before dispatching an operation
///
/// Returning `Err(reason)` vetoes the call; the manager surfaces it as
/// `PolicyDenied`.
pub trait ExecutionPolicy: Send + Sync {
    fn evaluate(
        &self,
        agent_id: AgentId,
        operation: &str,
        params: &Value,
    ) -> std::result::Result<(), String>;
}

/// Default policy: every call passes
pub struct AllowAll;

impl ExecutionPolicy for AllowAll {
    fn evaluate(&self, _: AgentId, _: &str, _: &Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Pattern-based allow/deny policy
///
/// Patterns support exact match, prefix wildcard (`"state.*"`), and the
/// universal `"*"`. Deny patterns win; an empty allow list permits anything
/// not denied.
pub struct PatternPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl PatternPolicy {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }
}

fn matches_pattern(pattern: &str, operation: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return operation.starts_with(prefix);
    }
    pattern == operation
}

impl ExecutionPolicy for PatternPolicy {
    fn evaluate(
        &self,
        _agent_id: AgentId,
        operation: &str,
        _params: &Value,
    ) -> std::result::Result<(), String> {
        if self.deny.iter().any(|p| matches_pattern(p, operation)) {
            return Err(format!("operation '{}' is denied", operation));
        }
        if self.allow.is_empty() || self.allow.iter().any(|p| matches_pattern(p, operation)) {
            Ok(())
        } else {
            Err(format!("operation '{}' is not in the allowlist", operation))
        }
    }
}
