// src/agreement/engine.rs
//! Resource/call leases between agents
//!
//! An agreement lets a consumer agent invoke a bounded set of operations on
//! a provider agent. Quota accounting is reservation-based: the call slot and
//! the operation's declared resource estimate are taken under the
//! per-agreement lock before delegation, so two concurrent calls can never
//! jointly observe quota as available when their combined use would exceed
//! it. Expired or exhausted agreements refuse further use but are retained
//! for audit.

use crate::audit::{AuditEvent, AuditKind, AuditTrail};
use crate::runtime::agent::{AgentId, AgentStatus};
use crate::runtime::manager::AgentManager;
use crate::sandbox::manifest::CostEstimate;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use ulid::Ulid;

/// Unique identifier of an agreement
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AgreementId(Ulid);

impl AgreementId {
    pub fn new() -> Self {
        AgreementId(Ulid::new())
    }
}

impl Default for AgreementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Maximum CPU/memory attributable to one lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// Monotonic usage counters of one lease
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementUsage {
    pub calls: u32,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

/// One lease binding a consumer to a provider
pub struct Agreement {
    pub id: AgreementId,
    pub consumer: AgentId,
    pub provider: AgentId,
    pub allowed_ops: HashSet<String>,
    pub call_quota: u32,
    pub resource_quota: ResourceQuota,
    pub expires_at: DateTime<Utc>,
    usage: Mutex<AgreementUsage>,
}

impl Agreement {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Reserve one call slot plus the declared estimate, atomically
    fn try_reserve(&self, estimate: CostEstimate) -> Result<()> {
        let mut usage = self.usage.lock();
        if usage.calls >= self.call_quota {
            return Err(EngineError::QuotaExhausted(self.id.to_string()));
        }
        if usage.cpu_millis.saturating_add(estimate.cpu_millis) > self.resource_quota.cpu_millis
            || usage.memory_bytes.saturating_add(estimate.memory_bytes)
                > self.resource_quota.memory_bytes
        {
            return Err(EngineError::QuotaExhausted(self.id.to_string()));
        }
        usage.calls += 1;
        usage.cpu_millis += estimate.cpu_millis;
        usage.memory_bytes += estimate.memory_bytes;
        Ok(())
    }

    /// Return a reservation after an admission-time failure downstream
    fn refund(&self, estimate: CostEstimate) {
        let mut usage = self.usage.lock();
        usage.calls = usage.calls.saturating_sub(1);
        usage.cpu_millis = usage.cpu_millis.saturating_sub(estimate.cpu_millis);
        usage.memory_bytes = usage.memory_bytes.saturating_sub(estimate.memory_bytes);
    }

    /// Recent usage counters; may race benignly with concurrent updates
    pub fn usage(&self) -> AgreementUsage {
        *self.usage.lock()
    }
}

/// Mediator of bounded leases between agents
pub struct AgreementEngine {
    manager: Arc<AgentManager>,
    agreements: DashMap<AgreementId, Arc<Agreement>>,
    audit: Arc<AuditTrail>,
}

impl AgreementEngine {
    pub fn new(manager: Arc<AgentManager>, audit: Arc<AuditTrail>) -> Self {
        Self {
            manager,
            agreements: DashMap::new(),
            audit,
        }
    }

    fn agreement(&self, id: AgreementId) -> Result<Arc<Agreement>> {
        self.agreements
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::AgreementNotFound(id.to_string()))
    }

    /// Create a lease between two live agents
    pub fn create(
        &self,
        consumer: AgentId,
        provider: AgentId,
        allowed_ops: impl IntoIterator<Item = String>,
        call_quota: u32,
        resource_quota: ResourceQuota,
        expires_at: DateTime<Utc>,
    ) -> Result<AgreementId> {
        if call_quota == 0 {
            return Err(EngineError::InvalidQuota("call quota must be > 0".to_string()));
        }
        if resource_quota.cpu_millis == 0 || resource_quota.memory_bytes == 0 {
            return Err(EngineError::InvalidQuota(
                "resource quota components must be > 0".to_string(),
            ));
        }
        if expires_at <= Utc::now() {
            return Err(EngineError::ExpiredAtCreation);
        }
        for agent in [consumer, provider] {
            if self.manager.status(agent)? == AgentStatus::Terminated {
                return Err(EngineError::AgentTerminated(agent.to_string()));
            }
        }

        let agreement = Arc::new(Agreement {
            id: AgreementId::new(),
            consumer,
            provider,
            allowed_ops: allowed_ops.into_iter().collect(),
            call_quota,
            resource_quota,
            expires_at,
            usage: Mutex::new(AgreementUsage::default()),
        });
        let id = agreement.id;
        self.agreements.insert(id, agreement);

        info!(agreement = %id, %consumer, %provider, "Agreement created");
        self.audit.record(AuditEvent::now(
            AuditKind::AgreementCreated,
            Some(consumer.to_string()),
            format!("{} -> {}", id, provider),
        ));
        Ok(id)
    }

    /// Invoke a provider operation under the lease
    pub async fn execute_via(
        &self,
        agreement_id: AgreementId,
        operation: &str,
        params: Value,
    ) -> Result<Value> {
        let agreement = self.agreement(agreement_id)?;

        if agreement.is_expired(Utc::now()) {
            return Err(EngineError::AgreementExpired(agreement_id.to_string()));
        }
        if !agreement.allowed_ops.contains(operation) {
            return Err(EngineError::PolicyDenied(format!(
                "agreement {} does not permit operation '{}'",
                agreement_id, operation
            )));
        }

        // Lease accounting is denominated in declared estimates
        let estimate = self.manager.estimated_cost(agreement.provider, operation)?;
        agreement.try_reserve(estimate)?;

        match self
            .manager
            .execute(agreement.provider, operation, params)
            .await
        {
            Ok(value) => {
                counter!("warden_agreement_calls_total", "outcome" => "ok").increment(1);
                self.audit.record(AuditEvent::now(
                    AuditKind::AgreementCall,
                    Some(agreement.consumer.to_string()),
                    format!("{} {}", agreement_id, operation),
                ));
                Ok(value)
            }
            Err(err) => {
                // Admission-time refusals performed no work: refund the slot.
                // Contained execution faults consumed real resources: keep it.
                if err.fault_reason().is_none() {
                    agreement.refund(estimate);
                    debug!(agreement = %agreement_id, "Reservation refunded after admission failure");
                }
                counter!("warden_agreement_calls_total", "outcome" => "error").increment(1);
                Err(err)
            }
        }
    }

    /// Recent usage counters for a lease
    pub fn usage(&self, agreement_id: AgreementId) -> Result<AgreementUsage> {
        Ok(self.agreement(agreement_id)?.usage())
    }
}
