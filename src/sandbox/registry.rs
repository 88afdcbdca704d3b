// src/sandbox/registry.rs
//! Operation handler registry
//!
//! The sandbox dispatches exported operations through a fixed call/response
//! contract: operation name in, `serde_json::Value` params in, `Value` out.
//! A module's payload binds each exported name to a handler registered here;
//! hosts may register additional handlers beyond the builtin kit.
//!
//! Builtin kit:
//!
//! - `echo`: returns its params unchanged
//! - `state.get` / `state.put` / `state.del`: key/value store access,
//!   gated by `state-read` / `state-write`
//! - `clock.now`: current unix time in ms, gated by `clock`
//! - `log.emit`: structured log line attributed to the plugin, gated by `log`
//! - `delay`: bounded sleep for scheduling and liveness probes

use crate::sandbox::capability::{Capability, CapabilitySet};
use crate::sandbox::instance::{AgentStateHandle, InvocationMeter};
use crate::utils::errors::{EngineError, FaultReason, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a handler may touch during one invocation
pub struct OpContext {
    /// Caller-supplied parameter payload
    pub params: Value,

    /// Static configuration from the module payload's operation table
    pub config: Value,

    /// Capability-gated agent state access
    pub state: AgentStateHandle,

    /// Capabilities granted to the invoking instance
    pub caps: CapabilitySet,

    /// Usage reporting against the instance sub-budget
    pub meter: Arc<InvocationMeter>,

    /// Cooperative cancellation signal
    pub cancel: CancellationToken,
}

/// A host-side operation implementation
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Capability the sandbox must verify before dispatch, if any
    fn required_capability(&self) -> Option<Capability> {
        None
    }

    async fn run(&self, ctx: &OpContext) -> Result<Value>;
}

/// Name -> handler table shared by all sandboxes of an engine
pub struct OperationRegistry {
    handlers: parking_lot::RwLock<HashMap<String, Arc<dyn OperationHandler>>>,
}

impl OperationRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the builtin kit
    pub fn builtin() -> Self {
        let registry = Self::empty();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("state.get", Arc::new(StateGetHandler));
        registry.register("state.put", Arc::new(StatePutHandler));
        registry.register("state.del", Arc::new(StateDelHandler));
        registry.register("clock.now", Arc::new(ClockNowHandler));
        registry.register("log.emit", Arc::new(LogEmitHandler));
        registry.register("delay", Arc::new(DelayHandler));
        registry
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.write().insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }
}

fn param_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            EngineError::fault(
                FaultReason::Trapped,
                format!("missing or non-string param '{}'", key),
            )
        })
}

/// Returns its params unchanged
struct EchoHandler;

#[async_trait]
impl OperationHandler for EchoHandler {
    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        let size = serde_json::to_vec(&ctx.params)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        ctx.meter.reserve_memory(size)?;
        let result = ctx.params.clone();
        ctx.meter.release_memory(size);
        Ok(result)
    }
}

struct StateGetHandler;

#[async_trait]
impl OperationHandler for StateGetHandler {
    fn required_capability(&self) -> Option<Capability> {
        Some(Capability::StateRead)
    }

    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        let key = param_str(&ctx.params, "key")?;
        let value = ctx.state.get(&key)?;
        Ok(value.unwrap_or(Value::Null))
    }
}

struct StatePutHandler;

#[async_trait]
impl OperationHandler for StatePutHandler {
    fn required_capability(&self) -> Option<Capability> {
        Some(Capability::StateWrite)
    }

    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        let key = param_str(&ctx.params, "key")?;
        let value = ctx.params.get("value").cloned().ok_or_else(|| {
            EngineError::fault(FaultReason::Trapped, "missing param 'value'")
        })?;

        let size = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        ctx.meter.reserve_memory(size)?;
        ctx.state.put(key, value)?;
        Ok(json!({ "ok": true }))
    }
}

struct StateDelHandler;

#[async_trait]
impl OperationHandler for StateDelHandler {
    fn required_capability(&self) -> Option<Capability> {
        Some(Capability::StateWrite)
    }

    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        let key = param_str(&ctx.params, "key")?;
        ctx.state.delete(key)?;
        Ok(json!({ "ok": true }))
    }
}

struct ClockNowHandler;

#[async_trait]
impl OperationHandler for ClockNowHandler {
    fn required_capability(&self) -> Option<Capability> {
        Some(Capability::Clock)
    }

    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        ctx.caps.check(Capability::Clock)?;
        Ok(json!(chrono::Utc::now().timestamp_millis()))
    }
}

struct LogEmitHandler;

#[async_trait]
impl OperationHandler for LogEmitHandler {
    fn required_capability(&self) -> Option<Capability> {
        Some(Capability::Log)
    }

    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        ctx.caps.check(Capability::Log)?;
        let message = param_str(&ctx.params, "message")?;
        let level = param_str(&ctx.params, "level").unwrap_or_else(|_| "info".to_string());
        tracing::info!(target: "warden_engine::plugin", plugin_level = %level, "{}", message);
        Ok(Value::Null)
    }
}

/// Bounded sleep; duration from `millis` param, clamped by `max_millis` config
struct DelayHandler;

#[async_trait]
impl OperationHandler for DelayHandler {
    async fn run(&self, ctx: &OpContext) -> Result<Value> {
        let requested = ctx
            .params
            .get("millis")
            .and_then(|v| v.as_u64())
            .or_else(|| ctx.config.get("millis").and_then(|v| v.as_u64()))
            .unwrap_or(0);
        let max = ctx
            .config
            .get("max_millis")
            .and_then(|v| v.as_u64())
            .unwrap_or(60_000);
        let millis = requested.min(max);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                Ok(json!({ "slept_ms": millis }))
            }
            _ = ctx.cancel.cancelled() => {
                Err(EngineError::fault(FaultReason::Timeout, "cancelled mid-delay"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(params: Value, caps: CapabilitySet) -> OpContext {
        OpContext {
            params,
            config: Value::Null,
            state: AgentStateHandle::new(Arc::new(HashMap::new()), caps.clone()),
            caps,
            meter: Arc::new(InvocationMeter::new(1024 * 1024)),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let registry = OperationRegistry::builtin();
        let handler = registry.get("echo").unwrap();
        let params = json!({"message": "hi"});
        let result = handler.run(&ctx(params.clone(), CapabilitySet::default())).await.unwrap();
        assert_eq!(result, params);
    }

    #[tokio::test]
    async fn test_state_put_then_get() {
        let caps = CapabilitySet::new([Capability::StateRead, Capability::StateWrite]);
        let registry = OperationRegistry::builtin();

        let put_ctx = ctx(json!({"key": "counter", "value": 3}), caps.clone());
        registry.get("state.put").unwrap().run(&put_ctx).await.unwrap();

        // Writes are buffered, visible to the same invocation's handle only
        assert_eq!(put_ctx.state.get("counter").unwrap(), Some(json!(3)));
        assert_eq!(put_ctx.state.take_delta().len(), 1);
    }

    #[tokio::test]
    async fn test_state_get_missing_key_is_null() {
        let caps = CapabilitySet::new([Capability::StateRead]);
        let registry = OperationRegistry::builtin();
        let result = registry
            .get("state.get")
            .unwrap()
            .run(&ctx(json!({"key": "absent"}), caps))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_delay_is_clamped_and_cancellable() {
        let registry = OperationRegistry::builtin();
        let handler = registry.get("delay").unwrap();

        let result = handler
            .run(&ctx(json!({"millis": 1}), CapabilitySet::default()))
            .await
            .unwrap();
        assert_eq!(result, json!({"slept_ms": 1}));

        let cancelled = ctx(json!({"millis": 10_000}), CapabilitySet::default());
        cancelled.cancel.cancel();
        let err = handler.run(&cancelled).await.unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::Timeout));
    }

    #[test]
    fn test_registry_contains_builtin_kit() {
        let registry = OperationRegistry::builtin();
        for name in ["echo", "state.get", "state.put", "state.del", "clock.now", "log.emit", "delay"] {
            assert!(registry.contains(name), "missing builtin '{}'", name);
        }
        assert!(!registry.contains("fs.read"));
    }
}
