// src/sandbox/mod.rs
//! Plugin sandbox
//!
//! Loads signed, capability-declared modules and executes their exported
//! operations in isolation:
//!
//! - **Manifest**: module reference format (manifest + payload + signature)
//! - **Verifier**: ed25519 signature checks against the trust store
//! - **Capability**: declared permission kinds and allow-gates
//! - **Registry**: operation name -> handler dispatch table
//! - **Instance**: per-plugin execution context, state handle, usage meter
//!
//! # Containment
//!
//! Any fault inside an invocation (panic, capability violation, sub-budget
//! breach, deadline overrun) terminates only that invocation. Handlers run
//! on their own task; state writes are buffered and applied by the manager
//! after a successful return, so a faulted call leaves the agent untouched
//! apart from the resource usage it actually consumed.

pub mod capability;
pub mod instance;
pub mod manifest;
pub mod registry;
pub mod verifier;

pub use capability::{Capability, CapabilitySet};
pub use instance::{AgentStateHandle, InvocationMeter, PluginInstance, StateOp};
pub use manifest::{CostEstimate, ModuleManifest, ModuleRef, OpSpec, OperationTable, PluginId, SubBudget};
pub use registry::{OpContext, OperationHandler, OperationRegistry};
pub use verifier::TrustStore;

use crate::utils::errors::{EngineError, FaultReason, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock deadline per invocation
    pub invoke_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout_ms(invoke_timeout_ms: u64) -> Self {
        Self {
            invoke_timeout: Duration::from_millis(invoke_timeout_ms),
        }
    }
}

/// A module whose signature and declarations have been verified
pub struct VerifiedModule {
    pub manifest: ModuleManifest,
    pub capabilities: CapabilitySet,
    pub ops: OperationTable,
}

/// Result of one sandboxed invocation
///
/// Usage fields are populated whether or not the outcome is a fault, so the
/// caller can commit partial consumption up to the abort point.
pub struct InvokeReport {
    pub outcome: Result<(Value, Vec<StateOp>)>,
    pub cpu_millis: u64,
    pub memory_peak_bytes: u64,
}

impl InvokeReport {
    fn rejected(err: EngineError) -> Self {
        Self {
            outcome: Err(err),
            cpu_millis: 0,
            memory_peak_bytes: 0,
        }
    }
}

/// Isolated execution host for plugin modules
pub struct PluginSandbox {
    trust: TrustStore,
    registry: Arc<OperationRegistry>,
    config: SandboxConfig,

    /// Verified modules by (module id, version), kept for snapshot recovery
    modules: DashMap<(String, String), Arc<VerifiedModule>>,
}

impl PluginSandbox {
    pub fn new(trust: TrustStore, registry: OperationRegistry, config: SandboxConfig) -> Self {
        Self {
            trust,
            registry: Arc::new(registry),
            config,
            modules: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Verify and decode a module reference
    ///
    /// Checks, in order: payload signature against the trust store, declared
    /// capability names, payload operation table coverage of the manifest's
    /// exported operations, handler availability in the registry.
    pub fn load(&self, module_ref: &ModuleRef) -> Result<Arc<VerifiedModule>> {
        self.trust
            .verify(&module_ref.payload, &module_ref.signature)?;

        let capabilities = CapabilitySet::parse_declared(&module_ref.manifest.capabilities)?;

        let ops: OperationTable = serde_json::from_slice(&module_ref.payload).map_err(|e| {
            EngineError::VerificationFailed(format!("payload decode failed: {}", e))
        })?;

        for name in &module_ref.manifest.operations {
            let spec = ops.get(name).ok_or_else(|| {
                EngineError::VerificationFailed(format!(
                    "exported operation '{}' missing from payload",
                    name
                ))
            })?;
            if !self.registry.contains(&spec.handler) {
                return Err(EngineError::VerificationFailed(format!(
                    "operation '{}' binds unknown handler '{}'",
                    name, spec.handler
                )));
            }
        }

        let module = Arc::new(VerifiedModule {
            manifest: module_ref.manifest.clone(),
            capabilities,
            ops,
        });

        let key = (
            module.manifest.module_id.clone(),
            module.manifest.version.clone(),
        );
        debug!(
            module = %key.0,
            version = %key.1,
            ops = module.manifest.operations.len(),
            "Module verified"
        );
        self.modules.insert(key, module.clone());

        Ok(module)
    }

    /// Look up a previously verified module (snapshot recovery path)
    pub fn cached(&self, module_id: &str, version: &str) -> Option<Arc<VerifiedModule>> {
        self.modules
            .get(&(module_id.to_string(), version.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Bind a verified module into a fresh isolated instance
    pub fn instantiate(&self, module: Arc<VerifiedModule>, id: PluginId) -> PluginInstance {
        PluginInstance::new(module, id)
    }

    /// Run one exported operation to completion or contained fault
    pub async fn invoke(
        &self,
        instance: &PluginInstance,
        operation: &str,
        params: Value,
        state_view: Arc<HashMap<String, Value>>,
        cancel: CancellationToken,
    ) -> InvokeReport {
        let spec = match instance.module.ops.get(operation) {
            Some(spec) => spec.clone(),
            None => {
                return InvokeReport::rejected(EngineError::OperationNotFound(
                    operation.to_string(),
                ))
            }
        };
        let handler = match self.registry.get(&spec.handler) {
            Some(handler) => handler,
            None => {
                // Registry changed since load; contain rather than crash
                return InvokeReport::rejected(EngineError::fault(
                    FaultReason::Trapped,
                    format!("handler '{}' no longer registered", spec.handler),
                ));
            }
        };

        if let Some(cap) = handler.required_capability() {
            if !instance.granted.has(cap) {
                return InvokeReport::rejected(EngineError::fault(
                    FaultReason::CapabilityDenied,
                    cap.name(),
                ));
            }
        }

        let started = Instant::now();
        let meter = Arc::new(InvocationMeter::new(instance.sub_budget.memory_bytes));
        let state = AgentStateHandle::new(state_view, instance.granted.clone());
        let ctx = OpContext {
            params,
            config: spec.config.clone(),
            state: state.clone(),
            caps: instance.granted.clone(),
            meter: meter.clone(),
            cancel: cancel.clone(),
        };

        let mut task = tokio::spawn(async move { handler.run(&ctx).await });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                task.abort();
                Err(EngineError::fault(
                    FaultReason::Timeout,
                    "cancelled at sandbox boundary",
                ))
            }
            joined = tokio::time::timeout(self.config.invoke_timeout, &mut task) => {
                match joined {
                    Err(_) => {
                        task.abort();
                        Err(EngineError::fault(
                            FaultReason::Timeout,
                            format!("exceeded {}ms deadline", self.config.invoke_timeout.as_millis()),
                        ))
                    }
                    Ok(Ok(Ok(value))) => Ok(value),
                    Ok(Ok(Err(err))) => Err(contain(err)),
                    Ok(Err(join_err)) => {
                        if join_err.is_panic() {
                            warn!(operation, "Plugin operation panicked");
                            Err(EngineError::fault(FaultReason::Trapped, "operation panicked"))
                        } else {
                            Err(EngineError::fault(FaultReason::Timeout, "operation aborted"))
                        }
                    }
                }
            }
        };

        InvokeReport {
            outcome: outcome.map(|value| (value, state.take_delta())),
            cpu_millis: started.elapsed().as_millis() as u64,
            memory_peak_bytes: meter.memory_peak(),
        }
    }
}

/// Map arbitrary handler errors into the contained-fault taxonomy
fn contain(err: EngineError) -> EngineError {
    match err {
        fault @ EngineError::PluginExecution { .. } => fault,
        other => EngineError::fault(FaultReason::Trapped, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn sandbox() -> PluginSandbox {
        let trust = TrustStore::new(vec![signer().verifying_key()]);
        PluginSandbox::new(trust, OperationRegistry::builtin(), SandboxConfig::default())
    }

    fn module_ref(capabilities: &[&str], table: Value) -> ModuleRef {
        let ops: Vec<String> = table
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        let manifest = ModuleManifest {
            module_id: "test.module".to_string(),
            version: "1.0.0".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            operations: ops,
            sub_budget: SubBudget {
                cpu_millis: 100,
                memory_bytes: 1024 * 1024,
            },
        };
        let payload = serde_json::to_vec(&table).unwrap();
        let signature = signer().sign(&payload).to_bytes().to_vec();
        ModuleRef::new(manifest, payload, signature)
    }

    fn echo_table() -> Value {
        json!({ "echo": { "handler": "echo", "cost": { "cpu_millis": 5, "memory_bytes": 4096 } } })
    }

    #[test]
    fn test_load_verifies_and_caches() {
        let sandbox = sandbox();
        let module = sandbox.load(&module_ref(&[], echo_table())).unwrap();
        assert_eq!(module.manifest.module_id, "test.module");
        assert!(sandbox.cached("test.module", "1.0.0").is_some());
        assert!(sandbox.cached("test.module", "9.9.9").is_none());
    }

    #[test]
    fn test_load_rejects_tampered_signature() {
        let sandbox = sandbox();
        let mut module_ref = module_ref(&[], echo_table());
        module_ref.signature[0] ^= 0xff;
        let err = sandbox.load(&module_ref).unwrap_err();
        assert!(matches!(err, EngineError::VerificationFailed(_)));
    }

    #[test]
    fn test_load_rejects_unknown_capability() {
        let sandbox = sandbox();
        let err = sandbox
            .load(&module_ref(&["mind-control"], echo_table()))
            .unwrap_err();
        assert!(matches!(err, EngineError::CapabilityDeclarationInvalid(_)));
    }

    #[test]
    fn test_load_rejects_unknown_handler() {
        let sandbox = sandbox();
        let table = json!({ "warp": { "handler": "warp.drive" } });
        let err = sandbox.load(&module_ref(&[], table)).unwrap_err();
        assert!(matches!(err, EngineError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_invoke_echo() {
        let sandbox = sandbox();
        let module = sandbox.load(&module_ref(&[], echo_table())).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let report = sandbox
            .invoke(
                &instance,
                "echo",
                json!({"message": "hi"}),
                Arc::new(HashMap::new()),
                CancellationToken::new(),
            )
            .await;

        let (value, delta) = report.outcome.unwrap();
        assert_eq!(value, json!({"message": "hi"}));
        assert!(delta.is_empty());
        assert!(report.memory_peak_bytes > 0);
    }

    #[tokio::test]
    async fn test_invoke_denies_undeclared_capability() {
        let sandbox = sandbox();
        let table = json!({ "save": { "handler": "state.put" } });
        let module = sandbox.load(&module_ref(&[], table)).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let report = sandbox
            .invoke(
                &instance,
                "save",
                json!({"key": "k", "value": 1}),
                Arc::new(HashMap::new()),
                CancellationToken::new(),
            )
            .await;

        let err = report.outcome.unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::CapabilityDenied));
        assert_eq!(report.memory_peak_bytes, 0);
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let trust = TrustStore::new(vec![signer().verifying_key()]);
        let sandbox = PluginSandbox::new(
            trust,
            OperationRegistry::builtin(),
            SandboxConfig::with_timeout_ms(50),
        );
        let table = json!({ "nap": { "handler": "delay" } });
        let module = sandbox.load(&module_ref(&[], table)).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let report = sandbox
            .invoke(
                &instance,
                "nap",
                json!({"millis": 5_000}),
                Arc::new(HashMap::new()),
                CancellationToken::new(),
            )
            .await;

        let err = report.outcome.unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::Timeout));
        // Partial consumption up to the abort point is reported
        assert!(report.cpu_millis >= 50);
    }

    #[tokio::test]
    async fn test_invoke_cancellation() {
        let sandbox = sandbox();
        let table = json!({ "nap": { "handler": "delay" } });
        let module = sandbox.load(&module_ref(&[], table)).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = sandbox
            .invoke(
                &instance,
                "nap",
                json!({"millis": 5_000}),
                Arc::new(HashMap::new()),
                cancel,
            )
            .await;

        let err = report.outcome.unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::Timeout));
    }

    struct PanicHandler;

    #[async_trait]
    impl OperationHandler for PanicHandler {
        async fn run(&self, _ctx: &OpContext) -> crate::utils::errors::Result<Value> {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn test_invoke_contains_panics() {
        let trust = TrustStore::new(vec![signer().verifying_key()]);
        let registry = OperationRegistry::builtin();
        registry.register("boom", Arc::new(PanicHandler));
        let sandbox = PluginSandbox::new(trust, registry, SandboxConfig::default());

        let table = json!({ "explode": { "handler": "boom" } });
        let module = sandbox.load(&module_ref(&[], table)).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let report = sandbox
            .invoke(
                &instance,
                "explode",
                Value::Null,
                Arc::new(HashMap::new()),
                CancellationToken::new(),
            )
            .await;

        let err = report.outcome.unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::Trapped));
    }

    #[tokio::test]
    async fn test_invoke_breaches_memory_sub_budget() {
        let sandbox = sandbox();
        let table = echo_table();
        let mut module_ref = module_ref(&[], table);
        module_ref.manifest.sub_budget.memory_bytes = 8;
        // Re-sign not needed: signature covers the payload only
        let module = sandbox.load(&module_ref).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let big = json!({"message": "x".repeat(256)});
        let report = sandbox
            .invoke(
                &instance,
                "echo",
                big,
                Arc::new(HashMap::new()),
                CancellationToken::new(),
            )
            .await;

        let err = report.outcome.unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::BudgetBreached));
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected() {
        let sandbox = sandbox();
        let module = sandbox.load(&module_ref(&[], echo_table())).unwrap();
        let instance = sandbox.instantiate(module, PluginId::new());

        let report = sandbox
            .invoke(
                &instance,
                "reverse",
                Value::Null,
                Arc::new(HashMap::new()),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            report.outcome.unwrap_err(),
            EngineError::OperationNotFound(_)
        ));
    }
}
