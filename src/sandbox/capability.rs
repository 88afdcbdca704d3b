// src/sandbox/capability.rs
//! Capability kinds and capability sets
//!
//! A module manifest declares capabilities by name; the sandbox grants the
//! parsed set to the instance and re-checks it with an explicit allow-gate at
//! every use site.

use crate::utils::errors::{EngineError, FaultReason, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Capabilities a module may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    StateRead,
    StateWrite,
    FsRead,
    FsWrite,
    NetConnect,
    Clock,
    Log,
}

impl Capability {
    /// Parse a manifest capability name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "state-read" => Some(Capability::StateRead),
            "state-write" => Some(Capability::StateWrite),
            "fs-read" => Some(Capability::FsRead),
            "fs-write" => Some(Capability::FsWrite),
            "net-connect" => Some(Capability::NetConnect),
            "clock" => Some(Capability::Clock),
            "log" => Some(Capability::Log),
            _ => None,
        }
    }

    /// Canonical manifest name
    pub fn name(&self) -> &'static str {
        match self {
            Capability::StateRead => "state-read",
            Capability::StateWrite => "state-write",
            Capability::FsRead => "fs-read",
            Capability::FsWrite => "fs-write",
            Capability::NetConnect => "net-connect",
            Capability::Clock => "clock",
            Capability::Log => "log",
        }
    }
}

/// Set of capabilities granted to a plugin instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<Capability>,
}

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: caps.into_iter().collect(),
        }
    }

    /// Parse declared capability names; unknown names are a declaration error
    pub fn parse_declared(names: &[String]) -> Result<Self> {
        let mut capabilities = HashSet::new();
        for name in names {
            let cap = Capability::parse(name).ok_or_else(|| {
                EngineError::CapabilityDeclarationInvalid(format!(
                    "unknown capability kind '{}'",
                    name
                ))
            })?;
            capabilities.insert(cap);
        }
        Ok(Self { capabilities })
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Explicit allow-gate: fault when the capability was not granted
    pub fn check(&self, cap: Capability) -> Result<()> {
        if self.has(cap) {
            Ok(())
        } else {
            Err(EngineError::fault(FaultReason::CapabilityDenied, cap.name()))
        }
    }

    /// Declared capability names, sorted (snapshot records)
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .capabilities
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!(Capability::parse("state-read"), Some(Capability::StateRead));
        assert_eq!(Capability::parse("clock"), Some(Capability::Clock));
        assert_eq!(Capability::parse("teleport"), None);
    }

    #[test]
    fn test_parse_declared_rejects_unknown() {
        let names = vec!["state-read".to_string(), "warp-core".to_string()];
        let err = CapabilitySet::parse_declared(&names).unwrap_err();
        assert!(matches!(err, EngineError::CapabilityDeclarationInvalid(_)));
    }

    #[test]
    fn test_check_gate() {
        let caps = CapabilitySet::new([Capability::StateRead]);
        assert!(caps.check(Capability::StateRead).is_ok());

        let err = caps.check(Capability::StateWrite).unwrap_err();
        assert_eq!(err.fault_reason(), Some(FaultReason::CapabilityDenied));
    }

    #[test]
    fn test_names_roundtrip() {
        let caps = CapabilitySet::new([Capability::Log, Capability::Clock]);
        let names = caps.names();
        let reparsed = CapabilitySet::parse_declared(&names).unwrap();
        assert!(reparsed.has(Capability::Log));
        assert!(reparsed.has(Capability::Clock));
    }
}
