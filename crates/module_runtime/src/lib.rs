//! Module runtime: the uniform contract investigation modules implement,
//! the process-wide registry they are served from, and the deadline-bound
//! runner the agent executes them through.

use std::collections::BTreeMap;
use std::sync::Arc;

use core_models::ResultEnvelope;
use serde_json::Value;
use thiserror::Error;

pub mod modules;
pub mod runner;

pub use runner::{run_with_deadline, RunOutcome};

/// Module name reserved for agent self-destruction. The agent core
/// intercepts it; it never reaches a worker thread.
pub const AGENT_DESTROY_MODULE: &str = "agentdestroy";

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("bad parameters: {0}")]
    BadParameters(String),
    #[error("module '{0}' does not provide this capability")]
    CapabilityMissing(String),
}

pub type Result<T> = std::result::Result<T, ModuleError>;

/// Optional capabilities a module may declare on top of `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleCapabilities {
    /// Can build parameters from command-line arguments.
    pub cli_params: bool,
    /// Can produce a ready-to-edit default parameter set.
    pub default_params: bool,
}

/// Execution context handed to every run. The wall-clock deadline is
/// enforced by the caller, not the module.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleContext {
    /// Extra-privacy mode: modules must mask identifying substrings in
    /// their output when set.
    pub epm: bool,
}

/// A named unit of investigation work. `run` is mandatory; the parameter
/// helpers are capabilities a module may or may not provide.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities::default()
    }

    /// Build parameters from CLI-style arguments.
    fn params_from_args(&self, _args: &[String]) -> Result<Value> {
        Err(ModuleError::CapabilityMissing(self.name().to_string()))
    }

    /// Produce a default parameter set for interactive use.
    fn default_params(&self) -> Result<Value> {
        Err(ModuleError::CapabilityMissing(self.name().to_string()))
    }

    /// Execute with already-validated parameters. Modules report their own
    /// failures inside the envelope; returning is always expected.
    fn run(&self, params: &Value, ctx: &ModuleContext) -> ResultEnvelope;
}

/// Registry mapping module names to implementations. Populated once at
/// startup, read-only afterwards; the agent advertises its key set in
/// every heartbeat.
#[derive(Default)]
pub struct Registry {
    modules: BTreeMap<&'static str, Arc<dyn Module>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registry with every built-in module registered.
    pub fn standard() -> Self {
        let mut reg = Registry::new();
        reg.register(Arc::new(modules::FileModule));
        reg.register(Arc::new(modules::PingModule));
        reg.register(Arc::new(modules::AgentDestroyModule));
        reg
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name(), module);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Advertised module list, sorted.
    pub fn names(&self) -> Vec<String> {
        self.modules.keys().map(|k| k.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_advertises_builtins() {
        let reg = Registry::standard();
        assert_eq!(reg.names(), vec!["agentdestroy", "file", "ping"]);
        assert!(reg.get("file").is_ok());
        assert!(matches!(
            reg.get("netstat"),
            Err(ModuleError::UnknownModule(_))
        ));
    }

    #[test]
    fn capability_defaults_refuse_param_helpers() {
        struct Bare;
        impl Module for Bare {
            fn name(&self) -> &'static str {
                "bare"
            }
            fn run(&self, _: &Value, _: &ModuleContext) -> ResultEnvelope {
                ResultEnvelope::default()
            }
        }
        let m = Bare;
        assert!(m.params_from_args(&[]).is_err());
        assert!(m.default_params().is_err());
        assert_eq!(m.capabilities(), ModuleCapabilities::default());
    }
}
