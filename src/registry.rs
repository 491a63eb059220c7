//! The function registry: a concurrent map from function name to metadata
//! plus its Python callable handle (spec §4.1 "custom function
//! registration"). Grounded on the teacher's `SessionManager`
//! (`memory.rs`), which holds concurrent state in a `DashMap` guarded
//! per-key, with whole-table mutation (here: add/replace/remove) also
//! serialized through an outer `parking_lot::Mutex` so two concurrent
//! registrations can't race each other's "does this name already exist"
//! check.

use crate::config_error;
use crate::error::Result;
use crate::model::FunctionMetadata;
use crate::resource_error;
use dashmap::DashMap;
use parking_lot::Mutex;
use pyo3::prelude::*;
use std::sync::Arc;

struct Entry {
    metadata: FunctionMetadata,
    callable: Py<PyAny>,
}

/// First-positional-parameter names accepted as a function's image input
/// (spec §4.3 "a function whose first positional parameter name is not a
/// recognized array parameter is rejected at registration").
const RECOGNIZED_ARRAY_PARAMETERS: [&str; 2] = ["image", "array"];

/// Inspects `callable`'s signature via Python's `inspect.signature` and
/// rejects it unless its first positional parameter is a recognized array
/// parameter name.
fn validate_array_parameter(py: Python<'_>, callable: &Py<PyAny>) -> Result<()> {
    let inspect = py
        .import("inspect")
        .map_err(|e| config_error!("failed to import inspect: {e}"))?;
    let signature = inspect
        .call_method1("signature", (callable,))
        .map_err(|e| config_error!("failed to read function signature: {e}"))?;
    let parameters = signature
        .getattr("parameters")
        .map_err(|e| config_error!("failed to read function parameters: {e}"))?;
    let names: Vec<String> = parameters
        .call_method0("keys")
        .and_then(|keys| keys.extract())
        .map_err(|e| config_error!("failed to read parameter names: {e}"))?;
    let first = names
        .first()
        .ok_or_else(|| config_error!("registered function takes no positional parameters"))?;
    if RECOGNIZED_ARRAY_PARAMETERS.contains(&first.as_str()) {
        Ok(())
    } else {
        Err(config_error!(
            "first positional parameter '{first}' is not a recognized array parameter (expected one of {RECOGNIZED_ARRAY_PARAMETERS:?})"
        ))
    }
}

/// How `register` should behave if the name is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Fail if the name already exists.
    AddOnly,
    /// Overwrite silently if the name already exists.
    Replace,
}

/// Cheap to clone: every clone shares the same underlying map and write
/// lock (spec §5 "the function registry... initialized once via an
/// explicit `initialize()` call"), so the process-wide registry can be
/// handed to each `Orchestrator` by value without losing shared state.
#[derive(Clone)]
pub struct FunctionRegistry {
    entries: Arc<DashMap<String, Entry>>,
    /// Serializes add/replace/remove so "does this name exist" checks can't
    /// race a concurrent writer (spec §9 registry protocol).
    write_lock: Arc<Mutex<()>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self { entries: Arc::new(DashMap::new()), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        metadata: FunctionMetadata,
        callable: Py<PyAny>,
        mode: RegisterMode,
    ) -> Result<()> {
        let name = name.into();
        Python::with_gil(|py| validate_array_parameter(py, &callable))?;
        let _guard = self.write_lock.lock();
        if mode == RegisterMode::AddOnly && self.entries.contains_key(&name) {
            return Err(resource_error!(format!("function '{name}' is already registered")));
        }
        self.entries.insert(name, Entry { metadata, callable });
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.entries.remove(name).map(|_| ()).ok_or_else(|| resource_error!(format!("function '{name}' is not registered")))
    }

    pub fn get_metadata(&self, name: &str) -> Option<FunctionMetadata> {
        self.entries.get(name).map(|e| e.metadata.clone())
    }

    pub fn get_callable(&self, py: Python<'_>, name: &str) -> Option<Py<PyAny>> {
        self.entries.get(name).map(|e| e.callable.clone_ref(py))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn list(&self) -> Vec<FunctionMetadata> {
        self.entries.iter().map(|e| e.metadata.clone()).collect()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn metadata(name: &str) -> FunctionMetadata {
        FunctionMetadata {
            name: name.to_string(),
            input_memory_type: crate::model::MemoryType::Cpu,
            output_memory_type: crate::model::MemoryType::Cpu,
            special_inputs: Vec::new(),
            special_outputs: Vec::new(),
            chain_breaker: false,
        }
    }

    #[test]
    fn add_only_rejects_duplicate_name() {
        Python::with_gil(|py| {
            let registry = FunctionRegistry::new();
            let func = py.eval("lambda image: image", None, None).unwrap().into();
            registry.register("blur", metadata("blur"), func, RegisterMode::AddOnly).unwrap();
            let func2 = py.eval("lambda image: image", None, None).unwrap().into();
            assert!(registry.register("blur", metadata("blur"), func2, RegisterMode::AddOnly).is_err());
        });
    }

    #[test]
    fn replace_mode_overwrites() {
        Python::with_gil(|py| {
            let registry = FunctionRegistry::new();
            let func = py.eval("lambda image: image", None, None).unwrap().into();
            registry.register("blur", metadata("blur"), func, RegisterMode::AddOnly).unwrap();
            let func2 = py.eval("lambda image: image", None, None).unwrap().into();
            registry.register("blur", metadata("blur"), func2, RegisterMode::Replace).unwrap();
            assert!(registry.contains("blur"));
        });
    }

    #[test]
    fn unrecognized_first_parameter_is_rejected() {
        Python::with_gil(|py| {
            let registry = FunctionRegistry::new();
            let func = py.eval("lambda frame: frame", None, None).unwrap().into();
            let err = registry.register("blur", metadata("blur"), func, RegisterMode::AddOnly).unwrap_err();
            assert!(matches!(err, crate::error::OpenHcsError::Configuration { .. }));
            assert!(!registry.contains("blur"));
        });
    }

    #[test]
    fn remove_then_lookup_misses() {
        Python::with_gil(|py| {
            let registry = FunctionRegistry::new();
            let func = py.eval("lambda image: image", None, None).unwrap().into();
            registry.register("blur", metadata("blur"), func, RegisterMode::AddOnly).unwrap();
            registry.remove("blur").unwrap();
            assert!(!registry.contains("blur"));
            assert!(registry.remove("blur").is_err());
        });
    }
}
