//! The well executor (spec §4.5). Drives one well's compiled `step_plans`
//! through declaration order: load via the `FileManager`, convert memory
//! types at boundaries, dispatch the function pattern (single/chain/dict),
//! write results, and push to streaming sinks without waiting on them.
//! Grounded on the teacher's `TurbulanceOrchestrator::execute_sequential`
//! (`turbulance/orchestrator.rs`), which also walks a compiled plan's steps
//! in order, borrowing the registry and resource pool for each.

use crate::execution_error;
use crate::error::Result;
use crate::gpu::GpuSlotTable;
use crate::memory_converter::{apply_dtype_policy, ConverterGraph};
use crate::model::{DtypeConversionPolicy, FunctionCall, FunctionPattern, MemoryType, Pattern, Pipeline, Step, StepPlan};
use crate::registry::FunctionRegistry;
use crate::streaming::{push_to_all, FrameId, VisualizerSink};
use crate::vfs::{FileManager, NamedValue, RawImage};
use numpy::{PyArray3, ToPyArray};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyTuple};
use indexmap::IndexMap;
use std::sync::Arc;
pub use tokio_util::sync::CancellationToken;

/// Address a special (non-image) value is stored under, scoped to the well
/// so any step downstream of the one that produced it can find it by name
/// regardless of which step plan's `output_dir` is current (spec §4.5 step
/// 2a/2e "named inputs/outputs").
fn named_value_key(well_id: &str, name: &str) -> String {
    format!("{well_id}/_special/{name}")
}

pub struct WellExecutor<'a> {
    pub registry: &'a FunctionRegistry,
    pub converters: &'a ConverterGraph,
    pub filemanager: &'a FileManager,
    pub gpu_slots: &'a GpuSlotTable,
    pub sinks: Vec<&'a dyn VisualizerSink>,
}

impl<'a> WellExecutor<'a> {
    pub async fn execute_well(
        &self,
        well_id: &str,
        pipeline: &Pipeline,
        step_plans: &IndexMap<String, StepPlan>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for step in &pipeline.steps {
            if cancel.is_cancelled() {
                break;
            }
            let plan = step_plans
                .get(&step.uid)
                .ok_or_else(|| execution_error!(well_id, step.name, "missing compiled step plan"))?;
            self.execute_step(well_id, step, plan, cancel).await?;
        }
        Ok(())
    }

    async fn execute_step(&self, well_id: &str, step: &Step, plan: &StepPlan, cancel: &CancellationToken) -> Result<()> {
        let _gpu_guard = match plan.gpu_device {
            Some(device) => Some(self.gpu_slots.acquire(device).await?),
            None => None,
        };

        for pattern in &plan.patterns {
            if cancel.is_cancelled() {
                break;
            }
            if pattern.is_empty() {
                continue;
            }

            let mut image = self.filemanager.read_pattern(pattern, &plan.read_backend)?;

            if let (Some(from), Some(target)) = (self.array_source_type(plan), plan.input_memory_type.clone()) {
                if from != target {
                    image.array = self.converters.convert(&from, &target, &image.array)?;
                }
            }

            let mut produced = self.dispatch(well_id, step, plan, pattern, &image)?;
            produced.array = apply_dtype_policy(&produced.array, plan.dtype_policy, image.dtype);
            if plan.dtype_policy == DtypeConversionPolicy::PreserveInput {
                produced.dtype = image.dtype;
            }

            let output_paths = self.output_paths(plan, pattern);
            self.filemanager.write_pattern(&produced, &output_paths, &plan.write_backend)?;

            if plan.materialization.enabled {
                if let Some(backend) = &plan.materialization.backend {
                    let materialization_paths = self.materialization_paths(plan, pattern);
                    let _ = self.filemanager.write_pattern(&produced, &materialization_paths, backend);
                }
            }

            if !plan.visualizer_configs.is_empty() && !self.sinks.is_empty() {
                let frame = FrameId {
                    well: well_id.to_string(),
                    site: None,
                    channel: None,
                    z_index: None,
                    timepoint: None,
                    step_index: 0,
                };
                push_to_all(&self.sinks, frame, &output_paths);
            }
        }
        Ok(())
    }

    /// The intermediate backend's stored arrays carry no explicit memory
    /// tag today (spec's "CPU-ndarray" is the default persisted form) —
    /// conversion only triggers when the step's declared input type isn't
    /// CPU, matching the boundary rule in spec §4.5 step (b).
    fn array_source_type(&self, _plan: &StepPlan) -> Option<MemoryType> {
        Some(MemoryType::Cpu)
    }

    fn output_paths(&self, plan: &StepPlan, pattern: &Pattern) -> Vec<String> {
        pattern
            .files
            .iter()
            .map(|f| {
                let name = f.virtual_path.rsplit('/').next().unwrap_or(&f.virtual_path);
                format!("{}/{}", plan.output_dir, name)
            })
            .collect()
    }

    /// Same as `output_paths` but nested under `materialization.subdir` when
    /// set (spec §8 S4 "materialization backend under checkpoints/"), so a
    /// forced checkpoint doesn't collide with the step's normal output path.
    fn materialization_paths(&self, plan: &StepPlan, pattern: &Pattern) -> Vec<String> {
        let base = match &plan.materialization.subdir {
            Some(subdir) => format!("{}/{subdir}", plan.output_dir),
            None => plan.output_dir.clone(),
        };
        pattern
            .files
            .iter()
            .map(|f| {
                let name = f.virtual_path.rsplit('/').next().unwrap_or(&f.virtual_path);
                format!("{base}/{name}")
            })
            .collect()
    }

    fn dispatch(&self, well_id: &str, step: &Step, plan: &StepPlan, pattern: &Pattern, image: &RawImage) -> Result<RawImage> {
        match &step.func {
            FunctionPattern::Single(call) => self.invoke_chain(well_id, &step.name, plan, std::slice::from_ref(call), image),
            FunctionPattern::Chain(calls) => self.invoke_chain(well_id, &step.name, plan, calls, image),
            FunctionPattern::Dict { group_by: _, entries } => {
                let key = pattern
                    .group_key
                    .as_deref()
                    .ok_or_else(|| execution_error!(well_id, step.name, "dict pattern requires a group_key"))?;
                let sub_pattern = entries
                    .get(key)
                    .ok_or_else(|| execution_error!(well_id, step.name, format!("no dict entry for group key '{key}'")))?;
                self.dispatch_sub(well_id, &step.name, plan, sub_pattern, image)
            }
            FunctionPattern::Nested { group_by: _, entries } => {
                let key = pattern
                    .group_key
                    .as_deref()
                    .ok_or_else(|| execution_error!(well_id, step.name, "nested pattern requires a group_key"))?;
                let calls = entries
                    .get(key)
                    .ok_or_else(|| execution_error!(well_id, step.name, format!("no nested entry for group key '{key}'")))?;
                self.invoke_chain(well_id, &step.name, plan, calls, image)
            }
        }
    }

    fn dispatch_sub(&self, well_id: &str, step_name: &str, plan: &StepPlan, pattern: &FunctionPattern, image: &RawImage) -> Result<RawImage> {
        match pattern {
            FunctionPattern::Single(call) => self.invoke_chain(well_id, step_name, plan, std::slice::from_ref(call), image),
            FunctionPattern::Chain(calls) => self.invoke_chain(well_id, step_name, plan, calls, image),
            _ => Err(execution_error!(well_id, step_name, "nested dict/nested patterns are not supported below the first level")),
        }
    }

    /// Pipes `image` through each call in order. A `chain_breaker`
    /// function forces a flush (materialize to the intermediate backend
    /// and re-read) between it and the next call, bypassing in-memory
    /// chaining (spec §4.5 "chain" dispatch).
    fn invoke_chain(&self, well_id: &str, step_name: &str, plan: &StepPlan, calls: &[FunctionCall], image: &RawImage) -> Result<RawImage> {
        let mut current = image.clone();
        for (index, call) in calls.iter().enumerate() {
            let metadata = self
                .registry
                .get_metadata(&call.function_name)
                .ok_or_else(|| execution_error!(well_id, step_name, format!("function '{}' is not registered", call.function_name)))?;

            let mut special_inputs = Vec::with_capacity(metadata.special_inputs.len());
            for name in &metadata.special_inputs {
                let value = self.filemanager.read_named(&named_value_key(well_id, name), &plan.read_backend)?;
                special_inputs.push((name.clone(), value));
            }

            let (next, special_outputs) = self.call_python(well_id, step_name, call, &current, &special_inputs)?;
            current = next;

            for (name, value) in metadata.special_outputs.iter().zip(special_outputs.into_iter()) {
                self.filemanager.write_named(&named_value_key(well_id, name), &value, &plan.write_backend)?;
            }

            if metadata.chain_breaker && index + 1 < calls.len() {
                let flush_path = format!("{}/_flush_{}_{}.bin", plan.output_dir, step_name, index);
                self.filemanager.write_pattern(&current, &[flush_path.clone()], &plan.write_backend)?;
                let reread = self.filemanager.read_pattern(
                    &crate::model::Pattern {
                        group_key: None,
                        files: vec![crate::model::FileEntry { virtual_path: flush_path, components: Default::default() }],
                    },
                    &plan.write_backend,
                )?;
                current = reread;
            }
        }
        Ok(current)
    }

    /// Calls one registered function, binding `special_inputs` as extra
    /// keyword arguments and capturing any tuple elements past index 0 as
    /// special outputs (spec §4.5 step 2c "bind a function's extra tuple
    /// elements to its declared `special_outputs` names").
    fn call_python(
        &self,
        well_id: &str,
        step_name: &str,
        call: &FunctionCall,
        image: &RawImage,
        special_inputs: &[(String, NamedValue)],
    ) -> Result<(RawImage, Vec<NamedValue>)> {
        Python::with_gil(|py| -> Result<(RawImage, Vec<NamedValue>)> {
            let callable = self
                .registry
                .get_callable(py, &call.function_name)
                .ok_or_else(|| execution_error!(well_id, step_name, format!("function '{}' is not registered", call.function_name)))?;

            let array = image.array.to_pyarray(py);
            let kwargs = pyo3::types::PyDict::new(py);
            for (key, value) in &call.params {
                let _ = kwargs.set_item(key.as_str(), json_to_py(py, value));
            }
            for (name, value) in special_inputs {
                let _ = kwargs.set_item(name.as_str(), named_value_to_py(py, value));
            }

            let result = callable
                .call(py, (array,), Some(kwargs))
                .map_err(|e| execution_error!(well_id, step_name, format!("python call failed: {e}")))?;

            let bound = result.as_ref(py);
            let (out_array, special_outputs): (&PyArray3<f32>, Vec<NamedValue>) =
                if let Ok(tuple) = bound.downcast::<PyTuple>() {
                    let out_array = tuple
                        .get_item(0)
                        .map_err(|e| execution_error!(well_id, step_name, e.to_string()))?
                        .downcast::<PyArray3<f32>>()
                        .map_err(|e| execution_error!(well_id, step_name, e.to_string()))?;
                    let mut extras = Vec::new();
                    for item in tuple.iter().skip(1) {
                        let json = py_to_json(item).map_err(|e| execution_error!(well_id, step_name, e))?;
                        extras.push(NamedValue::Json(json));
                    }
                    (out_array, extras)
                } else {
                    let out_array = bound
                        .downcast::<PyArray3<f32>>()
                        .map_err(|e| execution_error!(well_id, step_name, e.to_string()))?;
                    (out_array, Vec::new())
                };

            Ok((RawImage { array: out_array.to_owned_array(), dtype: image.dtype }, special_outputs))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuSlotTable;
    use crate::model::{ComponentTuple, Dtype, FileEntry, MaterializationPlan, StepMaterializationConfig, StreamingConfig};
    use crate::registry::RegisterMode;
    use crate::storage::memory::MemoryBackend;
    use ndarray::Array3;

    fn step(name: &str, function_name: &str) -> Step {
        Step {
            uid: name.to_string(),
            name: name.to_string(),
            func: FunctionPattern::Single(FunctionCall { function_name: function_name.to_string(), params: Default::default() }),
            variable_components: vec![crate::model::ComponentKind::ZIndex],
            group_by: crate::model::GroupBy::None,
            step_materialization_config: None::<StepMaterializationConfig>,
            napari_streaming_config: None::<StreamingConfig>,
            fiji_streaming_config: None,
            dtype_config: None,
            well_filter_config: None,
        }
    }

    fn plan_for(step: &Step, output_dir: &str, input_path: &str) -> StepPlan {
        let mut plan = StepPlan::empty(step, "A01");
        plan.read_backend = "memory".to_string();
        plan.write_backend = "memory".to_string();
        plan.output_dir = output_dir.to_string();
        plan.input_memory_type = Some(MemoryType::Cpu);
        plan.materialization = MaterializationPlan::default();
        plan.patterns = vec![Pattern {
            group_key: None,
            files: vec![FileEntry { virtual_path: input_path.to_string(), components: ComponentTuple::new() }],
        }];
        plan
    }

    fn seed_input(fm: &FileManager, path: &str) {
        let image = RawImage { array: Array3::<f32>::from_elem((1, 2, 2), 0.25), dtype: Dtype::F32 };
        fm.write_pattern(&image, &[path.to_string()], "memory").unwrap();
    }

    #[test]
    fn cancellation_token_reflects_cancel_call() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn single_pattern_step_reads_dispatches_and_writes_output() {
        let fm = FileManager::new();
        fm.register_backend(Arc::new(MemoryBackend::new("memory")));
        seed_input(&fm, "in/A01.bin");

        let registry = FunctionRegistry::new();
        pyo3::Python::with_gil(|py| {
            let metadata = FunctionMetadata {
                name: "identity".to_string(),
                input_memory_type: MemoryType::Cpu,
                output_memory_type: MemoryType::Cpu,
                special_inputs: Vec::new(),
                special_outputs: Vec::new(),
                chain_breaker: false,
            };
            let callable = py.eval("lambda image, **kwargs: image", None, None).unwrap().into();
            registry.register("identity", metadata, callable, RegisterMode::AddOnly).unwrap();
        });

        let step = step("copy", "identity");
        let plan = plan_for(&step, "out", "in/A01.bin");
        let mut step_plans = IndexMap::new();
        step_plans.insert(step.uid.clone(), plan);
        let pipeline = Pipeline { steps: vec![step], config: None };

        let converters = ConverterGraph::new();
        let gpu_slots = GpuSlotTable::new(0, 1);
        let executor = WellExecutor { registry: &registry, converters: &converters, filemanager: &fm, gpu_slots: &gpu_slots, sinks: Vec::new() };

        executor.execute_well("A01", &pipeline, &step_plans, &CancellationToken::new()).await.unwrap();

        let written = fm
            .read_pattern(
                &Pattern { group_key: None, files: vec![FileEntry { virtual_path: "out/A01.bin".to_string(), components: ComponentTuple::new() }] },
                "memory",
            )
            .unwrap();
        assert_eq!(written.array.dim(), (1, 2, 2));
    }

    #[tokio::test]
    async fn special_output_is_written_under_its_declared_name() {
        let fm = FileManager::new();
        fm.register_backend(Arc::new(MemoryBackend::new("memory")));
        seed_input(&fm, "in/A01.bin");

        let registry = FunctionRegistry::new();
        pyo3::Python::with_gil(|py| {
            let metadata = FunctionMetadata {
                name: "count_nuclei".to_string(),
                input_memory_type: MemoryType::Cpu,
                output_memory_type: MemoryType::Cpu,
                special_inputs: Vec::new(),
                special_outputs: vec!["nuclei_count".to_string()],
                chain_breaker: false,
            };
            let callable = py.eval("lambda image, **kwargs: (image, 3)", None, None).unwrap().into();
            registry.register("count_nuclei", metadata, callable, RegisterMode::AddOnly).unwrap();
        });

        let step = step("count", "count_nuclei");
        let plan = plan_for(&step, "out", "in/A01.bin");
        let mut step_plans = IndexMap::new();
        step_plans.insert(step.uid.clone(), plan);
        let pipeline = Pipeline { steps: vec![step], config: None };

        let converters = ConverterGraph::new();
        let gpu_slots = GpuSlotTable::new(0, 1);
        let executor = WellExecutor { registry: &registry, converters: &converters, filemanager: &fm, gpu_slots: &gpu_slots, sinks: Vec::new() };
        executor.execute_well("A01", &pipeline, &step_plans, &CancellationToken::new()).await.unwrap();

        match fm.read_named("A01/_special/nuclei_count", "memory").unwrap() {
            NamedValue::Json(v) => assert_eq!(v, 3),
            NamedValue::Blob(_) => panic!("expected json"),
        }
    }

    #[tokio::test]
    async fn special_input_is_read_and_bound_before_dispatch() {
        let fm = FileManager::new();
        fm.register_backend(Arc::new(MemoryBackend::new("memory")));
        seed_input(&fm, "in/A01.bin");
        fm.write_named("A01/_special/scale", &NamedValue::Json(serde_json::json!(3.0)), "memory").unwrap();

        let registry = FunctionRegistry::new();
        pyo3::Python::with_gil(|py| {
            let metadata = FunctionMetadata {
                name: "scale_by".to_string(),
                input_memory_type: MemoryType::Cpu,
                output_memory_type: MemoryType::Cpu,
                special_inputs: vec!["scale".to_string()],
                special_outputs: Vec::new(),
                chain_breaker: false,
            };
            let callable = py.eval("lambda image, scale=1.0, **kwargs: image * scale", None, None).unwrap().into();
            registry.register("scale_by", metadata, callable, RegisterMode::AddOnly).unwrap();
        });

        let step = step("scale", "scale_by");
        let plan = plan_for(&step, "out", "in/A01.bin");
        let mut step_plans = IndexMap::new();
        step_plans.insert(step.uid.clone(), plan);
        let pipeline = Pipeline { steps: vec![step], config: None };

        let converters = ConverterGraph::new();
        let gpu_slots = GpuSlotTable::new(0, 1);
        let executor = WellExecutor { registry: &registry, converters: &converters, filemanager: &fm, gpu_slots: &gpu_slots, sinks: Vec::new() };
        executor.execute_well("A01", &pipeline, &step_plans, &CancellationToken::new()).await.unwrap();

        let written = fm
            .read_pattern(
                &Pattern { group_key: None, files: vec![FileEntry { virtual_path: "out/A01.bin".to_string(), components: ComponentTuple::new() }] },
                "memory",
            )
            .unwrap();
        assert!(written.array.iter().all(|&v| (v - 0.75).abs() < 1e-6));
    }

    #[tokio::test]
    async fn unregistered_function_fails_execution() {
        let fm = FileManager::new();
        fm.register_backend(Arc::new(MemoryBackend::new("memory")));
        seed_input(&fm, "in/A01.bin");

        let registry = FunctionRegistry::new();
        let step = step("copy", "missing_function");
        let plan = plan_for(&step, "out", "in/A01.bin");
        let mut step_plans = IndexMap::new();
        step_plans.insert(step.uid.clone(), plan);
        let pipeline = Pipeline { steps: vec![step], config: None };

        let converters = ConverterGraph::new();
        let gpu_slots = GpuSlotTable::new(0, 1);
        let executor = WellExecutor { registry: &registry, converters: &converters, filemanager: &fm, gpu_slots: &gpu_slots, sinks: Vec::new() };

        let result = executor.execute_well("A01", &pipeline, &step_plans, &CancellationToken::new()).await;
        assert!(result.is_err());
    }
}

fn json_to_py(py: Python<'_>, value: &serde_json::Value) -> PyObject {
    match value {
        serde_json::Value::Null => py.None(),
        serde_json::Value::Bool(b) => b.into_py(py),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_py(py)
            } else {
                n.as_f64().unwrap_or(0.0).into_py(py)
            }
        }
        serde_json::Value::String(s) => s.into_py(py),
        serde_json::Value::Array(items) => {
            let converted: Vec<PyObject> = items.iter().map(|v| json_to_py(py, v)).collect();
            converted.into_py(py)
        }
        serde_json::Value::Object(map) => {
            let dict = pyo3::types::PyDict::new(py);
            for (k, v) in map {
                let _ = dict.set_item(k, json_to_py(py, v));
            }
            dict.into_py(py)
        }
    }
}

fn named_value_to_py(py: Python<'_>, value: &NamedValue) -> PyObject {
    match value {
        NamedValue::Json(v) => json_to_py(py, v),
        NamedValue::Blob(bytes) => PyBytes::new(py, bytes).into_py(py),
    }
}

/// Converts a returned special-output value back to JSON for storage.
/// Bools are checked before ints since Python `bool` is an `int` subclass
/// and would otherwise always match the `i64` extraction first.
fn py_to_json(value: &PyAny) -> std::result::Result<serde_json::Value, String> {
    if value.is_none() {
        return Ok(serde_json::Value::Null);
    }
    if let Ok(b) = value.extract::<bool>() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Ok(i) = value.extract::<i64>() {
        return Ok(serde_json::Value::from(i));
    }
    if let Ok(f) = value.extract::<f64>() {
        return Ok(serde_json::json!(f));
    }
    if let Ok(s) = value.extract::<String>() {
        return Ok(serde_json::Value::String(s));
    }
    if let Ok(list) = value.downcast::<pyo3::types::PyList>() {
        let items = list.iter().map(py_to_json).collect::<std::result::Result<Vec<_>, String>>()?;
        return Ok(serde_json::Value::Array(items));
    }
    if let Ok(dict) = value.downcast::<pyo3::types::PyDict>() {
        let mut map = serde_json::Map::new();
        for (k, v) in dict.iter() {
            let key = k.extract::<String>().map_err(|e| e.to_string())?;
            map.insert(key, py_to_json(v)?);
        }
        return Ok(serde_json::Value::Object(map));
    }
    Err(format!("unsupported special output type: {value}"))
}
