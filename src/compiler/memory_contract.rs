//! Phase 4 — memory-contract validation (spec §4.4). For each step, walks
//! the function pattern's callable leaves, requires they agree on a single
//! `input_memory_type`/`output_memory_type`, and for consecutive steps
//! computes (or rejects) the converter path between producer and consumer.
//! Also collects `special_inputs`/`special_outputs` and verifies every
//! required special input was produced by an earlier step.

use crate::compilation_error;
use crate::compiler::ProcessingContext;
use crate::error::{CompilationPhase, Result};
use crate::memory_converter::ConverterGraph;
use crate::model::{MemoryType, Pipeline};
use crate::registry::FunctionRegistry;
use std::collections::HashSet;

pub fn run(
    ctx: &mut ProcessingContext<'_>,
    pipeline: &Pipeline,
    registry: &FunctionRegistry,
    converters: &ConverterGraph,
) -> Result<()> {
    let well_id = ctx.well_id.clone();
    let mut produced_so_far: HashSet<String> = HashSet::new();
    let mut previous_output_type: Option<MemoryType> = None;

    for step in &pipeline.steps {
        let leaves = step.func.leaf_names();
        if leaves.is_empty() {
            return Err(compilation_error!(
                well_id,
                step.name,
                CompilationPhase::MemoryContractValidation,
                "function pattern has no callable leaves"
            ));
        }

        let mut input_types = HashSet::new();
        let mut output_types = HashSet::new();
        let mut special_inputs = Vec::new();
        let mut special_outputs = Vec::new();

        for leaf in &leaves {
            let metadata = registry.get_metadata(leaf).ok_or_else(|| {
                compilation_error!(
                    well_id,
                    step.name,
                    CompilationPhase::MemoryContractValidation,
                    format!("function '{leaf}' is not registered")
                )
            })?;
            input_types.insert(metadata.input_memory_type.clone());
            output_types.insert(metadata.output_memory_type.clone());
            special_inputs.extend(metadata.special_inputs);
            special_outputs.extend(metadata.special_outputs);
        }

        if input_types.len() > 1 {
            return Err(compilation_error!(
                well_id,
                step.name,
                CompilationPhase::MemoryContractValidation,
                "callable leaves disagree on input_memory_type"
            ));
        }
        if output_types.len() > 1 {
            return Err(compilation_error!(
                well_id,
                step.name,
                CompilationPhase::MemoryContractValidation,
                "callable leaves disagree on output_memory_type"
            ));
        }

        for required in &special_inputs {
            if !produced_so_far.contains(required) {
                return Err(compilation_error!(
                    well_id,
                    step.name,
                    CompilationPhase::MemoryContractValidation,
                    format!("special input '{required}' was never produced by a prior step")
                ));
            }
        }
        produced_so_far.extend(special_outputs.iter().cloned());

        let input_type = input_types.into_iter().next().unwrap();
        let output_type = output_types.into_iter().next().unwrap();

        if let Some(prev) = &previous_output_type {
            if *prev != input_type && !converters.has_path(prev, &input_type) {
                return Err(compilation_error!(
                    well_id,
                    step.name,
                    CompilationPhase::MemoryContractValidation,
                    format!("no converter path from {prev} to {input_type}")
                ));
            }
        }

        let plan = ctx.step_plans.get_mut(&step.uid).expect("step_plans pre-populated for every step uid");
        plan.input_memory_type = Some(input_type.clone());
        plan.output_memory_type = Some(output_type.clone());
        plan.special_inputs_required = special_inputs;
        plan.special_outputs_produced = special_outputs;

        previous_output_type = Some(output_type);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::path_planning;
    use crate::config::GlobalPipelineConfig;
    use crate::microscope::{GridDimensions, ImageXpressHandler, PixelSize};
    use crate::model::{
        ComponentKind, ComponentTuple, ComponentValue, FileEntry, FunctionCall, FunctionMetadata, FunctionPattern, GroupBy, Step,
    };
    use std::collections::HashMap;

    fn step(name: &str) -> Step {
        Step {
            uid: name.to_string(),
            name: name.to_string(),
            func: FunctionPattern::Single(FunctionCall { function_name: name.to_string(), params: HashMap::new() }),
            variable_components: vec![ComponentKind::ZIndex],
            group_by: GroupBy::None,
            step_materialization_config: None,
            napari_streaming_config: None,
            fiji_streaming_config: None,
            dtype_config: None,
            well_filter_config: None,
        }
    }

    fn one_file() -> FileEntry {
        let components: ComponentTuple =
            vec![(ComponentKind::Well, ComponentValue::Text("A01".into())), (ComponentKind::ZIndex, ComponentValue::Index(1))].into();
        FileEntry { virtual_path: "A01_z1.tif".to_string(), components }
    }

    fn register_cpu_fn(registry: &FunctionRegistry, py: pyo3::Python<'_>, name: &str) {
        use crate::registry::RegisterMode;
        let metadata = FunctionMetadata {
            name: name.to_string(),
            input_memory_type: MemoryType::Cpu,
            output_memory_type: MemoryType::Cpu,
            special_inputs: Vec::new(),
            special_outputs: Vec::new(),
            chain_breaker: false,
        };
        let callable = py.eval("lambda image: image", None, None).unwrap().into();
        registry.register(name, metadata, callable, RegisterMode::AddOnly).unwrap();
    }

    #[test]
    fn compatible_consecutive_steps_pass() {
        pyo3::Python::with_gil(|py| {
            let global = GlobalPipelineConfig::default();
            let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
            let pipeline = Pipeline { steps: vec![step("blur"), step("segment")], config: None };
            let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
            path_planning::run(&mut ctx, &pipeline).unwrap();

            let registry = FunctionRegistry::new();
            register_cpu_fn(&registry, py, "blur");
            register_cpu_fn(&registry, py, "segment");
            let converters = ConverterGraph::new();

            run(&mut ctx, &pipeline, &registry, &converters).unwrap();
            assert_eq!(ctx.step_plans["blur"].output_memory_type, Some(MemoryType::Cpu));
        });
    }

    #[test]
    fn unregistered_function_fails_compilation() {
        pyo3::Python::with_gil(|py| {
            let global = GlobalPipelineConfig::default();
            let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
            let pipeline = Pipeline { steps: vec![step("blur")], config: None };
            let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
            path_planning::run(&mut ctx, &pipeline).unwrap();

            let registry = FunctionRegistry::new();
            let converters = ConverterGraph::new();
            assert!(run(&mut ctx, &pipeline, &registry, &converters).is_err());
            let _ = py;
        });
    }

    #[test]
    fn missing_converter_path_fails_compilation() {
        pyo3::Python::with_gil(|py| {
            use crate::registry::RegisterMode;
            let global = GlobalPipelineConfig::default();
            let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
            let pipeline = Pipeline { steps: vec![step("blur"), step("segment")], config: None };
            let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
            path_planning::run(&mut ctx, &pipeline).unwrap();

            let registry = FunctionRegistry::new();
            register_cpu_fn(&registry, py, "blur");
            let gpu_metadata = FunctionMetadata {
                name: "segment".to_string(),
                input_memory_type: MemoryType::Gpu("cuda".into()),
                output_memory_type: MemoryType::Gpu("cuda".into()),
                special_inputs: Vec::new(),
                special_outputs: Vec::new(),
                chain_breaker: false,
            };
            let callable = py.eval("lambda image: image", None, None).unwrap().into();
            registry.register("segment", gpu_metadata, callable, RegisterMode::AddOnly).unwrap();
            let converters = ConverterGraph::new();

            assert!(run(&mut ctx, &pipeline, &registry, &converters).is_err());
        });
    }
}
