//! Phase 5 — GPU resource assignment (spec §4.4). Any step whose memory
//! type requires a GPU runtime gets a statically assigned device id,
//! least-loaded first. If GPU memory types are required but no device
//! exists, compilation fails for the well.

use crate::compilation_error;
use crate::compiler::ProcessingContext;
use crate::error::{CompilationPhase, Result};
use crate::gpu::GpuSlotTable;
use crate::model::{MemoryType, Pipeline};

pub fn run(ctx: &mut ProcessingContext<'_>, pipeline: &Pipeline, gpu_slots: &GpuSlotTable) -> Result<()> {
    let well_id = ctx.well_id.clone();
    for step in &pipeline.steps {
        let plan = ctx.step_plans.get_mut(&step.uid).expect("step_plans pre-populated for every step uid");
        let needs_gpu = matches!(plan.input_memory_type, Some(MemoryType::Gpu(_)))
            || matches!(plan.output_memory_type, Some(MemoryType::Gpu(_)));
        if !needs_gpu {
            continue;
        }
        plan.gpu_device = Some(gpu_slots.assign_device().ok_or_else(|| {
            compilation_error!(
                well_id,
                step.name,
                CompilationPhase::GpuAssignment,
                "step requires a GPU memory type but no GPU device is available"
            )
        })?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{memory_contract, path_planning};
    use crate::config::GlobalPipelineConfig;
    use crate::memory_converter::ConverterGraph;
    use crate::microscope::{GridDimensions, ImageXpressHandler, PixelSize};
    use crate::model::{
        ComponentKind, ComponentTuple, ComponentValue, FileEntry, FunctionCall, FunctionMetadata, FunctionPattern, GroupBy, Step,
    };
    use crate::registry::{FunctionRegistry, RegisterMode};
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

    #[test]
    fn gpu_step_gets_assigned_without_available_device_fails() {
        pyo3::Python::with_gil(|py| {
            let global = GlobalPipelineConfig::default();
            let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
            let pipeline = Pipeline { steps: vec![step("segment")], config: None };
            let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
            path_planning::run(&mut ctx, &pipeline).unwrap();

            let registry = FunctionRegistry::new();
            let metadata = FunctionMetadata {
                name: "segment".to_string(),
                input_memory_type: MemoryType::Gpu("cuda".into()),
                output_memory_type: MemoryType::Gpu("cuda".into()),
                special_inputs: Vec::new(),
                special_outputs: Vec::new(),
                chain_breaker: false,
            };
            let callable = py.eval("lambda image: image", None, None).unwrap().into();
            registry.register("segment", metadata, callable, RegisterMode::AddOnly).unwrap();
            let converters = ConverterGraph::new();
            memory_contract::run(&mut ctx, &pipeline, &registry, &converters).unwrap();

            let gpu_slots = GpuSlotTable::new(0, 1);
            assert!(run(&mut ctx, &pipeline, &gpu_slots).is_err());

            let gpu_slots = GpuSlotTable::new(1, 1);
            run(&mut ctx, &pipeline, &gpu_slots).unwrap();
            assert_eq!(ctx.step_plans["segment"].gpu_device, Some(0));
        });
    }
}
