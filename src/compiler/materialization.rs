//! Phase 3 — materialization planning (spec §4.4). Decides `read_backend`
//! and `write_backend` per step: the first step reads from the configured
//! source backend, the last step writes to the materialization backend,
//! and everything in between defaults to the intermediate backend unless a
//! step forces disk output.

use crate::compiler::ProcessingContext;
use crate::error::Result;
use crate::model::{MaterializationPlan, Pipeline};

pub fn run(ctx: &mut ProcessingContext<'_>, pipeline: &Pipeline) -> Result<()> {
    let vfs = &ctx.global_config.vfs;
    let source_backend = vfs.read_backend.clone().unwrap_or_else(|| "disk".to_string());
    let intermediate_backend = vfs.intermediate_backend.clone().unwrap_or_else(|| "memory".to_string());
    let materialization_backend = vfs.materialization_backend.clone().unwrap_or_else(|| "disk".to_string());

    let last_index = pipeline.steps.len().saturating_sub(1);

    for (index, step) in pipeline.steps.iter().enumerate() {
        let forces_disk = step
            .step_materialization_config
            .as_ref()
            .map(|c| c.enabled || c.force_disk_output)
            .unwrap_or(false);

        let read_backend = if index == 0 { source_backend.clone() } else { intermediate_backend.clone() };
        let is_last = index == last_index;
        // A forced checkpoint writes *in addition to* the chain backend, not
        // instead of it: the next step still reads from `intermediate_backend`
        // regardless (spec "next step's read_backend is unchanged"), so a
        // non-last step's write_backend only becomes the materialization
        // backend when it's the last step.
        let write_backend = if is_last { materialization_backend.clone() } else { intermediate_backend.clone() };

        let plan = ctx.step_plans.get_mut(&step.uid).expect("step_plans pre-populated for every step uid");
        plan.read_backend = read_backend;
        plan.write_backend = write_backend;
        plan.materialization = MaterializationPlan {
            enabled: is_last || forces_disk,
            backend: if is_last || forces_disk { Some(materialization_backend.clone()) } else { None },
            subdir: step.step_materialization_config.as_ref().and_then(|c| c.subdir.clone()),
        };
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
        ComponentKind, ComponentTuple, ComponentValue, FileEntry, FunctionCall, FunctionPattern, GroupBy, Step,
        StepMaterializationConfig,
    };
    use std::collections::HashMap;

    fn step(name: &str, materialize: Option<StepMaterializationConfig>) -> Step {
        Step {
            uid: name.to_string(),
            name: name.to_string(),
            func: FunctionPattern::Single(FunctionCall { function_name: name.to_string(), params: HashMap::new() }),
            variable_components: vec![ComponentKind::ZIndex],
            group_by: GroupBy::None,
            step_materialization_config: materialize,
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
    fn first_reads_source_last_writes_materialization() {
        let global = GlobalPipelineConfig::default();
        let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
        let pipeline = Pipeline { steps: vec![step("blur", None), step("segment", None)], config: None };
        let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
        path_planning::run(&mut ctx, &pipeline).unwrap();

        run(&mut ctx, &pipeline).unwrap();
        assert_eq!(ctx.step_plans["blur"].read_backend, "disk");
        assert_eq!(ctx.step_plans["blur"].write_backend, "memory");
        assert_eq!(ctx.step_plans["segment"].write_backend, "disk");
    }

    #[test]
    fn forced_disk_output_materializes_mid_pipeline() {
        let global = GlobalPipelineConfig::default();
        let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
        let forced = StepMaterializationConfig { enabled: true, subdir: Some("qc".into()), force_disk_output: true };
        let pipeline = Pipeline { steps: vec![step("blur", Some(forced)), step("segment", None)], config: None };
        let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
        path_planning::run(&mut ctx, &pipeline).unwrap();

        run(&mut ctx, &pipeline).unwrap();
        // Still chains through the intermediate backend so the next step's
        // read is unaffected...
        assert_eq!(ctx.step_plans["blur"].write_backend, "memory");
        // ...but also materializes to disk under the checkpoint subdir.
        assert!(ctx.step_plans["blur"].materialization.enabled);
        assert_eq!(ctx.step_plans["blur"].materialization.backend, Some("disk".to_string()));
        assert_eq!(ctx.step_plans["blur"].materialization.subdir, Some("qc".to_string()));
        assert_eq!(ctx.step_plans["segment"].read_backend, "memory");
    }
}
