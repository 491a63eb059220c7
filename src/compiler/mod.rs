//! The 5-phase compiler (spec §4.4). Compilation runs once per (well,
//! pipeline); each phase mutates only the `step_plans` fields it owns, and
//! a phase failure is fatal for that well with a typed error. Modeled on
//! the teacher's `TurbulanceCompiler` (`turbulance/compiler.rs`), which
//! also runs a fixed ordered sequence of phases over one `CompiledProtocol`
//! and aborts the whole compilation on the first phase error.

pub mod archive_planning;
pub mod gpu_assignment;
pub mod materialization;
pub mod memory_contract;
pub mod path_planning;

use crate::config::GlobalPipelineConfig;
use crate::error::Result;
use crate::gpu::GpuSlotTable;
use crate::memory_converter::ConverterGraph;
use crate::microscope::MicroscopeHandler;
use crate::model::{FileEntry, Pipeline, StepPlan};
use crate::registry::FunctionRegistry;
use indexmap::IndexMap;

/// Per-well compilation state, built fresh for each (well, pipeline) pair
/// and destroyed after the well finishes (spec §3 "Lifecycles").
pub struct ProcessingContext<'a> {
    pub well_id: String,
    pub plate_name: String,
    pub input_dir: String,
    pub microscope_handler: &'a dyn MicroscopeHandler,
    pub global_config: &'a GlobalPipelineConfig,
    pub well_files: Vec<FileEntry>,
    /// Keyed by step uid, insertion order matches declaration order.
    pub step_plans: IndexMap<String, StepPlan>,
}

impl<'a> ProcessingContext<'a> {
    pub fn new(
        well_id: impl Into<String>,
        plate_name: impl Into<String>,
        input_dir: impl Into<String>,
        microscope_handler: &'a dyn MicroscopeHandler,
        global_config: &'a GlobalPipelineConfig,
        well_files: Vec<FileEntry>,
        pipeline: &Pipeline,
    ) -> Self {
        let well_id = well_id.into();
        let step_plans = pipeline
            .steps
            .iter()
            .map(|step| (step.uid.clone(), StepPlan::empty(step, &well_id)))
            .collect();
        Self {
            well_id,
            plate_name: plate_name.into(),
            input_dir: input_dir.into(),
            microscope_handler,
            global_config,
            well_files,
            step_plans,
        }
    }
}

/// Runs all 5 phases in order for one well. Returns `Ok(None)` if phase 1
/// found no patterns for this well (spec §4.4 "skip the well, not an
/// error"), else the frozen `step_plans`.
pub fn compile_well(
    ctx: &mut ProcessingContext<'_>,
    pipeline: &Pipeline,
    registry: &FunctionRegistry,
    converters: &ConverterGraph,
    gpu_slots: &GpuSlotTable,
) -> Result<Option<IndexMap<String, StepPlan>>> {
    if !path_planning::run(ctx, pipeline)? {
        return Ok(None);
    }
    archive_planning::run(ctx, pipeline)?;
    materialization::run(ctx, pipeline)?;
    memory_contract::run(ctx, pipeline, registry, converters)?;
    gpu_assignment::run(ctx, pipeline, gpu_slots)?;
    Ok(Some(ctx.step_plans.clone()))
}
