//! Phase 1 — path planning (spec §4.4). For each step in declaration
//! order: compute `input_dir`/`output_dir`, run pattern discovery with the
//! step's effective `variable_components`/`group_by`, and record the
//! result. If the first step finds no patterns for the well, the whole
//! well is skipped — not an error.

use crate::compiler::ProcessingContext;
use crate::model::Pipeline;
use crate::pattern::discover_patterns;
use crate::error::Result;

pub fn run(ctx: &mut ProcessingContext<'_>, pipeline: &Pipeline) -> Result<bool> {
    let planning = &ctx.global_config.path_planning;
    let output_folder = planning.global_output_folder.clone().unwrap_or_else(|| ".".to_string());
    let suffix = planning.output_dir_suffix.clone().unwrap_or_default();
    let plate_root = format!("{output_folder}/{}{suffix}", ctx.plate_name);

    let mut previous_output_dir = ctx.input_dir.clone();
    let mut any_patterns = false;

    for (index, step) in pipeline.steps.iter().enumerate() {
        let input_dir = if index == 0 { ctx.input_dir.clone() } else { previous_output_dir.clone() };
        let output_dir = format!("{plate_root}/{}", step.name);

        let patterns = discover_patterns(&ctx.well_files, &step.variable_components, step.group_by)?;
        if index == 0 && patterns.is_empty() {
            return Ok(false);
        }
        any_patterns = any_patterns || !patterns.is_empty();

        let plan = ctx.step_plans.get_mut(&step.uid).expect("step_plans pre-populated for every step uid");
        plan.input_dir = input_dir;
        plan.output_dir = output_dir.clone();
        plan.patterns = patterns;
        plan.group_by = step.group_by;
        plan.variable_components = step.variable_components.clone();

        previous_output_dir = output_dir;
    }

    Ok(any_patterns)
}
