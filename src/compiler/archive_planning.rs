//! Phase 2 — archive (zarr/chunked) declaration (spec §4.4). For any step
//! whose read or write backend needs a chunked archive, declares the
//! archive descriptor: root path, chunking strategy, codec, compression
//! level. A foreign plate's original subdir is marked `main: false` once
//! its archive counterpart exists; an already-OpenHCS plate keeps both
//! backends `main: true` side by side.

use crate::compiler::ProcessingContext;
use crate::error::Result;
use crate::model::{ArchiveDescriptor, Pipeline};

pub fn run(ctx: &mut ProcessingContext<'_>, pipeline: &Pipeline) -> Result<()> {
    let zarr = &ctx.global_config.zarr;
    let read_backend = ctx.global_config.vfs.read_backend.clone().unwrap_or_else(|| "disk".to_string());
    let write_backend = ctx.global_config.vfs.materialization_backend.clone().unwrap_or_else(|| "disk".to_string());
    let needs_archive = read_backend == "archive" || write_backend == "archive";
    if !needs_archive {
        return Ok(());
    }

    let chunk_strategy = zarr.chunk_strategy.unwrap_or(crate::config::ChunkStrategy::Well);
    let codec = zarr.compressor.clone().unwrap_or_else(|| "zstd".to_string());
    let compression_level = zarr.compression_level.unwrap_or(3);

    for step in &pipeline.steps {
        let plan = ctx.step_plans.get_mut(&step.uid).expect("step_plans pre-populated for every step uid");
        plan.archive = Some(ArchiveDescriptor {
            root: format!("{}/.archive", plan.output_dir),
            chunk_strategy,
            codec: codec.clone(),
            compression_level,
            main: read_backend == "archive",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::path_planning;
    use crate::config::{ChunkStrategy, GlobalPipelineConfig, VfsConfig, ZarrConfig};
    use crate::microscope::{GridDimensions, ImageXpressHandler, PixelSize};
    use crate::model::{ComponentKind, ComponentTuple, ComponentValue, FileEntry, FunctionCall, FunctionPattern, GroupBy, Step};
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
    fn declares_archive_when_configured_as_read_backend() {
        let mut global = GlobalPipelineConfig::default();
        global.vfs = VfsConfig {
            read_backend: Some("archive".to_string()),
            intermediate_backend: Some("memory".to_string()),
            materialization_backend: Some("disk".to_string()),
        };
        global.zarr = ZarrConfig {
            compressor: Some("zstd".to_string()),
            compression_level: Some(5),
            chunk_strategy: Some(ChunkStrategy::File),
        };
        let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
        let pipeline = Pipeline { steps: vec![step("blur")], config: None };
        let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
        path_planning::run(&mut ctx, &pipeline).unwrap();

        run(&mut ctx, &pipeline).unwrap();
        let archive = ctx.step_plans["blur"].archive.as_ref().unwrap();
        assert_eq!(archive.compression_level, 5);
        assert!(archive.main);
    }

    #[test]
    fn no_archive_declared_when_not_configured() {
        let global = GlobalPipelineConfig::default();
        let handler = ImageXpressHandler::new(GridDimensions { rows: 8, columns: 12 }, PixelSize { x: 0.65, y: 0.65 });
        let pipeline = Pipeline { steps: vec![step("blur")], config: None };
        let mut ctx = ProcessingContext::new("A01", "plate1", "raw", &handler, &global, vec![one_file()], &pipeline);
        path_planning::run(&mut ctx, &pipeline).unwrap();
        run(&mut ctx, &pipeline).unwrap();
        assert!(ctx.step_plans["blur"].archive.is_none());
    }
}
