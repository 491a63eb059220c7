//! Top-level orchestrator (spec §4.7). Owns the global config, the
//! microscope handler, and the `FileManager`; drives well enumeration,
//! parallel compilation, and per-well execution. Grounded on the teacher's
//! `TurbulanceOrchestrator` (`turbulance/orchestrator.rs`): its
//! `execute_protocol` dispatches to `execute_sequential`/`execute_parallel`
//! over a compiled plan, and its `#[pyfunction] py_execute_turbulance_protocol`
//! builds a `tokio::runtime::Runtime` and `block_on`s the async orchestrator
//! from a synchronous entry point. This module follows the same shape: a
//! `rayon::par_iter` compilation fan-out (grounded in the teacher's
//! rayon-parallel alignment scans, `bayesian.rs`) followed by a
//! `tokio::runtime::Runtime::block_on` execution fan-out.
//!
//! Unlike the teacher's `execute_parallel`, which propagates the first
//! step error out of the whole `join_all` via `?`, well execution here is
//! isolated per well (spec §4.7 "a failure on well A must not affect well
//! B"): each well's future resolves to its own outcome and a panic or error
//! in one never aborts the others. This divergence is recorded in
//! `DESIGN.md`.

use crate::analysis;
use crate::compiler::{compile_well, ProcessingContext};
use crate::config::{ChunkStrategy, ConfigResolver, GlobalPipelineConfig, WellFilterMode};
use crate::error::Result;
use crate::executor::{CancellationToken, WellExecutor};
use crate::gpu::GpuSlotTable;
use crate::io_error;
use crate::memory_converter::ConverterGraph;
use crate::microscope::{GridDimensions, ImageXpressHandler, MicroscopeHandler, NativeHandler, OperaPhenixHandler, PixelSize};
use crate::model::{FileEntry, Pipeline, StepPlan};
use crate::registry::FunctionRegistry;
use crate::resource_error;
use crate::storage::archive::ArchiveBackend;
use crate::storage::disk::DiskBackend;
use crate::storage::memory::MemoryBackend;
use crate::vfs::FileManager;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Per-well result of a full run (spec §8 S6's completed/canceled/failed
/// tri-state, plus the two compile-time outcomes).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum WellOutcome {
    Completed,
    /// Phase 1 found no patterns for this well (spec §4.4 "skip the well,
    /// not an error").
    CompileSkippedEmpty,
    CompileFailed(String),
    Canceled,
    Failed(String),
}

#[derive(Debug, Default, serde::Serialize)]
pub struct RunOutcome {
    pub wells: HashMap<String, WellOutcome>,
    pub analysis_summary: Option<String>,
}

impl RunOutcome {
    pub fn completed_count(&self) -> usize {
        self.wells.values().filter(|o| matches!(o, WellOutcome::Completed)).count()
    }

    pub fn failed_count(&self) -> usize {
        self.wells.values().filter(|o| matches!(o, WellOutcome::Failed(_) | WellOutcome::CompileFailed(_))).count()
    }

    pub fn canceled_count(&self) -> usize {
        self.wells.values().filter(|o| matches!(o, WellOutcome::Canceled)).count()
    }

    /// `true` when every well either completed or was legitimately skipped
    /// (an empty well is not a failure).
    pub fn fully_succeeded(&self) -> bool {
        self.wells.values().all(|o| matches!(o, WellOutcome::Completed | WellOutcome::CompileSkippedEmpty))
    }
}

pub struct Orchestrator {
    plate_name: String,
    global_config: GlobalPipelineConfig,
    microscope_handler: Arc<dyn MicroscopeHandler>,
    filemanager: FileManager,
    registry: FunctionRegistry,
    converters: ConverterGraph,
    gpu_slots: GpuSlotTable,
    cancel: CancellationToken,
    well_files: HashMap<String, Vec<FileEntry>>,
}

impl Orchestrator {
    /// Builds the storage backends declared by `global_config` rooted at
    /// `plate_root`, scans the root for input files, and detects the
    /// microscope handler from their names (spec §4.7 "build the microscope
    /// handler, build the VFS + FileManager, enumerate wells"). `registry`
    /// and `converters` are built and populated by the caller beforehand
    /// (spec §5 "initialized once at process start via an explicit
    /// `initialize()` call") since registering a Python function needs the
    /// GIL, which this constructor does not take.
    pub fn new(
        plate_root: impl AsRef<Path>,
        global_config: GlobalPipelineConfig,
        registry: FunctionRegistry,
        converters: ConverterGraph,
    ) -> Result<Self> {
        let plate_root = plate_root.as_ref();
        let plate_name = global_config
            .plate_metadata
            .plate_name
            .clone()
            .or_else(|| plate_root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "plate".to_string());

        let grid = global_config
            .plate_metadata
            .grid_dimensions
            .map(|(rows, columns)| GridDimensions { rows, columns })
            .unwrap_or(GridDimensions { rows: 8, columns: 12 });
        let pixel_size = global_config
            .plate_metadata
            .pixel_size_um
            .map(|um| PixelSize { x: um, y: um })
            .unwrap_or(PixelSize { x: 1.0, y: 1.0 });

        let filemanager = FileManager::new();
        filemanager.register_backend(Arc::new(MemoryBackend::new("memory")));
        filemanager.register_backend(Arc::new(DiskBackend::new("disk", plate_root.to_path_buf())?));
        let archive_backend = Arc::new(ArchiveBackend::open(
            "archive",
            plate_root.join(".openhcs_archive"),
            global_config.zarr.chunk_strategy.unwrap_or(ChunkStrategy::Well),
            global_config.zarr.compression_level.unwrap_or(3),
        )?);
        archive_backend.set_openhcs_metadata("grid_dimensions", &format!("{},{}", grid.rows, grid.columns))?;
        archive_backend.set_openhcs_metadata("pixel_size_um", &format!("{},{}", pixel_size.x, pixel_size.y))?;
        filemanager.register_backend(archive_backend);

        let file_names = list_plate_file_names(plate_root)?;
        let microscope_handler = detect_handler(&file_names, grid, pixel_size);
        let well_files = group_by_well(microscope_handler.as_ref(), &file_names);

        let gpu_slots = GpuSlotTable::new(global_config.gpu_device_count, global_config.max_concurrent_per_gpu_device);

        Ok(Self {
            plate_name,
            global_config,
            microscope_handler,
            filemanager,
            registry,
            converters,
            gpu_slots,
            cancel: CancellationToken::new(),
            well_files,
        })
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn converters(&self) -> &ConverterGraph {
        &self.converters
    }

    pub fn filemanager(&self) -> &FileManager {
        &self.filemanager
    }

    /// Requests cooperative cancellation (spec §5): checked between steps
    /// and between patterns, never mid-I/O.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `pipeline` against every enumerated well (minus the configured
    /// well filter), compiling in parallel then executing in parallel, and
    /// finishes with analysis consolidation if configured (spec §4.5 point
    /// 3, §4.7).
    pub fn run(&self, pipeline: &Pipeline) -> Result<RunOutcome> {
        pipeline.validate_unique_uids()?;

        let resolver = ConfigResolver::new(None, pipeline.config.as_ref(), &self.global_config);
        let (filter_wells, filter_mode) = resolver.well_filter();
        let selected = apply_well_filter(&self.well_files, &filter_wells, filter_mode);

        let compiled = self.compile_all(pipeline, &selected);

        let mut outcome = RunOutcome::default();
        let mut runnable: Vec<(String, IndexMap<String, StepPlan>)> = Vec::new();
        for (well_id, result) in compiled {
            match result {
                Ok(Some(step_plans)) => runnable.push((well_id, step_plans)),
                Ok(None) => {
                    outcome.wells.insert(well_id, WellOutcome::CompileSkippedEmpty);
                }
                Err(err) => {
                    outcome.wells.insert(well_id, WellOutcome::CompileFailed(err.to_string()));
                }
            }
        }

        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| resource_error!(format!("failed to start the execution runtime: {e}")))?;
        let executed = runtime.block_on(self.execute_all(pipeline, runnable));
        for (well_id, well_outcome) in executed {
            outcome.wells.insert(well_id, well_outcome);
        }

        if self.global_config.analysis_consolidation.enabled.unwrap_or(false) {
            outcome.analysis_summary = self.consolidate_analysis()?;
        }

        Ok(outcome)
    }

    /// Compiles every enumerated well without executing anything (the
    /// Python bridge's `py_compile_plate`, and the CLI's future
    /// compile-only path).
    pub fn compile_plate(&self, pipeline: &Pipeline) -> Vec<(String, Result<Option<IndexMap<String, StepPlan>>>)> {
        self.compile_all(pipeline, &self.well_files)
    }

    /// Phase fan-out: one `ProcessingContext` per well, compiled
    /// independently (spec §4.7 "compilation is independent and may run in
    /// parallel"). Exposed beyond `run` for compile-only callers (the
    /// Python bridge's `py_compile_plate`).
    pub fn compile_all(
        &self,
        pipeline: &Pipeline,
        well_files: &HashMap<String, Vec<FileEntry>>,
    ) -> Vec<(String, Result<Option<IndexMap<String, StepPlan>>>)> {
        use rayon::prelude::*;

        let handler: &dyn MicroscopeHandler = self.microscope_handler.as_ref();
        let input_dir = self.global_config.vfs.read_backend.clone().unwrap_or_else(|| "disk".to_string());

        well_files
            .par_iter()
            .map(|(well_id, files)| {
                let mut ctx = ProcessingContext::new(
                    well_id.clone(),
                    self.plate_name.clone(),
                    input_dir.clone(),
                    handler,
                    &self.global_config,
                    files.clone(),
                    pipeline,
                );
                let result = compile_well(&mut ctx, pipeline, &self.registry, &self.converters, &self.gpu_slots);
                (well_id.clone(), result)
            })
            .collect()
    }

    /// Submits one execution task per compiled well; each task's failure
    /// resolves to its own `WellOutcome` rather than short-circuiting the
    /// others (spec §4.7 per-well isolation).
    async fn execute_all(
        &self,
        pipeline: &Pipeline,
        runnable: Vec<(String, IndexMap<String, StepPlan>)>,
    ) -> Vec<(String, WellOutcome)> {
        let tasks = runnable.into_iter().map(|(well_id, step_plans)| {
            let executor = WellExecutor {
                registry: &self.registry,
                converters: &self.converters,
                filemanager: &self.filemanager,
                gpu_slots: &self.gpu_slots,
                sinks: Vec::new(),
            };
            async move {
                if self.cancel.is_cancelled() {
                    return (well_id, WellOutcome::Canceled);
                }
                let outcome = match executor.execute_well(&well_id, pipeline, &step_plans, &self.cancel).await {
                    Ok(()) if self.cancel.is_cancelled() => WellOutcome::Canceled,
                    Ok(()) => WellOutcome::Completed,
                    Err(err) => WellOutcome::Failed(err.to_string()),
                };
                (well_id, outcome)
            }
        });
        futures::future::join_all(tasks).await
    }

    fn consolidate_analysis(&self) -> Result<Option<String>> {
        let config = &self.global_config.analysis_consolidation;
        let planning = &self.global_config.path_planning;
        let materialization_backend_id = self.global_config.vfs.materialization_backend.clone().unwrap_or_else(|| "disk".to_string());
        let backend = self.filemanager.backend(&materialization_backend_id)?;

        let output_folder = planning.global_output_folder.clone().unwrap_or_else(|| ".".to_string());
        let suffix = planning.output_dir_suffix.clone().unwrap_or_default();
        let results_subdir = planning.materialization_results_path.clone().unwrap_or_else(|| "analysis".to_string());
        let prefix = format!("{output_folder}/{}{suffix}/{results_subdir}/", self.plate_name);

        let summary = analysis::consolidate(backend.as_ref(), &prefix, config)?;
        if let Some(text) = &summary {
            let filename = config.output_filename.clone().unwrap_or_else(|| "plate_summary.csv".to_string());
            backend.save(&format!("{prefix}{filename}"), text.as_bytes())?;
        }
        Ok(summary)
    }
}

fn list_plate_file_names(plate_root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(plate_root)
        .map_err(|e| io_error!("disk", plate_root.display().to_string(), "list", e.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error!("disk", plate_root.display().to_string(), "list", e.to_string()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Picks the first handler that can parse at least one file at the plate
/// root, trying vendor conventions before the native flat-file scheme.
fn detect_handler(file_names: &[String], grid: GridDimensions, pixel_size: PixelSize) -> Arc<dyn MicroscopeHandler> {
    let candidates: Vec<Arc<dyn MicroscopeHandler>> = vec![
        Arc::new(ImageXpressHandler::new(grid, pixel_size)),
        Arc::new(OperaPhenixHandler::new(grid, pixel_size)),
        Arc::new(NativeHandler::new(grid, pixel_size)),
    ];
    for candidate in &candidates {
        if file_names.iter().any(|name| candidate.parse(name).is_ok()) {
            return candidate.clone();
        }
    }
    candidates[0].clone()
}

fn group_by_well(handler: &dyn MicroscopeHandler, file_names: &[String]) -> HashMap<String, Vec<FileEntry>> {
    let mut grouped: HashMap<String, Vec<FileEntry>> = HashMap::new();
    for name in file_names {
        if let Ok(parsed) = handler.parse(name) {
            let well = parsed.well.clone();
            let components = parsed.into_components();
            grouped.entry(well).or_default().push(FileEntry { virtual_path: name.clone(), components });
        }
    }
    grouped
}

fn apply_well_filter(
    well_files: &HashMap<String, Vec<FileEntry>>,
    wells: &[String],
    mode: WellFilterMode,
) -> HashMap<String, Vec<FileEntry>> {
    if wells.is_empty() {
        return well_files.clone();
    }
    let set: HashSet<&str> = wells.iter().map(|s| s.as_str()).collect();
    well_files
        .iter()
        .filter(|(well_id, _)| {
            let matches = set.contains(well_id.as_str());
            match mode {
                WellFilterMode::Include => matches,
                WellFilterMode::Exclude => !matches,
            }
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
