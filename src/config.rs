//! Hierarchical configuration (spec §3 `GlobalPipelineConfig`, §6
//! "Configuration", §9 "Lazy configuration").
//!
//! Each level (step → pipeline → global) is an immutable record of
//! `Option<T>` fields. Resolution walks the chain at access time and
//! returns the first `Some`; no level ever materializes a default into a
//! child — there is no ambient/thread-local mutation anywhere in this
//! module, unlike the source system's attribute-interception trick (spec
//! §9). This mirrors the teacher's plain `ProcessingConfig` struct
//! (`turbulance/processor.rs`) generalized from one flat `Default` record
//! into a three-level override chain.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStrategy {
    Well,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WellFilterMode {
    #[default]
    Include,
    Exclude,
}

/// `vfs.*` options (spec §6 table).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VfsConfig {
    pub read_backend: Option<String>,
    pub intermediate_backend: Option<String>,
    pub materialization_backend: Option<String>,
}

/// `zarr.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZarrConfig {
    pub compressor: Option<String>,
    pub compression_level: Option<i32>,
    pub chunk_strategy: Option<ChunkStrategy>,
}

/// `path_planning.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathPlanningConfig {
    pub global_output_folder: Option<String>,
    pub output_dir_suffix: Option<String>,
    pub sub_dir: Option<String>,
    pub materialization_results_path: Option<String>,
}

/// `analysis_consolidation.*` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConsolidationConfig {
    pub enabled: Option<bool>,
    pub metaxpress_summary: Option<bool>,
    pub output_filename: Option<String>,
    pub well_pattern: Option<String>,
    pub file_extensions: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
}

/// One level of the override chain: any field left `None` falls through to
/// the next level up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub num_workers: Option<usize>,
    pub use_threading: Option<bool>,
    pub vfs: Option<VfsConfig>,
    pub zarr: Option<ZarrConfig>,
    pub path_planning: Option<PathPlanningConfig>,
    pub well_filter: Option<Vec<String>>,
    pub well_filter_mode: Option<WellFilterMode>,
    pub dtype_default_conversion: Option<crate::model::DtypeConversionPolicy>,
    pub analysis_consolidation: Option<AnalysisConsolidationConfig>,
}

pub type PipelineConfig = ProcessingConfig;
pub type StepProcessingConfig = ProcessingConfig;

/// Plate-wide metadata (microscope grid/pixel size) carried alongside the
/// global config (spec §3 `GlobalPipelineConfig`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlateMetadataConfig {
    pub plate_name: Option<String>,
    pub grid_dimensions: Option<(u32, u32)>,
    pub pixel_size_um: Option<f64>,
}

/// Process-wide defaults (spec §3 `GlobalPipelineConfig`). Always fully
/// resolved (no `Option` fields) — it is the final fallback in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPipelineConfig {
    pub num_workers: usize,
    pub use_threading: bool,
    pub vfs: VfsConfig,
    pub zarr: ZarrConfig,
    pub path_planning: PathPlanningConfig,
    pub well_filter: Vec<String>,
    pub well_filter_mode: WellFilterMode,
    pub dtype_default_conversion: crate::model::DtypeConversionPolicy,
    pub analysis_consolidation: AnalysisConsolidationConfig,
    pub plate_metadata: PlateMetadataConfig,
    pub max_concurrent_per_gpu_device: usize,
    pub gpu_device_count: usize,
}

impl Default for GlobalPipelineConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus_fallback(),
            use_threading: true,
            vfs: VfsConfig {
                read_backend: Some("disk".to_string()),
                intermediate_backend: Some("memory".to_string()),
                materialization_backend: Some("disk".to_string()),
            },
            zarr: ZarrConfig {
                compressor: Some("zstd".to_string()),
                compression_level: Some(3),
                chunk_strategy: Some(ChunkStrategy::Well),
            },
            path_planning: PathPlanningConfig {
                global_output_folder: Some(".".to_string()),
                output_dir_suffix: Some("_openhcs".to_string()),
                sub_dir: None,
                materialization_results_path: Some("analysis".to_string()),
            },
            well_filter: Vec::new(),
            well_filter_mode: WellFilterMode::Include,
            dtype_default_conversion: crate::model::DtypeConversionPolicy::NativeOutput,
            analysis_consolidation: AnalysisConsolidationConfig {
                enabled: Some(false),
                metaxpress_summary: Some(false),
                output_filename: Some("plate_summary.csv".to_string()),
                well_pattern: Some(r"^[A-Z]\d{2}$".to_string()),
                file_extensions: Some(vec!["csv".to_string(), "json".to_string()]),
                exclude_patterns: Some(Vec::new()),
            },
            plate_metadata: PlateMetadataConfig::default(),
            max_concurrent_per_gpu_device: 1,
            gpu_device_count: 0,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Walks step → pipeline → global and returns the first non-null value,
/// mutating nothing (spec §6 "Resolution is lazy").
pub struct ConfigResolver<'a> {
    pub step: Option<&'a ProcessingConfig>,
    pub pipeline: Option<&'a PipelineConfig>,
    pub global: &'a GlobalPipelineConfig,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(
        step: Option<&'a ProcessingConfig>,
        pipeline: Option<&'a PipelineConfig>,
        global: &'a GlobalPipelineConfig,
    ) -> Self {
        Self { step, pipeline, global }
    }

    pub fn num_workers(&self) -> usize {
        self.step
            .and_then(|c| c.num_workers)
            .or_else(|| self.pipeline.and_then(|c| c.num_workers))
            .unwrap_or(self.global.num_workers)
    }

    pub fn use_threading(&self) -> bool {
        self.step
            .and_then(|c| c.use_threading)
            .or_else(|| self.pipeline.and_then(|c| c.use_threading))
            .unwrap_or(self.global.use_threading)
    }

    pub fn read_backend(&self) -> String {
        self.step
            .and_then(|c| c.vfs.as_ref()).and_then(|v| v.read_backend.clone())
            .or_else(|| self.pipeline.and_then(|c| c.vfs.as_ref()).and_then(|v| v.read_backend.clone()))
            .or_else(|| self.global.vfs.read_backend.clone())
            .unwrap_or_else(|| "disk".to_string())
    }

    pub fn intermediate_backend(&self) -> String {
        self.step
            .and_then(|c| c.vfs.as_ref()).and_then(|v| v.intermediate_backend.clone())
            .or_else(|| self.pipeline.and_then(|c| c.vfs.as_ref()).and_then(|v| v.intermediate_backend.clone()))
            .or_else(|| self.global.vfs.intermediate_backend.clone())
            .unwrap_or_else(|| "memory".to_string())
    }

    pub fn materialization_backend(&self) -> String {
        self.step
            .and_then(|c| c.vfs.as_ref()).and_then(|v| v.materialization_backend.clone())
            .or_else(|| self.pipeline.and_then(|c| c.vfs.as_ref()).and_then(|v| v.materialization_backend.clone()))
            .or_else(|| self.global.vfs.materialization_backend.clone())
            .unwrap_or_else(|| "disk".to_string())
    }

    pub fn dtype_policy(&self) -> crate::model::DtypeConversionPolicy {
        self.step
            .and_then(|c| c.dtype_default_conversion)
            .or_else(|| self.pipeline.and_then(|c| c.dtype_default_conversion))
            .unwrap_or(self.global.dtype_default_conversion)
    }

    pub fn well_filter(&self) -> (Vec<String>, WellFilterMode) {
        let wells = self
            .step
            .and_then(|c| c.well_filter.clone())
            .or_else(|| self.pipeline.and_then(|c| c.well_filter.clone()))
            .unwrap_or_else(|| self.global.well_filter.clone());
        let mode = self
            .step
            .and_then(|c| c.well_filter_mode)
            .or_else(|| self.pipeline.and_then(|c| c.well_filter_mode))
            .unwrap_or(self.global.well_filter_mode);
        (wells, mode)
    }
}
