//! Core data model: components, patterns, functions, steps, pipelines, and
//! the per-well compiled step plan (spec §3).
//!
//! Closed enums replace the source system's runtime reflection over
//! string-ized enum values (spec §9): `ComponentKind` and `FunctionPattern`
//! are plain tagged variants resolved at construction time, never
//! discovered by inspecting attributes at call time.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

/// A named dimension of the dataset (spec §3 "Component"). Closed set per
/// the open-question decision in `DESIGN.md` (no undocumented components).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum ComponentKind {
    Well,
    Site,
    Channel,
    ZIndex,
    Timepoint,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Well,
        ComponentKind::Site,
        ComponentKind::Channel,
        ComponentKind::ZIndex,
        ComponentKind::Timepoint,
    ];

    /// `VariableComponents` = recognized set minus the multiprocessing axis.
    pub fn variable_components(multiprocessing_axis: ComponentKind) -> Vec<ComponentKind> {
        Self::ALL.iter().copied().filter(|c| *c != multiprocessing_axis).collect()
    }
}

/// `GroupBy` = `VariableComponents ∪ {NONE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupBy {
    None,
    By(ComponentKind),
}

/// A single component value extracted from a filename by a `MicroscopeHandler`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum ComponentValue {
    Text(String),
    Index(u32),
}

impl ComponentValue {
    /// The string form used as a dict-pattern key (spec §4.2, §4.5).
    pub fn as_key(&self) -> String {
        match self {
            ComponentValue::Text(s) => s.clone(),
            ComponentValue::Index(i) => i.to_string(),
        }
    }
}

/// The decoded component tuple for one input file.
pub type ComponentTuple = SmallVec<[(ComponentKind, ComponentValue); 5]>;

/// One input file plus its decoded components, as produced by a
/// `MicroscopeHandler::parse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub virtual_path: String,
    pub components: ComponentTuple,
}

impl FileEntry {
    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentValue> {
        self.components.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }
}

/// An ordered sequence of input files sharing fixed values on the invariant
/// dimensions, varying only on `variable_components` (spec §3 "Pattern").
/// Order is the Z-stacking order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Present only for dict function patterns: the group_by key this
    /// pattern was routed under.
    pub group_key: Option<String>,
    pub files: Vec<FileEntry>,
}

impl Pattern {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Numeric pixel type of an image array (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F16,
    F32,
    F64,
}

impl Dtype {
    /// Inclusive integer range used by range-based dtype scaling (spec §4.3).
    pub fn integer_range(self) -> Option<(f64, f64)> {
        match self {
            Dtype::U8 => Some((0.0, u8::MAX as f64)),
            Dtype::U16 => Some((0.0, u16::MAX as f64)),
            Dtype::U32 => Some((0.0, u32::MAX as f64)),
            Dtype::I8 => Some((i8::MIN as f64, i8::MAX as f64)),
            Dtype::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            Dtype::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            Dtype::F16 | Dtype::F32 | Dtype::F64 => None,
        }
    }

    pub fn is_integer(self) -> bool {
        self.integer_range().is_some()
    }
}

/// The runtime tag identifying which backend owns an array (spec §3, §4.3
/// "Memory type"). At minimum `Cpu` plus any number of GPU runtimes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    Cpu,
    Gpu(String),
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Cpu => write!(f, "cpu-ndarray"),
            MemoryType::Gpu(runtime) => write!(f, "gpu:{runtime}"),
        }
    }
}

/// Boundary dtype policy (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtypeConversionPolicy {
    NativeOutput,
    PreserveInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtypeConfig {
    pub default_dtype_conversion: DtypeConversionPolicy,
}

impl Default for DtypeConfig {
    fn default() -> Self {
        Self { default_dtype_conversion: DtypeConversionPolicy::NativeOutput }
    }
}

/// Metadata attached to a function at registration time (spec §4.3). Never
/// discovered reflectively — always a record built by `registry::register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub name: String,
    pub input_memory_type: MemoryType,
    pub output_memory_type: MemoryType,
    pub special_inputs: Vec<String>,
    pub special_outputs: Vec<String>,
    pub chain_breaker: bool,
}

/// One callable leaf in a function pattern, with its bound parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function_name: String,
    pub params: HashMap<String, serde_json::Value>,
}

/// The value of a step's `func` attribute (spec §3 "Function pattern").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FunctionPattern {
    Single(FunctionCall),
    Chain(Vec<FunctionCall>),
    Dict { group_by: ComponentKind, entries: HashMap<String, FunctionPattern> },
    Nested { group_by: ComponentKind, entries: HashMap<String, Vec<FunctionCall>> },
}

impl FunctionPattern {
    /// All callable leaf names, used by phase 4 memory-contract validation
    /// and by dispatch to walk chains/dicts uniformly.
    pub fn leaf_names(&self) -> Vec<&str> {
        match self {
            FunctionPattern::Single(call) => vec![call.function_name.as_str()],
            FunctionPattern::Chain(calls) => calls.iter().map(|c| c.function_name.as_str()).collect(),
            FunctionPattern::Dict { entries, .. } => {
                entries.values().flat_map(|p| p.leaf_names()).collect()
            }
            FunctionPattern::Nested { entries, .. } => entries
                .values()
                .flat_map(|calls| calls.iter().map(|c| c.function_name.as_str()))
                .collect(),
        }
    }

    pub fn group_by(&self) -> GroupBy {
        match self {
            FunctionPattern::Dict { group_by, .. } | FunctionPattern::Nested { group_by, .. } => {
                GroupBy::By(*group_by)
            }
            _ => GroupBy::None,
        }
    }
}

/// Per-step override of materialization (force write to a backend).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepMaterializationConfig {
    pub enabled: bool,
    pub subdir: Option<String>,
    pub force_disk_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WellFilterConfig {
    pub wells: Vec<String>,
    pub mode: crate::config::WellFilterMode,
}

/// A named processing station (spec §3 "Step").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub uid: String,
    pub name: String,
    pub func: FunctionPattern,
    pub variable_components: Vec<ComponentKind>,
    pub group_by: GroupBy,
    pub step_materialization_config: Option<StepMaterializationConfig>,
    pub napari_streaming_config: Option<StreamingConfig>,
    pub fiji_streaming_config: Option<StreamingConfig>,
    pub dtype_config: Option<DtypeConfig>,
    pub well_filter_config: Option<WellFilterConfig>,
}

/// An ordered sequence of steps plus optional pipeline-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub steps: Vec<Step>,
    pub config: Option<crate::config::PipelineConfig>,
}

impl Pipeline {
    /// Invariant: step UIDs are unique within a pipeline (spec §3).
    pub fn validate_unique_uids(&self) -> crate::error::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.uid.as_str()) {
                return Err(crate::config_error!(
                    "duplicate step uid '{}' in pipeline",
                    step.uid
                ));
            }
        }
        Ok(())
    }
}

/// Per-(well, step) compiled plan, filled during compilation and frozen at
/// execution time (spec §3 "step_plan").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    pub step_name: String,
    pub step_uid: String,
    pub well_id: String,
    pub input_dir: String,
    pub output_dir: String,
    pub read_backend: String,
    pub write_backend: String,
    pub input_memory_type: Option<MemoryType>,
    pub output_memory_type: Option<MemoryType>,
    pub patterns: Vec<Pattern>,
    pub group_by: GroupBy,
    pub variable_components: Vec<ComponentKind>,
    pub special_inputs_required: Vec<String>,
    pub special_outputs_produced: Vec<String>,
    pub gpu_device: Option<u32>,
    pub materialization: MaterializationPlan,
    pub dtype_policy: DtypeConversionPolicy,
    pub visualizer_configs: Vec<StreamingConfig>,
    pub archive: Option<ArchiveDescriptor>,
}

/// Archive backend declaration for a step whose read or write backend is a
/// chunked archive (spec §4.4 phase 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub root: String,
    pub chunk_strategy: crate::config::ChunkStrategy,
    pub codec: String,
    pub compression_level: i32,
    /// `true` when this archive is the preferred backend for foreign
    /// plates that also still have their original on-disk subdir (spec
    /// §4.4 "later runs prefer the archive automatically").
    pub main: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MaterializationPlan {
    pub enabled: bool,
    pub backend: Option<String>,
    pub subdir: Option<String>,
}

impl StepPlan {
    pub fn empty(step: &Step, well_id: &str) -> Self {
        Self {
            step_name: step.name.clone(),
            step_uid: step.uid.clone(),
            well_id: well_id.to_string(),
            input_dir: String::new(),
            output_dir: String::new(),
            read_backend: String::new(),
            write_backend: String::new(),
            input_memory_type: None,
            output_memory_type: None,
            patterns: Vec::new(),
            group_by: step.group_by,
            variable_components: step.variable_components.clone(),
            special_inputs_required: Vec::new(),
            special_outputs_produced: Vec::new(),
            gpu_device: None,
            materialization: MaterializationPlan::default(),
            dtype_policy: step
                .dtype_config
                .as_ref()
                .map(|c| c.default_dtype_conversion)
                .unwrap_or(DtypeConversionPolicy::NativeOutput),
            visualizer_configs: Vec::new(),
            archive: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_components_excludes_axis() {
        let vars = ComponentKind::variable_components(ComponentKind::Well);
        assert!(!vars.contains(&ComponentKind::Well));
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn component_value_key_forms() {
        assert_eq!(ComponentValue::Index(2).as_key(), "2");
        assert_eq!(ComponentValue::Text("w1".into()).as_key(), "w1");
    }

    #[test]
    fn duplicate_uid_rejected() {
        let step = Step {
            uid: "s1".into(),
            name: "blur".into(),
            func: FunctionPattern::Single(FunctionCall { function_name: "blur".into(), params: HashMap::new() }),
            variable_components: vec![ComponentKind::Site],
            group_by: GroupBy::None,
            step_materialization_config: None,
            napari_streaming_config: None,
            fiji_streaming_config: None,
            dtype_config: None,
            well_filter_config: None,
        };
        let pipeline = Pipeline { steps: vec![step.clone(), step], config: None };
        assert!(pipeline.validate_unique_uids().is_err());
    }
}
