//! Cross-backend array conversion graph (spec §4.3). `ConverterGraph` is a
//! directed graph over `MemoryType` tags; each edge is a registered
//! conversion function. At step boundaries the executor looks up the
//! shortest conversion path from producer to consumer. Grounded on the
//! teacher's `evidence_network.rs`, which holds a `petgraph::graph::DiGraph`
//! plus a `HashMap<String, NodeIndex>` side table for name-based lookup.

use crate::error::Result;
use crate::model::{Dtype, DtypeConversionPolicy, MemoryType};
use crate::resource_error;
use ndarray::Array3;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::algo::astar;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered conversion between two memory types. Boxed so CPU-only
/// builds and GPU-runtime builds can both populate the same graph shape.
pub type ConverterFn = Arc<dyn Fn(&Array3<f32>) -> Result<Array3<f32>> + Send + Sync>;

/// Cheap to clone: `DiGraph`'s derived `Clone` only clones `Arc<dyn Fn>`
/// pointers, not the closures themselves, so handing a copy to each
/// `Orchestrator` shares the same registered conversions (spec §5, same
/// once-initialized-global shape as `FunctionRegistry`).
#[derive(Clone)]
pub struct ConverterGraph {
    graph: DiGraph<MemoryType, ConverterFn>,
    node_indices: HashMap<MemoryType, NodeIndex>,
}

impl ConverterGraph {
    pub fn new() -> Self {
        Self { graph: DiGraph::new(), node_indices: HashMap::new() }
    }

    fn node(&mut self, memory_type: &MemoryType) -> NodeIndex {
        if let Some(idx) = self.node_indices.get(memory_type) {
            return *idx;
        }
        let idx = self.graph.add_node(memory_type.clone());
        self.node_indices.insert(memory_type.clone(), idx);
        idx
    }

    /// Registers a directed conversion edge. Symmetric conversions need two
    /// calls, one per direction — the graph does not assume invertibility.
    pub fn register_converter(&mut self, from: MemoryType, to: MemoryType, convert: ConverterFn) {
        let from_idx = self.node(&from);
        let to_idx = self.node(&to);
        self.graph.update_edge(from_idx, to_idx, convert);
    }

    /// Finds the shortest chain of conversions from `from` to `to` and
    /// applies it. Returns an error if no path exists (spec §4.3
    /// "compilation fails").
    pub fn convert(&self, from: &MemoryType, to: &MemoryType, array: &Array3<f32>) -> Result<Array3<f32>> {
        if from == to {
            return Ok(array.clone());
        }
        let from_idx = *self
            .node_indices
            .get(from)
            .ok_or_else(|| resource_error!(format!("memory type {from} is not registered in the converter graph")))?;
        let to_idx = *self
            .node_indices
            .get(to)
            .ok_or_else(|| resource_error!(format!("memory type {to} is not registered in the converter graph")))?;

        let path = astar(&self.graph, from_idx, |n| n == to_idx, |_| 1, |_| 0)
            .ok_or_else(|| resource_error!(format!("no conversion path from {from} to {to}")))?
            .1;

        let mut current = array.clone();
        for window in path.windows(2) {
            let (a, b) = (window[0], window[1]);
            let edge = self
                .graph
                .find_edge(a, b)
                .and_then(|e| self.graph.edge_weight(e))
                .ok_or_else(|| resource_error!("conversion edge vanished mid-path"))?;
            current = edge(&current)?;
        }
        Ok(current)
    }

    pub fn has_path(&self, from: &MemoryType, to: &MemoryType) -> bool {
        if from == to {
            return true;
        }
        match (self.node_indices.get(from), self.node_indices.get(to)) {
            (Some(&f), Some(&t)) => astar(&self.graph, f, |n| n == t, |_| 1, |_| 0).is_some(),
            _ => false,
        }
    }
}

impl Default for ConverterGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the boundary dtype policy to a function's native-range output
/// (spec §4.3). `NativeOutput` passes values through untouched; `PreserveInput`
/// rescales the function's [0, 1]-normalized output back to `input_dtype`'s
/// integer range, clipping out-of-range floats.
pub fn apply_dtype_policy(
    array: &Array3<f32>,
    policy: DtypeConversionPolicy,
    input_dtype: Dtype,
) -> Array3<f32> {
    match policy {
        DtypeConversionPolicy::NativeOutput => array.clone(),
        DtypeConversionPolicy::PreserveInput => {
            if let Some((lo, hi)) = input_dtype.integer_range() {
                let (lo, hi) = (lo as f32, hi as f32);
                let span = hi - lo;
                array.mapv(|v| (v.clamp(0.0, 1.0) * span + lo).round())
            } else {
                array.clone()
            }
        }
    }
}

/// Dtype-preserving percentile normalization: clips to the `[low, high]`
/// percentile range, then rescales linearly to `[0, 1]` (spec §4.3 "contrast
/// -only transforms"). `low`/`high` are in `[0, 100]`.
pub fn percentile_normalize(array: &Array3<f32>, low: f32, high: f32) -> Array3<f32> {
    let mut values: Vec<f32> = array.iter().copied().collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if values.is_empty() {
        return array.clone();
    }
    let percentile = |p: f32| -> f32 {
        let idx = ((p / 100.0) * (values.len() - 1) as f32).round() as usize;
        values[idx.min(values.len() - 1)]
    };
    let lo = percentile(low);
    let hi = percentile(high);
    let span = (hi - lo).max(f32::EPSILON);
    array.mapv(|v| ((v.clamp(lo, hi) - lo) / span).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_edge_converts() {
        let mut graph = ConverterGraph::new();
        graph.register_converter(MemoryType::Cpu, MemoryType::Gpu("cuda".into()), Arc::new(|a| Ok(a.mapv(|v| v * 2.0))));
        let array = Array3::<f32>::from_elem((1, 1, 1), 1.0);
        let out = graph.convert(&MemoryType::Cpu, &MemoryType::Gpu("cuda".into()), &array).unwrap();
        assert_eq!(out[[0, 0, 0]], 2.0);
    }

    #[test]
    fn multi_hop_path_chains_conversions() {
        let mut graph = ConverterGraph::new();
        graph.register_converter(MemoryType::Cpu, MemoryType::Gpu("cuda".into()), Arc::new(|a| Ok(a.mapv(|v| v + 1.0))));
        graph.register_converter(
            MemoryType::Gpu("cuda".into()),
            MemoryType::Gpu("jax".into()),
            Arc::new(|a| Ok(a.mapv(|v| v * 10.0))),
        );
        let array = Array3::<f32>::from_elem((1, 1, 1), 1.0);
        let out = graph.convert(&MemoryType::Cpu, &MemoryType::Gpu("jax".into()), &array).unwrap();
        assert_eq!(out[[0, 0, 0]], 20.0);
    }

    #[test]
    fn missing_path_is_an_error() {
        let mut graph = ConverterGraph::new();
        graph.register_converter(MemoryType::Cpu, MemoryType::Gpu("cuda".into()), Arc::new(|a| Ok(a.clone())));
        let array = Array3::<f32>::from_elem((1, 1, 1), 1.0);
        assert!(graph.convert(&MemoryType::Gpu("cuda".into()), &MemoryType::Cpu, &array).is_err());
    }

    #[test]
    fn same_type_is_identity() {
        let graph = ConverterGraph::new();
        let array = Array3::<f32>::from_elem((1, 1, 1), 3.0);
        let out = graph.convert(&MemoryType::Cpu, &MemoryType::Cpu, &array).unwrap();
        assert_eq!(out, array);
    }

    #[test]
    fn preserve_input_rescales_to_integer_range() {
        let array = Array3::<f32>::from_elem((1, 1, 1), 1.0);
        let out = apply_dtype_policy(&array, DtypeConversionPolicy::PreserveInput, Dtype::U8);
        assert_eq!(out[[0, 0, 0]], 255.0);
    }

    #[test]
    fn native_output_passes_through() {
        let array = Array3::<f32>::from_elem((1, 1, 1), 0.5);
        let out = apply_dtype_policy(&array, DtypeConversionPolicy::NativeOutput, Dtype::U8);
        assert_eq!(out[[0, 0, 0]], 0.5);
    }

    #[test]
    fn percentile_normalize_clips_outliers() {
        let array = Array3::from_shape_vec((1, 1, 5), vec![0.0, 1.0, 2.0, 3.0, 100.0]).unwrap();
        let out = percentile_normalize(&array, 0.0, 80.0);
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(*out.iter().last().unwrap(), 1.0);
    }
}
