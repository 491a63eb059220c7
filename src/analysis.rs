//! Analysis consolidation (spec §4.5 point 3). At well completion (or, for
//! the plate-wide pass, once all wells finish), scans the results subdir
//! for CSVs matching the configured well-id pattern, aggregates
//! per-analysis-type statistics, and writes a plate-level summary in wide
//! format with a MetaXpress-compatible header when configured.

use crate::config::AnalysisConsolidationConfig;
use crate::error::Result;
use crate::io_error;
use crate::storage::StorageBackend;
use regex::Regex;
use std::collections::BTreeMap;

/// One result file's parsed metrics, keyed by column name.
#[derive(Debug, Clone, Default)]
struct WellMetrics {
    values: BTreeMap<String, f64>,
}

/// Scans `results_prefix` on `backend` for CSV files whose name matches
/// `config.well_pattern`, reads the first data row of each as
/// `metric -> value`, and returns `Some(csv_text)` of the wide-format
/// summary, or `None` if consolidation is disabled or nothing matched.
pub fn consolidate(backend: &dyn StorageBackend, results_prefix: &str, config: &AnalysisConsolidationConfig) -> Result<Option<String>> {
    if !config.enabled.unwrap_or(false) {
        return Ok(None);
    }

    let well_pattern = Regex::new(config.well_pattern.as_deref().unwrap_or(r"^[A-Z]\d{2}"))
        .map_err(|e| io_error!(backend.id(), results_prefix, "analysis", format!("invalid well_pattern: {e}")))?;
    let extensions: Vec<String> = config.file_extensions.clone().unwrap_or_else(|| vec!["csv".to_string()]);
    let excludes: Vec<Regex> = config
        .exclude_patterns
        .clone()
        .unwrap_or_default()
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

    let mut rows: BTreeMap<String, WellMetrics> = BTreeMap::new();
    let mut all_metrics: Vec<String> = Vec::new();

    for path in backend.list(results_prefix)? {
        let file_name = path.rsplit('/').next().unwrap_or(&path);
        let has_wanted_extension = extensions.iter().any(|ext| file_name.ends_with(&format!(".{ext}")));
        if !has_wanted_extension {
            continue;
        }
        if excludes.iter().any(|re| re.is_match(file_name)) {
            continue;
        }
        let Some(well_match) = well_pattern.find(file_name) else { continue };
        let well_id = well_match.as_str().to_string();

        let bytes = backend.load(&path)?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes.as_slice());
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| io_error!(backend.id(), path.clone(), "analysis", e.to_string()))?
            .iter()
            .map(|h| h.to_string())
            .collect();
        if let Some(record) = reader.records().next() {
            let record = record.map_err(|e| io_error!(backend.id(), path.clone(), "analysis", e.to_string()))?;
            let entry = rows.entry(well_id).or_default();
            for (header, value) in headers.iter().zip(record.iter()) {
                if let Ok(parsed) = value.parse::<f64>() {
                    if !all_metrics.contains(header) {
                        all_metrics.push(header.clone());
                    }
                    entry.values.insert(header.clone(), parsed);
                }
            }
        }
    }

    if rows.is_empty() {
        return Ok(None);
    }
    all_metrics.sort();

    let mut out = Vec::new();
    if config.metaxpress_summary.unwrap_or(false) {
        out.push(b"MetaXpress Plate Summary\n".to_vec());
    }
    {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        let mut header = vec!["Well".to_string()];
        header.extend(all_metrics.iter().cloned());
        writer.write_record(&header).map_err(|e| io_error!(backend.id(), results_prefix, "analysis", e.to_string()))?;
        for (well_id, metrics) in &rows {
            let mut record = vec![well_id.clone()];
            for metric in &all_metrics {
                record.push(metrics.values.get(metric).map(|v| v.to_string()).unwrap_or_default());
            }
            writer.write_record(&record).map_err(|e| io_error!(backend.id(), results_prefix, "analysis", e.to_string()))?;
        }
        out.push(writer.into_inner().map_err(|e| io_error!(backend.id(), results_prefix, "analysis", e.to_string()))?);
    }

    Ok(Some(String::from_utf8_lossy(&out.concat()).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    fn config() -> AnalysisConsolidationConfig {
        AnalysisConsolidationConfig {
            enabled: Some(true),
            metaxpress_summary: Some(true),
            output_filename: Some("plate_summary.csv".to_string()),
            well_pattern: Some(r"^[A-Z]\d{2}".to_string()),
            file_extensions: Some(vec!["csv".to_string()]),
            exclude_patterns: Some(Vec::new()),
        }
    }

    #[test]
    fn aggregates_per_well_csvs_into_wide_summary() {
        let backend = MemoryBackend::new("memory");
        backend.save("results/A01_nuclei.csv", b"count,mean_area\n42,13.5\n").unwrap();
        backend.save("results/B01_nuclei.csv", b"count,mean_area\n7,9.25\n").unwrap();

        let summary = consolidate(&backend, "results/", &config()).unwrap().unwrap();
        assert!(summary.contains("MetaXpress Plate Summary"));
        assert!(summary.contains("Well,count,mean_area"));
        assert!(summary.contains("A01,42,13.5"));
        assert!(summary.contains("B01,7,9.25"));
    }

    #[test]
    fn disabled_config_yields_nothing() {
        let backend = MemoryBackend::new("memory");
        backend.save("results/A01_nuclei.csv", b"count\n1\n").unwrap();
        let mut cfg = config();
        cfg.enabled = Some(false);
        assert!(consolidate(&backend, "results/", &cfg).unwrap().is_none());
    }

    #[test]
    fn no_matching_files_yields_nothing() {
        let backend = MemoryBackend::new("memory");
        backend.save("results/readme.txt", b"hello").unwrap();
        assert!(consolidate(&backend, "results/", &config()).unwrap().is_none());
    }
}
