pub mod collectors;

use anyhow::{Context, Error};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const FORK_CHOICE_LATENCY: &str = "latency/update_fork_choice";
pub const GET_PAYLOAD_LATENCY: &str = "latency/get_payload";
pub const NEW_PAYLOAD_LATENCY: &str = "latency/new_payload";
pub const SEQUENCER_NEW_PAYLOAD_LATENCY: &str = "latency/sequencer_new_payload";
pub const SEND_TXS_LATENCY: &str = "latency/send_txs";
pub const GAS_PER_BLOCK: &str = "gas/per_block";
pub const GAS_PER_SECOND: &str = "gas/per_second";
pub const TRANSACTIONS_PER_BLOCK: &str = "transactions/per_block";

/// Named f64 samples gathered while producing or validating one block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetrics {
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    execution_metrics: BTreeMap<String, f64>,
}

impl BlockMetrics {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            timestamp: Utc::now(),
            execution_metrics: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.execution_metrics.insert(name.to_string(), value);
    }

    pub fn record_duration(&mut self, name: &str, duration: Duration) {
        self.record(name, duration.as_secs_f64());
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.execution_metrics.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

fn collect_samples(history: &[BlockMetrics], name: &str) -> Vec<f64> {
    history.iter().filter_map(|m| m.get(name)).collect()
}

/// Arithmetic mean over the history; an empty sample set yields 0.0 so a
/// summary can always be produced.
pub fn average(history: &[BlockMetrics], name: &str) -> f64 {
    let samples = collect_samples(history, name);
    if samples.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let count = samples.len() as f64;
    samples.iter().sum::<f64>() / count
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let idx = rank.round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub fn latency_stats(history: &[BlockMetrics], name: &str) -> LatencyStats {
    let mut samples = collect_samples(history, name);
    samples.sort_by(f64::total_cmp);
    LatencyStats {
        avg: average(history, name),
        p50: percentile(&samples, 50.0),
        p90: percentile(&samples, 90.0),
        p99: percentile(&samples, 99.0),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencerSummary {
    pub update_fork_choice: LatencyStats,
    pub get_payload: LatencyStats,
    pub sequencer_new_payload: LatencyStats,
    pub send_txs: LatencyStats,
    pub gas_per_second: f64,
    pub transactions_per_block: f64,
}

pub fn summarize_sequencer(history: &[BlockMetrics]) -> SequencerSummary {
    SequencerSummary {
        update_fork_choice: latency_stats(history, FORK_CHOICE_LATENCY),
        get_payload: latency_stats(history, GET_PAYLOAD_LATENCY),
        sequencer_new_payload: latency_stats(history, SEQUENCER_NEW_PAYLOAD_LATENCY),
        send_txs: latency_stats(history, SEND_TXS_LATENCY),
        gas_per_second: average(history, GAS_PER_SECOND),
        transactions_per_block: average(history, TRANSACTIONS_PER_BLOCK),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorSummary {
    pub new_payload: LatencyStats,
    pub gas_per_second: f64,
}

pub fn summarize_validator(history: &[BlockMetrics]) -> ValidatorSummary {
    ValidatorSummary {
        new_payload: latency_stats(history, NEW_PAYLOAD_LATENCY),
        gas_per_second: average(history, GAS_PER_SECOND),
    }
}

/// Dumps a role's per-block history as pretty JSON under the output dir.
pub struct FileMetricsWriter {
    base_dir: PathBuf,
}

impl FileMetricsWriter {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn write(&self, role: &str, history: &[BlockMetrics]) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("failed to create output dir {}", self.base_dir.display())
        })?;
        let path = self.base_dir.join(format!("{role}_metrics.json"));
        let data = serde_json::to_vec_pretty(history).context("failed to serialize metrics")?;
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with(name: &str, values: &[f64]) -> Vec<BlockMetrics> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut m = BlockMetrics::new(i as u64 + 1);
                m.record(name, *v);
                m
            })
            .collect()
    }

    #[test]
    fn test_average_of_empty_history_is_zero() {
        assert_eq!(average(&[], GAS_PER_SECOND), 0.0);

        // present blocks without the sample also count as empty
        let history = metrics_with(GAS_PER_BLOCK, &[1.0, 2.0]);
        assert_eq!(average(&history, GAS_PER_SECOND), 0.0);
    }

    #[test]
    fn test_average_and_percentiles() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let history = metrics_with(FORK_CHOICE_LATENCY, &values);

        let stats = latency_stats(&history, FORK_CHOICE_LATENCY);
        assert_eq!(stats.avg, 50.5);
        assert_eq!(stats.p50, 51.0);
        assert_eq!(stats.p90, 90.0);
        assert_eq!(stats.p99, 99.0);
    }

    #[test]
    fn test_summaries_use_role_specific_names() {
        let mut m = BlockMetrics::new(7);
        m.record(NEW_PAYLOAD_LATENCY, 0.25);
        m.record(SEQUENCER_NEW_PAYLOAD_LATENCY, 0.5);
        let history = vec![m];

        let sequencer = summarize_sequencer(&history);
        assert_eq!(sequencer.sequencer_new_payload.avg, 0.5);

        let validator = summarize_validator(&history);
        assert_eq!(validator.new_payload.avg, 0.25);
    }

    #[test]
    fn test_file_writer_creates_role_file() {
        let dir = std::env::temp_dir().join("runner-metrics-test");
        let writer = FileMetricsWriter::new(&dir);
        let history = metrics_with(GAS_PER_BLOCK, &[21000.0]);

        let path = writer.write("sequencer", &history).expect("write");
        assert!(path.ends_with("sequencer_metrics.json"));
        let data = std::fs::read_to_string(&path).expect("read back");
        assert!(data.contains("gas/per_block"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
