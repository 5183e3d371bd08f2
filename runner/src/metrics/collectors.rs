use super::BlockMetrics;
use anyhow::{Context, Error, anyhow};
use std::collections::HashMap;
use tracing::debug;

/// Geth exposes pre-aggregated timers on its debug endpoint, so the median
/// samples can be lifted straight out of the JSON map.
pub const GETH_METRIC_NAMES: &[&str] = &[
    "chain/account/reads.50-percentile",
    "chain/execution.50-percentile",
    "chain/crossvalidation.50-percentile",
    "chain/storage/reads.50-percentile",
    "chain/account/updates.50-percentile",
    "chain/account/hashes.50-percentile",
    "chain/storage/updates.50-percentile",
    "chain/validation.50-percentile",
    "chain/write.50-percentile",
    "chain/snapshot/commits.50-percentile",
    "chain/triedb/commits.50-percentile",
    "chain/account/commits.50-percentile",
    "chain/storage/commits.50-percentile",
    "chain/inserts.50-percentile",
];

pub const RETH_METRIC_NAMES: &[&str] = &[
    "reth_sync_execution_execution_duration",
    "reth_sync_block_validation_state_root_duration",
];

/// Scrapes a client's native metrics endpoint after each block and appends
/// the merged BlockMetrics to an owned history.
pub enum MetricsCollector {
    /// Geth-style `/debug/metrics` JSON map.
    DebugJson(DebugJsonCollector),
    /// Reth-style Prometheus text exposition.
    Prometheus(PrometheusCollector),
}

impl MetricsCollector {
    /// The block is appended to the history even when the scrape fails, so
    /// driver-side samples are never lost to a flaky metrics endpoint.
    pub async fn collect(&mut self, metrics: &mut BlockMetrics) -> Result<(), Error> {
        match self {
            Self::DebugJson(c) => c.collect(metrics).await,
            Self::Prometheus(c) => c.collect(metrics).await,
        }
    }

    pub fn take_history(self) -> Vec<BlockMetrics> {
        match self {
            Self::DebugJson(c) => c.history,
            Self::Prometheus(c) => c.history,
        }
    }
}

pub struct DebugJsonCollector {
    client: reqwest::Client,
    endpoint: String,
    allowed: &'static [&'static str],
    history: Vec<BlockMetrics>,
}

impl DebugJsonCollector {
    pub fn new(metrics_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/debug/metrics", metrics_url.trim_end_matches('/')),
            allowed: GETH_METRIC_NAMES,
            history: Vec::new(),
        }
    }

    async fn collect(&mut self, metrics: &mut BlockMetrics) -> Result<(), Error> {
        let scrape = self.scrape(metrics).await;
        self.history.push(metrics.clone());
        scrape
    }

    async fn scrape(&self, metrics: &mut BlockMetrics) -> Result<(), Error> {
        let body: serde_json::Value = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .with_context(|| format!("failed to scrape {}", self.endpoint))?
            .json()
            .await
            .context("failed to decode debug metrics")?;

        let map = body
            .as_object()
            .ok_or_else(|| anyhow!("debug metrics response is not an object"))?;
        for name in self.allowed {
            if let Some(value) = map.get(*name).and_then(serde_json::Value::as_f64) {
                metrics.record(name, value);
            }
        }
        Ok(())
    }
}

pub struct PrometheusCollector {
    client: reqwest::Client,
    endpoint: String,
    allowed: &'static [&'static str],
    history: Vec<BlockMetrics>,
    // previous histogram readings, for delta averages across scrapes
    prev_sums: HashMap<String, f64>,
    prev_counts: HashMap<String, f64>,
}

impl PrometheusCollector {
    pub fn new(metrics_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/metrics", metrics_url.trim_end_matches('/')),
            allowed: RETH_METRIC_NAMES,
            history: Vec::new(),
            prev_sums: HashMap::new(),
            prev_counts: HashMap::new(),
        }
    }

    async fn collect(&mut self, metrics: &mut BlockMetrics) -> Result<(), Error> {
        let scrape = self.scrape(metrics).await;
        self.history.push(metrics.clone());
        scrape
    }

    async fn scrape(&mut self, metrics: &mut BlockMetrics) -> Result<(), Error> {
        let body = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .with_context(|| format!("failed to scrape {}", self.endpoint))?
            .text()
            .await
            .context("failed to read metrics response")?;

        self.merge_exposition(&body, metrics);
        Ok(())
    }

    fn merge_exposition(&mut self, body: &str, metrics: &mut BlockMetrics) {
        let samples = parse_exposition(body);
        for name in self.allowed {
            // plain gauge or counter sample
            if let Some(value) = samples.get(*name) {
                if value.is_finite() {
                    metrics.record(name, *value);
                }
                continue;
            }

            // histograms and summaries: average change in sum over change in
            // count since the previous scrape
            let (Some(sum), Some(count)) = (
                samples.get(&format!("{name}_sum")),
                samples.get(&format!("{name}_count")),
            ) else {
                debug!("Metric {name} not present in scrape");
                continue;
            };

            let prev_sum = self.prev_sums.get(*name).copied().unwrap_or(0.0);
            let prev_count = self.prev_counts.get(*name).copied().unwrap_or(0.0);
            let delta_count = count - prev_count;
            if delta_count != 0.0 {
                let average_change = (sum - prev_sum) / delta_count;
                if average_change.is_finite() {
                    metrics.record(name, average_change);
                }
            }
            self.prev_sums.insert((*name).to_string(), *sum);
            self.prev_counts.insert((*name).to_string(), *count);
        }
    }
}

/// Minimal Prometheus text-format parser: one `name[{labels}] value` sample
/// per line, comments skipped, labels discarded. Enough for the static
/// allow-lists above.
fn parse_exposition(body: &str) -> HashMap<String, f64> {
    let mut samples = HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name_part, rest)) = line.split_once(|c: char| c.is_whitespace() || c == '{')
        else {
            continue;
        };
        let value_part = match line[name_part.len()..].strip_prefix('{') {
            Some(after_brace) => match after_brace.split_once('}') {
                Some((_, v)) => v.trim(),
                None => continue,
            },
            None => rest.trim(),
        };
        let Some(value_str) = value_part.split_whitespace().next() else {
            continue;
        };
        if let Ok(value) = value_str.parse::<f64>() {
            samples.insert(name_part.to_string(), value);
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_debug_json_collector_filters_allow_list() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/debug/metrics")
            .with_body(
                json!({
                    "chain/execution.50-percentile": 1.5,
                    "chain/write.50-percentile": 0.25,
                    "system/cpu/sysload": 93.0,
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut collector = DebugJsonCollector::new(&server.url());
        let mut metrics = BlockMetrics::new(1);
        collector.collect(&mut metrics).await.expect("collect");

        assert_eq!(metrics.get("chain/execution.50-percentile"), Some(1.5));
        assert_eq!(metrics.get("chain/write.50-percentile"), Some(0.25));
        assert_eq!(metrics.get("system/cpu/sysload"), None);
        assert_eq!(collector.history.len(), 1);
    }

    #[tokio::test]
    async fn test_prometheus_collector_averages_histogram_deltas() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/metrics")
            .with_body(concat!(
                "# TYPE reth_sync_execution_execution_duration histogram\n",
                "reth_sync_execution_execution_duration_sum 10\n",
                "reth_sync_execution_execution_duration_count 5\n",
            ))
            .expect(1)
            .create_async()
            .await;

        let mut collector = PrometheusCollector::new(&server.url());
        let mut metrics = BlockMetrics::new(1);
        collector.collect(&mut metrics).await.expect("collect");
        assert_eq!(
            metrics.get("reth_sync_execution_execution_duration"),
            Some(2.0)
        );
        first.assert_async().await;

        // second scrape: only the delta since last time counts
        server
            .mock("GET", "/metrics")
            .with_body(concat!(
                "reth_sync_execution_execution_duration_sum 16\n",
                "reth_sync_execution_execution_duration_count 7\n",
            ))
            .create_async()
            .await;
        let mut metrics = BlockMetrics::new(2);
        collector.collect(&mut metrics).await.expect("collect");
        assert_eq!(
            metrics.get("reth_sync_execution_execution_duration"),
            Some(3.0)
        );
    }

    #[test]
    fn test_parse_exposition_handles_labels_and_comments() {
        let body = concat!(
            "# HELP something\n",
            "reth_sync_block_validation_state_root_duration{quantile=\"0.5\"} 0.125\n",
            "plain_gauge 7\n",
            "malformed_line\n",
        );
        let samples = parse_exposition(body);
        assert_eq!(
            samples.get("reth_sync_block_validation_state_root_duration"),
            Some(&0.125)
        );
        assert_eq!(samples.get("plain_gauge"), Some(&7.0));
        assert_eq!(samples.len(), 2);
    }
}
