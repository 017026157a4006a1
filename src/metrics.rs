//! Per-round counters exported to a Prometheus push gateway.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::info;
use uuid::Uuid;

use crate::config::MetricsConfig;
use crate::consistency::DiscrepancyKind;
use crate::errors::{HarnessError, HarnessResult};
use crate::summary::RunSummary;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

type Labels = Vec<(String, String)>;

pub struct RoundMetrics {
    registry: Registry,
    responses: Family<Labels, Counter>,
    successes: Family<Labels, Counter>,
    discrepancies: Family<Labels, Counter>,
}

impl RoundMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let responses = Family::<Labels, Counter>::default();
        registry.register(
            "onion_layer_responses",
            "Responses received per layer grouped by HTTP status (0 for transport failures)",
            responses.clone(),
        );

        let successes = Family::<Labels, Counter>::default();
        registry.register(
            "onion_layer_successes",
            "2xx responses whose body was read completely, per layer",
            successes.clone(),
        );

        let discrepancies = Family::<Labels, Counter>::default();
        registry.register(
            "onion_pair_discrepancies",
            "Discrepancies per compared layer pair grouped by kind",
            discrepancies.clone(),
        );

        Self {
            registry,
            responses,
            successes,
            discrepancies,
        }
    }

    pub fn from_summary(summary: &RunSummary) -> Self {
        let metrics = Self::new();
        for (layer, tally) in &summary.layers {
            for (code, count) in &tally.status_codes {
                metrics
                    .responses
                    .get_or_create(&vec![
                        ("layer".to_string(), layer.to_string()),
                        ("code".to_string(), code.to_string()),
                    ])
                    .inc_by(*count);
            }
            metrics
                .successes
                .get_or_create(&vec![("layer".to_string(), layer.to_string())])
                .inc_by(tally.successful_reads);
        }
        for (key, tally) in &summary.pairs {
            for kind in DiscrepancyKind::ALL {
                metrics
                    .discrepancies
                    .get_or_create(&vec![
                        ("pair".to_string(), key.clone()),
                        ("kind".to_string(), kind.file_stem().to_string()),
                    ])
                    .inc_by(tally.mismatches(kind));
            }
        }
        metrics
    }

    pub fn encode(&self) -> HarnessResult<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|err| HarnessError::Metrics(format!("encode metrics: {err}")))?;
        Ok(buffer)
    }
}

impl Default for RoundMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn push_url(config: &MetricsConfig, run_id: Uuid, round: u32) -> String {
    format!(
        "{}/metrics/job/{}/run_id/{run_id}/round/{round}",
        config.push_gateway.trim_end_matches('/'),
        config.job
    )
}

/// Replaces the `(job, run_id, round)` group on the push gateway.
pub async fn push(
    client: &Client,
    config: &MetricsConfig,
    run_id: Uuid,
    round: u32,
    metrics: &RoundMetrics,
) -> HarnessResult<()> {
    let url = push_url(config, run_id, round);
    let body = metrics.encode()?;
    let response = client
        .put(&url)
        .header(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .map_err(|err| HarnessError::Metrics(format!("push to {url}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(HarnessError::Metrics(format!(
            "push gateway {url} answered {status}"
        )));
    }
    info!(target = "onion::metrics", %url, "metrics pushed");
    Ok(())
}
