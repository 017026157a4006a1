use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::consistency::ConsistencyEngine;
use crate::dispatch::{build_client, DispatchReport, Dispatcher};
use crate::errors::HarnessResult;
use crate::layer::Encoding;
use crate::metrics::{self, RoundMetrics};
use crate::normalizer::{CommandNormalizer, NormalizerRegistry};
use crate::providers::ProviderLookup;
use crate::report::ReportEmitter;
use crate::request::{build_requests, read_replay_log, EndpointResolver, LogicalRequest};
use crate::store::ResultStore;
use crate::summary::RunSummary;

#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub round: u32,
    pub dir: PathBuf,
    pub summary: RunSummary,
    pub dispatch: DispatchReport,
}

pub struct Harness {
    config: HarnessConfig,
    client: Client,
    resolver: EndpointResolver,
    engine: Arc<ConsistencyEngine>,
    emitter: ReportEmitter,
    providers: Option<ProviderLookup>,
    run_id: Uuid,
}

impl Harness {
    /// Validates `config` and prepares everything short of network activity.
    pub fn new(config: HarnessConfig, output_dir: impl Into<PathBuf>, run_id: Uuid) -> HarnessResult<Self> {
        config.validate()?;
        let client = build_client(&config)?;
        let resolver = EndpointResolver::from_config(&config)?;
        let engine = Arc::new(engine_for(&config, normalizers_for(&config)));
        let providers = config
            .provider_lookup
            .as_ref()
            .map(|lookup| ProviderLookup::new(client.clone(), lookup));
        Ok(Self {
            config,
            client,
            resolver,
            engine,
            emitter: ReportEmitter::new(output_dir),
            providers,
            run_id,
        })
    }

    /// Replaces the normalizers built from configuration.
    pub fn with_normalizers(mut self, normalizers: NormalizerRegistry) -> Self {
        self.engine = Arc::new(engine_for(&self.config, normalizers));
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn load_requests(&self, replay_file: &Path, count: usize) -> HarnessResult<Vec<LogicalRequest>> {
        let sources = read_replay_log(replay_file, &self.config.replay)?;
        let requests = build_requests(&sources, &self.resolver, count)?;
        info!(
            target = "onion::runner",
            replay = %replay_file.display(),
            sources = sources.len(),
            requests = requests.len(),
            "loaded replay log"
        );
        Ok(requests)
    }

    pub async fn run(&self, requests: &[LogicalRequest], rounds: u32) -> HarnessResult<Vec<RoundOutcome>> {
        let mut outcomes = Vec::with_capacity(rounds as usize);
        for round in 1..=rounds {
            outcomes.push(self.run_round(round, requests).await?);
        }
        Ok(outcomes)
    }

    pub async fn run_round(&self, round: u32, requests: &[LogicalRequest]) -> HarnessResult<RoundOutcome> {
        info!(
            target = "onion::runner",
            run_id = %self.run_id,
            round,
            paths = requests.len(),
            "starting round"
        );

        let store = Arc::new(ResultStore::new(self.config.layer_ids(), Arc::clone(&self.engine)));
        let dispatcher = Dispatcher::new(self.client.clone(), Arc::clone(&store), self.config.concurrency);
        let dispatch = dispatcher.dispatch(requests).await?;
        if !dispatch.repaired.is_empty() {
            warn!(
                target = "onion::runner",
                round,
                repaired = dispatch.repaired.len(),
                "some paths were completed with synthesized failures"
            );
        }

        let mut snapshot = store.snapshot();
        if let Some(lookup) = &self.providers {
            snapshot.summary.providers = lookup.breakdown(&snapshot.discrepancies).await;
        }
        let dir = self
            .emitter
            .emit(round, &snapshot, store.layers(), self.engine.graph())
            .await?;
        println!("{}", snapshot.summary);

        if let Some(metrics_config) = &self.config.metrics {
            let counters = RoundMetrics::from_summary(&snapshot.summary);
            if let Err(err) = metrics::push(&self.client, metrics_config, self.run_id, round, &counters).await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(target = "onion::runner", round, "metrics push failed: {err}");
            }
        }

        Ok(RoundOutcome {
            round,
            dir,
            summary: snapshot.summary,
            dispatch,
        })
    }
}

fn normalizers_for(config: &HarnessConfig) -> NormalizerRegistry {
    let mut registry = NormalizerRegistry::new();
    if let Some(decoder) = config
        .normalizer
        .car_command
        .as_deref()
        .and_then(|argv| CommandNormalizer::from_argv(argv, config.decode_timeout()))
    {
        registry.register(Encoding::Car, Arc::new(decoder));
    }
    registry
}

fn engine_for(config: &HarnessConfig, normalizers: NormalizerRegistry) -> ConsistencyEngine {
    ConsistencyEngine::new(
        config.comparison_graph(),
        config.mode,
        config.encodings(),
        normalizers,
    )
}
