//! Bounded fan-out of logical requests to every configured layer.
//!
//! At most `concurrency` paths are in flight. Inside a path every layer is
//! called on its own task and the path only completes once all of those
//! tasks have been joined; the set is then finalized on the path task.
//! Each call produces exactly one [`LayerResult`], whatever happens to it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use reqwest::header::HeaderMap;
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::errors::HarnessResult;
use crate::layer::LayerId;
use crate::request::LogicalRequest;
use crate::store::{LayerResult, ResultStore};

const PROGRESS_EVERY: u64 = 100;

/// Live counters for one dispatch run.
#[derive(Debug, Default)]
pub struct DispatchStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    total_paths: AtomicU64,
    completed: BTreeMap<LayerId, AtomicU64>,
}

impl DispatchStats {
    pub fn new(layers: &[LayerId]) -> Self {
        Self {
            completed: layers
                .iter()
                .map(|layer| (*layer, AtomicU64::new(0)))
                .collect(),
            ..Self::default()
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously outstanding layer calls seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self, layer: LayerId) -> u64 {
        self.completed
            .get(&layer)
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }

    fn begin_call(&self) -> InFlightCall<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlightCall { stats: self }
    }

    fn layer_completed(&self, layer: LayerId) {
        let Some(counter) = self.completed.get(&layer) else {
            return;
        };
        let done = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total_paths.load(Ordering::SeqCst);
        if done == total || done % PROGRESS_EVERY == 0 {
            info!(
                target = "onion::dispatch",
                layer = %layer.label(),
                done,
                total,
                "layer progress"
            );
        } else {
            debug!(target = "onion::dispatch", layer = %layer, done, total, "layer call completed");
        }
    }
}

struct InFlightCall<'a> {
    stats: &'a DispatchStats,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub paths: usize,
    /// Paths whose task did not finish cleanly and had missing slots filled afterwards.
    pub repaired: Vec<String>,
    pub peak_in_flight: usize,
}

pub fn build_client(config: &HarnessConfig) -> HarnessResult<Client> {
    let client = Client::builder()
        .timeout(config.request_timeout())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()?;
    Ok(client)
}

#[derive(Clone)]
struct PathContext {
    client: Client,
    store: Arc<ResultStore>,
    stats: Arc<DispatchStats>,
}

pub struct Dispatcher {
    client: Client,
    store: Arc<ResultStore>,
    concurrency: usize,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(client: Client, store: Arc<ResultStore>, concurrency: usize) -> Self {
        let stats = Arc::new(DispatchStats::new(store.layers()));
        Self {
            client,
            store,
            concurrency: concurrency.max(1),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub async fn dispatch(&self, requests: &[LogicalRequest]) -> HarnessResult<DispatchReport> {
        self.stats
            .total_paths
            .store(requests.len() as u64, Ordering::SeqCst);
        info!(
            target = "onion::dispatch",
            paths = requests.len(),
            layers = self.store.layers().len(),
            concurrency = self.concurrency,
            "dispatching requests"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let context = PathContext {
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
        };

        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            self.store.open(request.path());
            let semaphore = Arc::clone(&semaphore);
            let context = context.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                run_path(context, request).await;
            }));
        }

        for (request, outcome) in requests.iter().zip(join_all(handles).await) {
            if let Err(err) = outcome {
                error!(
                    target = "onion::dispatch",
                    path = %request.path(),
                    %err,
                    "path task aborted"
                );
            }
        }

        let repaired = self.repair(requests).await?;
        Ok(DispatchReport {
            paths: requests.len(),
            repaired,
            peak_in_flight: self.stats.peak_in_flight(),
        })
    }

    /// Completes and finalizes any path a crashed task left behind.
    async fn repair(&self, requests: &[LogicalRequest]) -> HarnessResult<Vec<String>> {
        let unfinalized = self.store.unfinalized_paths();
        for path in &unfinalized {
            let urls = requests
                .iter()
                .find(|request| request.path() == path)
                .map(|request| request.target_urls().clone())
                .unwrap_or_default();
            let filled = self.store.fill_missing(
                path,
                &urls,
                "layer call aborted: path task did not complete",
            )?;
            warn!(
                target = "onion::dispatch",
                path = %path,
                filled = ?filled,
                "repairing incomplete result set"
            );
            self.store.finalize(path).await?;
        }
        Ok(unfinalized)
    }
}

async fn run_path(context: PathContext, request: LogicalRequest) {
    let path = request.path().to_string();
    let calls = request
        .targets()
        .map(|(layer, url)| {
            let url = url.to_string();
            let context = context.clone();
            let path = path.clone();
            let handle = tokio::spawn({
                let url = url.clone();
                async move {
                    let result = {
                        let _call = context.stats.begin_call();
                        fetch_layer(&context.client, layer, url).await
                    };
                    record(&context, &path, result);
                }
            });
            (layer, url, handle)
        })
        .collect::<Vec<_>>();

    for (layer, url, handle) in calls {
        if let Err(err) = handle.await {
            let result =
                LayerResult::transport_failure(layer, url, format!("layer call aborted: {err}"));
            record(&context, &path, result);
        }
    }

    match context.store.finalize(&path).await {
        Ok(evaluation) => {
            for discrepancy in &evaluation.discrepancies {
                debug!(
                    target = "onion::dispatch",
                    path = %discrepancy.path,
                    pair = %discrepancy.pair.key(),
                    kind = ?discrepancy.kind,
                    "discrepancy"
                );
            }
        }
        Err(err) => {
            error!(target = "onion::dispatch", path = %path, %err, "finalize failed");
        }
    }
}

fn record(context: &PathContext, path: &str, result: LayerResult) {
    let layer = result.layer;
    match context.store.record(path, result) {
        Ok(_) => context.stats.layer_completed(layer),
        Err(err) => {
            error!(target = "onion::dispatch", path, layer = %layer, %err, "dropping layer result");
        }
    }
}

/// Performs one GET and captures whatever came back. Never fails.
pub async fn fetch_layer(client: &Client, layer: LayerId, url: String) -> LayerResult {
    let mut result = LayerResult::new(layer, url);
    let response = match client.get(&result.url).send().await {
        Ok(response) => response,
        Err(err) => {
            result.error_body = Some(format!("error sending request: {err}"));
            return result;
        }
    };

    let status = response.status();
    result.status = status.as_u16();
    result.headers = collect_headers(response.headers());

    if status.is_success() {
        match response.bytes().await {
            Ok(body) => {
                result.response_size = body.len() as u64;
                result.body = Some(body);
            }
            Err(err) => {
                result.body_read_error = Some(format!("error reading response body: {err}"));
            }
        }
    } else {
        result.error_body = Some(match response.text().await {
            Ok(text) => text,
            Err(err) => format!("error reading error body: {err}"),
        });
    }
    result
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        collected
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    collected
}
