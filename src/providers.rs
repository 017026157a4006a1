//! Provider breakdown of mismatched paths.
//!
//! For every path a pair disagreed on, the content id is looked up on an
//! indexer (`GET {endpoint}/cid/{cid}`) and sorted by who advertises it.
//! Each id is tried a bounded number of times; ids that never get an answer
//! are counted as unresolved instead of holding up the round.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ProviderLookupConfig;
use crate::consistency::{Discrepancy, DiscrepancyKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderClass {
    /// The indexer has no record of the content id.
    NotFound,
    DagHouse,
    Pinata,
    Other,
    /// No answer after every attempt.
    Unresolved,
}

impl ProviderClass {
    fn from_records(records: &str) -> Self {
        if records.contains("dag.w3s") || records.contains("dag.house") {
            ProviderClass::DagHouse
        } else if records.contains("pinata.cloud") {
            ProviderClass::Pinata
        } else {
            ProviderClass::Other
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProviderBreakdown {
    pub not_found: u64,
    pub dag_house: u64,
    pub pinata: u64,
    pub other: u64,
    pub unresolved: u64,
}

impl ProviderBreakdown {
    fn count(&mut self, class: ProviderClass) {
        let counter = match class {
            ProviderClass::NotFound => &mut self.not_found,
            ProviderClass::DagHouse => &mut self.dag_house,
            ProviderClass::Pinata => &mut self.pinata,
            ProviderClass::Other => &mut self.other,
            ProviderClass::Unresolved => &mut self.unresolved,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.not_found + self.dag_house + self.pinata + self.other + self.unresolved
    }
}

/// `/ipfs/<cid>/rest` -> `<cid>`.
pub fn cid_from_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("/ipfs/")?;
    rest.split(|c: char| c == '/' || c == '?').next().filter(|cid| !cid.is_empty())
}

pub struct ProviderLookup {
    client: Client,
    endpoint: String,
    attempts: u32,
    retry_delay: Duration,
    concurrency: usize,
}

impl ProviderLookup {
    pub fn new(client: Client, config: &ProviderLookupConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            concurrency: config.concurrency.max(1),
        }
    }

    async fn query(&self, cid: &str) -> Result<ProviderClass, reqwest::Error> {
        let response = self
            .client
            .get(format!("{}/cid/{cid}", self.endpoint))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(ProviderClass::NotFound),
            StatusCode::OK => Ok(ProviderClass::from_records(&response.text().await?)),
            _ => Ok(ProviderClass::Other),
        }
    }

    pub async fn classify(&self, cid: &str) -> ProviderClass {
        for attempt in 1..=self.attempts {
            match self.query(cid).await {
                Ok(class) => {
                    debug!(target = "onion::providers", cid, ?class, "provider lookup");
                    return class;
                }
                Err(err) => {
                    warn!(
                        target = "onion::providers",
                        cid,
                        attempt,
                        attempts = self.attempts,
                        "provider lookup failed: {err}"
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        ProviderClass::Unresolved
    }

    /// Per-pair breakdown over the status and content mismatches. Each content id is looked up once.
    pub async fn breakdown(&self, discrepancies: &[Discrepancy]) -> BTreeMap<String, ProviderBreakdown> {
        let mismatches: BTreeMap<String, BTreeSet<&str>> =
            discrepancies
                .iter()
                .filter(|discrepancy| discrepancy.kind != DiscrepancyKind::DecodeError)
                .fold(BTreeMap::new(), |mut by_pair, discrepancy| {
                    by_pair
                        .entry(discrepancy.pair.key())
                        .or_insert_with(BTreeSet::new)
                        .insert(discrepancy.path.as_str());
                    by_pair
                });

        let cids: BTreeSet<&str> = mismatches
            .values()
            .flatten()
            .filter_map(|path| cid_from_path(*path))
            .collect();
        let limiter = Semaphore::new(self.concurrency);
        let classes: BTreeMap<&str, ProviderClass> = join_all(cids.into_iter().map(|cid| {
            let limiter = &limiter;
            async move {
                let _permit = limiter.acquire().await;
                (cid, self.classify(cid).await)
            }
        }))
        .await
        .into_iter()
        .collect();

        mismatches
            .into_iter()
            .map(|(pair, paths)| {
                let mut breakdown = ProviderBreakdown::default();
                for path in paths {
                    let class = cid_from_path(path)
                        .and_then(|cid| classes.get(cid).copied())
                        .unwrap_or(ProviderClass::Unresolved);
                    breakdown.count(class);
                }
                (pair, breakdown)
            })
            .collect()
    }
}
