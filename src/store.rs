//! Shared per-path result storage.
//!
//! Layer calls for one path finish in any order and on any worker. Every
//! mutation goes through one lock. Finalization decodes bodies outside the
//! lock, then evaluates, updates the summary and releases bodies inside one
//! critical section, so a path is evaluated exactly once and never against a
//! partially populated set.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::consistency::{ConsistencyEngine, Discrepancy, DiscrepancyKind, PathEvaluation};
use crate::layer::LayerId;
use crate::summary::RunSummary;

/// Outcome of one call to one layer for one path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LayerResult {
    #[serde(skip)]
    pub layer: LayerId,
    pub url: String,
    /// HTTP status, or 0 when no response was received.
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_read_error: Option<String>,
    pub response_size: u64,
    #[serde(skip)]
    pub body: Option<Bytes>,
}

impl LayerResult {
    pub fn new(layer: LayerId, url: impl Into<String>) -> Self {
        Self {
            layer,
            url: url.into(),
            status: 0,
            headers: BTreeMap::new(),
            error_body: None,
            body_read_error: None,
            response_size: 0,
            body: None,
        }
    }

    /// A call that never produced a response.
    pub fn transport_failure(layer: LayerId, url: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::new(layer, url);
        result.error_body = Some(message.into());
        result
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_transport_failure(&self) -> bool {
        self.status == 0
    }

    pub fn read_succeeded(&self) -> bool {
        self.is_success() && self.body_read_error.is_none()
    }

    pub fn without_body(&self) -> Self {
        let mut result = self.clone();
        result.body = None;
        result
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("layer {layer} is not configured for path {path}")]
    UnknownLayer { path: String, layer: LayerId },
    #[error("result for layer {layer} on path {path} was already recorded")]
    SlotAlreadySet { path: String, layer: LayerId },
    #[error("path {0} has no result set")]
    UnknownPath(String),
    #[error("path {path} is missing results for {missing:?}")]
    Incomplete { path: String, missing: Vec<LayerId> },
    #[error("path {0} was already finalized")]
    AlreadyFinalized(String),
}

/// All layer results collected for one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultSet {
    path: String,
    slots: BTreeMap<LayerId, Option<LayerResult>>,
    finalized: bool,
}

impl ResultSet {
    pub fn new(path: impl Into<String>, layers: &[LayerId]) -> Self {
        Self {
            path: path.into(),
            slots: layers.iter().map(|layer| (*layer, None)).collect(),
            finalized: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get(&self, layer: LayerId) -> Option<&LayerResult> {
        self.slots.get(&layer).and_then(Option::as_ref)
    }

    /// Fills the slot for `result.layer`. Each slot is written once.
    pub fn set(&mut self, result: LayerResult) -> Result<(), StoreError> {
        if self.finalized {
            return Err(StoreError::AlreadyFinalized(self.path.clone()));
        }
        let slot = self
            .slots
            .get_mut(&result.layer)
            .ok_or_else(|| StoreError::UnknownLayer {
                path: self.path.clone(),
                layer: result.layer,
            })?;
        if slot.is_some() {
            return Err(StoreError::SlotAlreadySet {
                path: self.path.clone(),
                layer: result.layer,
            });
        }
        *slot = Some(result);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.values().all(Option::is_some)
    }

    pub fn missing_layers(&self) -> Vec<LayerId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(layer, _)| *layer)
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn results(&self) -> impl Iterator<Item = &LayerResult> {
        self.slots.values().filter_map(Option::as_ref)
    }

    fn release_bodies(&mut self) {
        for result in self.slots.values_mut().flatten() {
            result.body = None;
        }
    }
}

/// Raw body of a layer whose archive could not be decoded, kept for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedArchive {
    pub path: String,
    pub layer: LayerId,
    pub body: Bytes,
}

/// Point-in-time copy of the store, taken once a round has drained.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    pub sets: BTreeMap<String, ResultSet>,
    pub discrepancies: Vec<Discrepancy>,
    pub archives: Vec<FailedArchive>,
    pub summary: RunSummary,
}

struct StoreInner {
    sets: BTreeMap<String, ResultSet>,
    discrepancies: Vec<Discrepancy>,
    archives: Vec<FailedArchive>,
    summary: RunSummary,
}

pub struct ResultStore {
    layers: Vec<LayerId>,
    engine: Arc<ConsistencyEngine>,
    inner: Mutex<StoreInner>,
}

impl ResultStore {
    pub fn new(layers: Vec<LayerId>, engine: Arc<ConsistencyEngine>) -> Self {
        let summary = RunSummary::new(&layers, engine.graph());
        Self {
            layers,
            engine,
            inner: Mutex::new(StoreInner {
                sets: BTreeMap::new(),
                discrepancies: Vec::new(),
                archives: Vec::new(),
                summary,
            }),
        }
    }

    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }

    pub fn engine(&self) -> &ConsistencyEngine {
        &self.engine
    }

    /// Creates the result set for `path` if it does not exist yet.
    pub fn open(&self, path: &str) {
        let mut inner = self.inner.lock();
        if !inner.sets.contains_key(path) {
            inner
                .sets
                .insert(path.to_string(), ResultSet::new(path, &self.layers));
        }
    }

    /// Records one layer result. Returns whether the set is now complete.
    pub fn record(&self, path: &str, result: LayerResult) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let set = inner
            .sets
            .entry(path.to_string())
            .or_insert_with(|| ResultSet::new(path, &self.layers));
        set.set(result)?;
        Ok(set.is_complete())
    }

    /// Evaluates a complete set, folds it into the running summary and drops its bodies.
    ///
    /// Bodies are decoded without holding the store lock; only the final
    /// evaluation and bookkeeping run under it.
    pub async fn finalize(&self, path: &str) -> Result<PathEvaluation, StoreError> {
        let pending = {
            let inner = self.inner.lock();
            let set = inner
                .sets
                .get(path)
                .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
            if set.finalized {
                return Err(StoreError::AlreadyFinalized(path.to_string()));
            }
            let missing = set.missing_layers();
            if !missing.is_empty() {
                return Err(StoreError::Incomplete {
                    path: path.to_string(),
                    missing,
                });
            }
            // A complete set accepts no further writes, so this copy stays current.
            set.clone()
        };
        let normalized = self.engine.normalize(&pending).await;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let set = inner
            .sets
            .get_mut(path)
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
        if set.finalized {
            return Err(StoreError::AlreadyFinalized(path.to_string()));
        }

        let evaluation = self.engine.evaluate_normalized(set, &normalized)?;
        inner.summary.absorb(&evaluation);
        for discrepancy in &evaluation.discrepancies {
            if discrepancy.kind != DiscrepancyKind::DecodeError {
                continue;
            }
            for layer in &discrepancy.layers {
                let kept = inner
                    .archives
                    .iter()
                    .any(|archive| archive.path == path && archive.layer == *layer);
                if kept {
                    continue;
                }
                if let Some(body) = set.get(*layer).and_then(|result| result.body.clone()) {
                    inner.archives.push(FailedArchive {
                        path: path.to_string(),
                        layer: *layer,
                        body,
                    });
                }
            }
        }
        inner
            .discrepancies
            .extend(evaluation.discrepancies.iter().cloned());
        set.release_bodies();
        set.finalized = true;
        Ok(evaluation)
    }

    /// Fills every empty slot of `path` with a status-0 result. Returns the filled layers.
    pub fn fill_missing(
        &self,
        path: &str,
        urls: &BTreeMap<LayerId, String>,
        reason: &str,
    ) -> Result<Vec<LayerId>, StoreError> {
        let mut inner = self.inner.lock();
        let set = inner
            .sets
            .get_mut(path)
            .ok_or_else(|| StoreError::UnknownPath(path.to_string()))?;
        let missing = set.missing_layers();
        for layer in &missing {
            let url = urls.get(layer).cloned().unwrap_or_default();
            set.set(LayerResult::transport_failure(*layer, url, reason))?;
        }
        Ok(missing)
    }

    pub fn unfinalized_paths(&self) -> Vec<String> {
        self.inner
            .lock()
            .sets
            .values()
            .filter(|set| !set.finalized)
            .map(|set| set.path.clone())
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        self.inner.lock().summary.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock();
        StoreSnapshot {
            sets: inner.sets.clone(),
            discrepancies: inner.discrepancies.clone(),
            archives: inner.archives.clone(),
            summary: inner.summary.clone(),
        }
    }
}
