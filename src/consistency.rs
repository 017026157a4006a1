//! Cross-layer consistency rules.
//!
//! A fully populated [`ResultSet`] is judged along two axes for every
//! configured [`Comparison`]:
//!
//! * status: a pair disagrees when exactly one side answered 2xx;
//! * content: when both sides answered 2xx with a clean body read, their
//!   bodies are normalized according to each layer's [`Encoding`] and compared
//!   byte for byte.
//!
//! A 2xx whose body could not be read excludes that layer from every
//! comparison on the path. A status disagreement suppresses the content axis,
//! and a normalizer failure is reported as a decode error rather than as a
//! content mismatch.
//!
//! Normalization may run external decoders, so it is a separate async step
//! ([`ConsistencyEngine::normalize`]) whose output feeds the pure
//! [`ConsistencyEngine::evaluate_normalized`].

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::layer::{Encoding, LayerId, LayerPair};
use crate::normalizer::{DecodeError, NormalizerRegistry};
use crate::store::{LayerResult, ResultSet, StoreError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonMode {
    #[default]
    StatusAndContent,
    StatusOnly,
}

/// One edge of the comparison graph. The candidate is judged against the reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub pair: LayerPair,
    pub content: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComparisonGraph {
    comparisons: Vec<Comparison>,
}

impl ComparisonGraph {
    pub fn new(comparisons: Vec<Comparison>) -> Self {
        Self { comparisons }
    }

    /// Every other layer judged against `reference`.
    pub fn star(reference: LayerId, layers: &[LayerId]) -> Self {
        Self::new(
            layers
                .iter()
                .filter(|layer| **layer != reference)
                .map(|layer| Comparison {
                    pair: LayerPair::new(reference, *layer),
                    content: true,
                })
                .collect(),
        )
    }

    /// Each layer judged against its predecessor.
    pub fn chain(layers: &[LayerId]) -> Self {
        Self::new(
            layers
                .windows(2)
                .map(|window| Comparison {
                    pair: LayerPair::new(window[0], window[1]),
                    content: true,
                })
                .collect(),
        )
    }

    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }

    pub fn pairs(&self) -> impl Iterator<Item = LayerPair> + '_ {
        self.comparisons.iter().map(|comparison| comparison.pair)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscrepancyKind {
    StatusMismatch,
    ContentMismatch,
    DecodeError,
}

impl DiscrepancyKind {
    pub const ALL: [DiscrepancyKind; 3] = [
        DiscrepancyKind::StatusMismatch,
        DiscrepancyKind::ContentMismatch,
        DiscrepancyKind::DecodeError,
    ];

    /// Plural stem used in report file names.
    pub fn file_stem(self) -> &'static str {
        match self {
            DiscrepancyKind::StatusMismatch => "status-mismatches",
            DiscrepancyKind::ContentMismatch => "content-mismatches",
            DiscrepancyKind::DecodeError => "decode-errors",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub path: String,
    pub kind: DiscrepancyKind,
    pub pair: LayerPair,
    /// Layers at fault; both sides for mismatches, the failing side(s) for decode errors.
    pub layers: Vec<LayerId>,
    /// The two compared results, bodies stripped.
    pub results: BTreeMap<LayerId, LayerResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerOutcome {
    /// 2xx with the whole body read.
    Success,
    /// 2xx but the body read failed.
    ReadError,
    /// Non-2xx, including transport failures recorded as status 0.
    Failed,
}

impl LayerOutcome {
    pub fn classify(result: &LayerResult) -> Self {
        if !result.is_success() {
            LayerOutcome::Failed
        } else if result.body_read_error.is_some() {
            LayerOutcome::ReadError
        } else {
            LayerOutcome::Success
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairOutcome {
    Excluded,
    StatusMismatch,
    BothFailed,
    StatusOnly,
    ContentMatch,
    ContentMismatch,
    DecodeError,
}

/// What the status axis alone decides for a pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairStage {
    Decided(PairOutcome),
    CompareContent,
}

pub fn classify_pair(reference: LayerOutcome, candidate: LayerOutcome, content: bool) -> PairStage {
    use LayerOutcome::{Failed, ReadError, Success};

    match (reference, candidate) {
        (ReadError, _) | (_, ReadError) => PairStage::Decided(PairOutcome::Excluded),
        (Success, Failed) | (Failed, Success) => PairStage::Decided(PairOutcome::StatusMismatch),
        (Failed, Failed) => PairStage::Decided(PairOutcome::BothFailed),
        (Success, Success) if !content => PairStage::Decided(PairOutcome::StatusOnly),
        (Success, Success) => PairStage::CompareContent,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LayerObservation {
    pub outcome: LayerOutcome,
    pub status: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PairVerdict {
    pub pair: LayerPair,
    pub outcome: PairOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathEvaluation {
    pub path: String,
    pub layers: BTreeMap<LayerId, LayerObservation>,
    pub pairs: Vec<PairVerdict>,
    pub discrepancies: Vec<Discrepancy>,
}

pub struct ConsistencyEngine {
    graph: ComparisonGraph,
    mode: ComparisonMode,
    encodings: BTreeMap<LayerId, Encoding>,
    normalizers: NormalizerRegistry,
}

/// Canonical bytes per layer, for the layers that take part in a content comparison.
pub type NormalizedBodies = BTreeMap<LayerId, Result<Bytes, DecodeError>>;

impl ConsistencyEngine {
    pub fn new(
        graph: ComparisonGraph,
        mode: ComparisonMode,
        encodings: BTreeMap<LayerId, Encoding>,
        normalizers: NormalizerRegistry,
    ) -> Self {
        Self {
            graph,
            mode,
            encodings,
            normalizers,
        }
    }

    pub fn graph(&self) -> &ComparisonGraph {
        &self.graph
    }

    pub fn mode(&self) -> ComparisonMode {
        self.mode
    }

    pub fn content_enabled(&self, comparison: &Comparison) -> bool {
        self.mode == ComparisonMode::StatusAndContent && comparison.content
    }

    fn encoding(&self, layer: LayerId) -> Encoding {
        self.encodings.get(&layer).copied().unwrap_or_default()
    }

    fn stage(&self, comparison: &Comparison, reference: &LayerResult, candidate: &LayerResult) -> PairStage {
        classify_pair(
            LayerOutcome::classify(reference),
            LayerOutcome::classify(candidate),
            self.content_enabled(comparison),
        )
    }

    /// Decodes the body of every layer that reaches the content axis on some pair.
    pub async fn normalize(&self, set: &ResultSet) -> NormalizedBodies {
        let mut layers = BTreeSet::new();
        for comparison in self.graph.comparisons() {
            let pair = comparison.pair;
            let (Some(reference), Some(candidate)) = (set.get(pair.reference), set.get(pair.candidate))
            else {
                continue;
            };
            if self.stage(comparison, reference, candidate) == PairStage::CompareContent {
                layers.extend([pair.reference, pair.candidate]);
            }
        }

        let decodes = layers
            .into_iter()
            .filter_map(|layer| set.get(layer))
            .map(|result| async move {
                let normalized = match &result.body {
                    Some(body) => {
                        self.normalizers
                            .normalize(body, self.encoding(result.layer))
                            .await
                    }
                    None => Err(DecodeError::Unavailable(
                        "response body is no longer retained".to_string(),
                    )),
                };
                (result.layer, normalized)
            });
        join_all(decodes).await.into_iter().collect()
    }

    /// Normalizes and evaluates in one step.
    pub async fn evaluate(&self, set: &ResultSet) -> Result<PathEvaluation, StoreError> {
        let normalized = self.normalize(set).await;
        self.evaluate_normalized(set, &normalized)
    }

    /// Judges a complete set against bodies produced by [`Self::normalize`].
    pub fn evaluate_normalized(
        &self,
        set: &ResultSet,
        normalized: &NormalizedBodies,
    ) -> Result<PathEvaluation, StoreError> {
        let missing = set.missing_layers();
        if !missing.is_empty() {
            return Err(StoreError::Incomplete {
                path: set.path().to_string(),
                missing,
            });
        }

        let layers = set
            .results()
            .map(|result| {
                (
                    result.layer,
                    LayerObservation {
                        outcome: LayerOutcome::classify(result),
                        status: result.status,
                    },
                )
            })
            .collect();

        let mut pairs = Vec::with_capacity(self.graph.comparisons().len());
        let mut discrepancies = Vec::new();

        for comparison in self.graph.comparisons() {
            let pair = comparison.pair;
            let lookup = |layer: LayerId| {
                set.get(layer).ok_or_else(|| StoreError::Incomplete {
                    path: set.path().to_string(),
                    missing: vec![layer],
                })
            };
            let reference = lookup(pair.reference)?;
            let candidate = lookup(pair.candidate)?;

            let outcome = match self.stage(comparison, reference, candidate) {
                PairStage::Decided(PairOutcome::StatusMismatch) => {
                    discrepancies.push(discrepancy(
                        set.path(),
                        DiscrepancyKind::StatusMismatch,
                        pair,
                        vec![pair.reference, pair.candidate],
                        reference,
                        candidate,
                        Some(format!(
                            "{} answered {}, {} answered {}",
                            pair.reference, reference.status, pair.candidate, candidate.status
                        )),
                    ));
                    PairOutcome::StatusMismatch
                }
                PairStage::Decided(outcome) => outcome,
                PairStage::CompareContent => {
                    let (outcome, found) =
                        self.compare_content(set.path(), pair, reference, candidate, normalized);
                    discrepancies.extend(found);
                    outcome
                }
            };
            pairs.push(PairVerdict { pair, outcome });
        }

        Ok(PathEvaluation {
            path: set.path().to_string(),
            layers,
            pairs,
            discrepancies,
        })
    }

    fn compare_content(
        &self,
        path: &str,
        pair: LayerPair,
        reference: &LayerResult,
        candidate: &LayerResult,
        normalized: &NormalizedBodies,
    ) -> (PairOutcome, Option<Discrepancy>) {
        let reference_bytes = normalized_body(reference.layer, normalized);
        let candidate_bytes = normalized_body(candidate.layer, normalized);

        match (reference_bytes, candidate_bytes) {
            (Ok(expected), Ok(actual)) if expected == actual => (PairOutcome::ContentMatch, None),
            (Ok(expected), Ok(actual)) => {
                let detail = format!(
                    "{} has {} canonical bytes, {} has {}",
                    pair.reference,
                    expected.len(),
                    pair.candidate,
                    actual.len()
                );
                (
                    PairOutcome::ContentMismatch,
                    Some(discrepancy(
                        path,
                        DiscrepancyKind::ContentMismatch,
                        pair,
                        vec![pair.reference, pair.candidate],
                        reference,
                        candidate,
                        Some(detail),
                    )),
                )
            }
            (reference_bytes, candidate_bytes) => {
                let mut failing = Vec::new();
                let mut details = Vec::new();
                for (layer, outcome) in [
                    (pair.reference, reference_bytes),
                    (pair.candidate, candidate_bytes),
                ] {
                    if let Err(err) = outcome {
                        failing.push(layer);
                        details.push(format!("{layer}: {err}"));
                    }
                }
                (
                    PairOutcome::DecodeError,
                    Some(discrepancy(
                        path,
                        DiscrepancyKind::DecodeError,
                        pair,
                        failing,
                        reference,
                        candidate,
                        Some(details.join("; ")),
                    )),
                )
            }
        }
    }
}

fn normalized_body(layer: LayerId, normalized: &NormalizedBodies) -> Result<Bytes, DecodeError> {
    normalized.get(&layer).cloned().unwrap_or_else(|| {
        Err(DecodeError::Unavailable(format!("{layer} body was not normalized")))
    })
}

fn discrepancy(
    path: &str,
    kind: DiscrepancyKind,
    pair: LayerPair,
    layers: Vec<LayerId>,
    reference: &LayerResult,
    candidate: &LayerResult,
    detail: Option<String>,
) -> Discrepancy {
    let results = [reference, candidate]
        .into_iter()
        .map(|result| (result.layer, result.without_body()))
        .collect();
    Discrepancy {
        path: path.to_string(),
        kind,
        pair,
        layers,
        results,
        detail,
    }
}
