//! Running per-layer and per-pair counters.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::consistency::{
    classify_pair, ComparisonGraph, ComparisonMode, Discrepancy, DiscrepancyKind, LayerOutcome,
    PairOutcome, PairStage, PathEvaluation,
};
use crate::layer::{LayerId, LayerPair};
use crate::providers::ProviderBreakdown;
use crate::store::ResultSet;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LayerTally {
    pub successful_reads: u64,
    pub read_errors: u64,
    pub non_success: u64,
    pub transport_errors: u64,
    pub status_codes: BTreeMap<u16, u64>,
}

impl LayerTally {
    fn observe(&mut self, outcome: LayerOutcome, status: u16) {
        *self.status_codes.entry(status).or_default() += 1;
        match outcome {
            LayerOutcome::Success => self.successful_reads += 1,
            LayerOutcome::ReadError => self.read_errors += 1,
            LayerOutcome::Failed => {
                self.non_success += 1;
                if status == 0 {
                    self.transport_errors += 1;
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PairTally {
    pub reference: LayerId,
    pub candidate: LayerId,
    pub status_mismatches: u64,
    pub content_matches: u64,
    pub content_mismatches: u64,
    pub decode_errors: u64,
    pub excluded: u64,
    pub both_failed: u64,
    pub status_only: u64,
}

impl PairTally {
    fn new(pair: LayerPair) -> Self {
        Self {
            reference: pair.reference,
            candidate: pair.candidate,
            status_mismatches: 0,
            content_matches: 0,
            content_mismatches: 0,
            decode_errors: 0,
            excluded: 0,
            both_failed: 0,
            status_only: 0,
        }
    }

    pub fn pair(&self) -> LayerPair {
        LayerPair::new(self.reference, self.candidate)
    }

    fn observe(&mut self, outcome: PairOutcome) {
        let counter = match outcome {
            PairOutcome::Excluded => &mut self.excluded,
            PairOutcome::StatusMismatch => &mut self.status_mismatches,
            PairOutcome::BothFailed => &mut self.both_failed,
            PairOutcome::StatusOnly => &mut self.status_only,
            PairOutcome::ContentMatch => &mut self.content_matches,
            PairOutcome::ContentMismatch => &mut self.content_mismatches,
            PairOutcome::DecodeError => &mut self.decode_errors,
        };
        *counter += 1;
    }

    pub fn mismatches(&self, kind: DiscrepancyKind) -> u64 {
        match kind {
            DiscrepancyKind::StatusMismatch => self.status_mismatches,
            DiscrepancyKind::ContentMismatch => self.content_mismatches,
            DiscrepancyKind::DecodeError => self.decode_errors,
        }
    }
}

/// Aggregate view of one round. The counters are always derivable from the
/// store contents and the discrepancy list (see [`RunSummary::recompute`]);
/// `providers` is filled in afterwards when a provider lookup is configured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_paths: u64,
    pub layers: BTreeMap<LayerId, LayerTally>,
    pub pairs: BTreeMap<String, PairTally>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderBreakdown>,
}

impl RunSummary {
    pub fn new(layers: &[LayerId], graph: &ComparisonGraph) -> Self {
        Self {
            total_paths: 0,
            layers: layers
                .iter()
                .map(|layer| (*layer, LayerTally::default()))
                .collect(),
            pairs: graph
                .pairs()
                .map(|pair| (pair.key(), PairTally::new(pair)))
                .collect(),
            providers: BTreeMap::new(),
        }
    }

    fn pair_mut(&mut self, pair: LayerPair) -> &mut PairTally {
        self.pairs
            .entry(pair.key())
            .or_insert_with(|| PairTally::new(pair))
    }

    /// Folds one finalized path into the counters.
    pub fn absorb(&mut self, evaluation: &PathEvaluation) {
        self.total_paths += 1;
        for (layer, observation) in &evaluation.layers {
            self.layers
                .entry(*layer)
                .or_default()
                .observe(observation.outcome, observation.status);
        }
        for verdict in &evaluation.pairs {
            self.pair_mut(verdict.pair).observe(verdict.outcome);
        }
    }

    /// Rebuilds the counters from finalized sets and the recorded discrepancies.
    pub fn recompute<'a>(
        layers: &[LayerId],
        sets: impl IntoIterator<Item = &'a ResultSet>,
        discrepancies: &[Discrepancy],
        graph: &ComparisonGraph,
        mode: ComparisonMode,
    ) -> Self {
        let mut summary = Self::new(layers, graph);
        let mut content_findings: BTreeMap<(&str, String), DiscrepancyKind> = BTreeMap::new();
        for discrepancy in discrepancies {
            if discrepancy.kind != DiscrepancyKind::StatusMismatch {
                content_findings.insert((discrepancy.path.as_str(), discrepancy.pair.key()), discrepancy.kind);
            }
        }

        for set in sets.into_iter().filter(|set| set.is_finalized()) {
            summary.total_paths += 1;
            for result in set.results() {
                summary
                    .layers
                    .entry(result.layer)
                    .or_default()
                    .observe(LayerOutcome::classify(result), result.status);
            }

            for comparison in graph.comparisons() {
                let pair = comparison.pair;
                let (Some(reference), Some(candidate)) =
                    (set.get(pair.reference), set.get(pair.candidate))
                else {
                    continue;
                };
                let content = mode == ComparisonMode::StatusAndContent && comparison.content;
                let outcome = match classify_pair(
                    LayerOutcome::classify(reference),
                    LayerOutcome::classify(candidate),
                    content,
                ) {
                    PairStage::Decided(outcome) => outcome,
                    PairStage::CompareContent => {
                        match content_findings.get(&(set.path(), pair.key())) {
                            Some(DiscrepancyKind::ContentMismatch) => PairOutcome::ContentMismatch,
                            Some(DiscrepancyKind::DecodeError) => PairOutcome::DecodeError,
                            _ => PairOutcome::ContentMatch,
                        }
                    }
                };
                summary.pair_mut(pair).observe(outcome);
            }
        }
        summary
    }

    pub fn mismatch_total(&self, kind: DiscrepancyKind) -> u64 {
        self.pairs.values().map(|tally| tally.mismatches(kind)).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------ SUMMARY ------")?;
        writeln!(f, "Total unique paths: {}", self.total_paths)?;
        writeln!(f)?;
        for (layer, tally) in &self.layers {
            writeln!(f, "{}", layer.label())?;
            writeln!(f, "  2xx with successful read: {}", tally.successful_reads)?;
            writeln!(f, "  2xx with read errors:     {}", tally.read_errors)?;
            writeln!(
                f,
                "  non-2xx:                  {} ({} transport failures)",
                tally.non_success, tally.transport_errors
            )?;
            let codes = tally
                .status_codes
                .iter()
                .map(|(code, count)| format!("{code}={count}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(f, "  status codes:             {codes}")?;
        }
        writeln!(f)?;
        for tally in self.pairs.values() {
            writeln!(f, "{}", tally.pair())?;
            writeln!(f, "  status mismatches:  {}", tally.status_mismatches)?;
            writeln!(f, "  content matches:    {}", tally.content_matches)?;
            writeln!(f, "  content mismatches: {}", tally.content_mismatches)?;
            writeln!(f, "  decode errors:      {}", tally.decode_errors)?;
            writeln!(
                f,
                "  not compared:       {} excluded, {} both failed, {} status only",
                tally.excluded, tally.both_failed, tally.status_only
            )?;
        }
        if !self.providers.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- providers of mismatched content ---")?;
            for (pair, breakdown) in &self.providers {
                writeln!(
                    f,
                    "{pair}: {} not indexed, {} dag.house, {} pinata, {} other, {} unresolved",
                    breakdown.not_found,
                    breakdown.dag_house,
                    breakdown.pinata,
                    breakdown.other,
                    breakdown.unresolved
                )?;
            }
        }
        Ok(())
    }
}
