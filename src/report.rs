//! Per-round JSON reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::to_vec_pretty;
use tracing::info;

use crate::consistency::{ComparisonGraph, DiscrepancyKind};
use crate::errors::{HarnessError, HarnessResult};
use crate::layer::LayerId;
use crate::providers::cid_from_path;
use crate::store::{FailedArchive, LayerResult, StoreSnapshot};

pub const RESULTS_FILE: &str = "results.json";
pub const SUMMARY_FILE: &str = "top-level-metrics.json";
pub const ARCHIVE_DIR: &str = "decode-errors";

pub fn round_dir(output_dir: &Path, round: u32) -> PathBuf {
    output_dir.join(format!("results-{round}"))
}

pub fn discrepancy_file(pair_key: &str, kind: DiscrepancyKind) -> String {
    format!("{pair_key}-{}.json", kind.file_stem())
}

pub fn read_error_file(layer: LayerId) -> String {
    format!("{layer}-2xx-read-errors.json")
}

/// `<layer>-<cid>.car`, falling back to the flattened path when it carries no content id.
pub fn archive_file(archive: &FailedArchive) -> String {
    let name = match cid_from_path(&archive.path) {
        Some(cid) => cid.to_string(),
        None => archive
            .path
            .trim_start_matches('/')
            .replace(|c: char| matches!(c, '/' | '?' | '&' | '='), "_"),
    };
    format!("{}-{name}.car", archive.layer)
}

/// `foo.json` -> `foo-paths.json`.
pub fn paths_file(file: &str) -> String {
    match file.strip_suffix(".json") {
        Some(stem) => format!("{stem}-paths.json"),
        None => format!("{file}-paths"),
    }
}

#[derive(Clone, Debug)]
pub struct ReportEmitter {
    output_dir: PathBuf,
}

impl ReportEmitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Writes every report file for `round` and returns the round directory.
    pub async fn emit(
        &self,
        round: u32,
        snapshot: &StoreSnapshot,
        layers: &[LayerId],
        graph: &ComparisonGraph,
    ) -> HarnessResult<PathBuf> {
        let dir = round_dir(&self.output_dir, round);
        create_dir(&dir).await?;

        let results: BTreeMap<&str, BTreeMap<LayerId, &LayerResult>> = snapshot
            .sets
            .iter()
            .map(|(path, set)| {
                let by_layer = set.results().map(|result| (result.layer, result)).collect();
                (path.as_str(), by_layer)
            })
            .collect();
        write_json(&dir.join(RESULTS_FILE), &results).await?;

        for pair in graph.pairs() {
            let key = pair.key();
            for kind in DiscrepancyKind::ALL {
                let entries: BTreeMap<&str, &BTreeMap<LayerId, LayerResult>> = snapshot
                    .discrepancies
                    .iter()
                    .filter(|discrepancy| discrepancy.pair == pair && discrepancy.kind == kind)
                    .map(|discrepancy| (discrepancy.path.as_str(), &discrepancy.results))
                    .collect();
                self.write_with_paths(&dir, &discrepancy_file(&key, kind), &entries)
                    .await?;
            }
        }

        for layer in layers {
            let entries: BTreeMap<&str, &LayerResult> = snapshot
                .sets
                .iter()
                .filter_map(|(path, set)| {
                    set.get(*layer)
                        .filter(|result| result.is_success() && result.body_read_error.is_some())
                        .map(|result| (path.as_str(), result))
                })
                .collect();
            self.write_with_paths(&dir, &read_error_file(*layer), &entries)
                .await?;
        }

        if !snapshot.archives.is_empty() {
            let archive_dir = dir.join(ARCHIVE_DIR);
            create_dir(&archive_dir).await?;
            for archive in &snapshot.archives {
                let file = archive_dir.join(archive_file(archive));
                tokio::fs::write(&file, &archive.body)
                    .await
                    .map_err(|source| HarnessError::Output { path: file, source })?;
            }
        }

        write_json(&dir.join(SUMMARY_FILE), &snapshot.summary).await?;
        info!(
            target = "onion::report",
            round,
            dir = %dir.display(),
            discrepancies = snapshot.discrepancies.len(),
            archives = snapshot.archives.len(),
            "round reports written"
        );
        Ok(dir)
    }

    async fn write_with_paths<V: Serialize>(
        &self,
        dir: &Path,
        file: &str,
        entries: &BTreeMap<&str, V>,
    ) -> HarnessResult<()> {
        write_json(&dir.join(file), entries).await?;
        let paths: Vec<&str> = entries.keys().copied().collect();
        write_json(&dir.join(paths_file(file)), &paths).await
    }
}

async fn create_dir(dir: &Path) -> HarnessResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| HarnessError::Output {
            path: dir.to_path_buf(),
            source,
        })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> HarnessResult<()> {
    let serialized = to_vec_pretty(value)?;
    tokio::fs::write(path, serialized)
        .await
        .map_err(|source| HarnessError::Output {
            path: path.to_path_buf(),
            source,
        })
}
