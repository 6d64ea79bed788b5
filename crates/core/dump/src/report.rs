//! Collection reports.
//!
//! A report is written when a collection starts (`incomplete_{ts}.json`) and replaced by the
//! final `{ts}.json` once every chunk has an outcome. The per-chunk error entries are what a
//! caller needs to re-run only the failed part of a collection.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use common::{Chunk, Datatype, NetworkId};
use evm_rpc_datasets::{ChunkFetchError, ChunkPlan};
use monitoring::logging;
use serde::Serialize;

use crate::error::WriteError;

/// Outcome of a collection, keyed by datatype.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub network: NetworkId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// The range selector as given
    pub range: String,
    pub dry: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub datatypes: BTreeMap<Datatype, DatatypeReport>,
}

/// Outcome of one datatype.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatatypeReport {
    /// Output files of completed and skipped chunks, in `sequence_index` order
    pub paths: Vec<PathBuf>,
    pub n_chunks: usize,
    pub n_completed: usize,
    pub n_skipped: usize,
    pub n_errored: usize,
    /// Rows of the chunks collected by this run. Skipped chunks are not counted.
    pub n_rows: u64,
    pub n_bytes: u64,
    pub errors: Vec<ChunkError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<ExcludedUnits>,
    /// Request plans, only for dry runs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<ChunkPlan>,
}

/// A chunk without output. Re-running the collection with `overwrite = false` fetches exactly
/// these chunks again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkError {
    pub sequence_index: usize,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub attempts: u32,
    pub error: String,
    pub error_source: String,
}

impl ChunkError {
    pub(crate) fn new(chunk: &Chunk, attempts: u32, err: &ChunkFetchError) -> Self {
        Self {
            sequence_index: chunk.sequence_index,
            label: chunk.label(),
            partition_key: chunk.partition_key.as_ref().map(ToString::to_string),
            attempts,
            error: err.to_string(),
            error_source: logging::error_source(err),
        }
    }

    /// A chunk that never got to run because the collection was cancelled.
    pub(crate) fn cancelled(chunk: &Chunk) -> Self {
        let err = ChunkFetchError::Cancelled;
        Self::new(chunk, 0, &err)
    }
}

/// Units dropped from a successful chunk because of `exclude_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedUnits {
    pub sequence_index: usize,
    pub label: String,
    pub requests: Vec<String>,
}

impl CollectionReport {
    pub fn n_errored(&self) -> usize {
        self.datatypes.values().map(|r| r.n_errored).sum()
    }

    pub fn n_rows(&self) -> u64 {
        self.datatypes.values().map(|r| r.n_rows).sum()
    }

    /// Chunks that have to be collected again, in `sequence_index` order per datatype.
    pub fn errored_chunks(&self) -> Vec<(Datatype, &ChunkError)> {
        self.datatypes
            .iter()
            .flat_map(|(datatype, report)| report.errors.iter().map(|err| (*datatype, err)))
            .collect()
    }

    /// Finished without a single errored chunk.
    pub fn is_complete(&self) -> bool {
        self.finished_at.is_some() && self.n_errored() == 0
    }
}

/// The report files of one collection.
pub(crate) struct ReportFiles {
    dir: PathBuf,
    stamp: String,
    incomplete: Option<PathBuf>,
}

impl ReportFiles {
    pub(crate) fn new(dir: PathBuf, started_at: DateTime<Utc>) -> Self {
        Self {
            dir,
            stamp: started_at.format("%Y-%m-%d_%H-%M-%S%.6f").to_string(),
            incomplete: None,
        }
    }

    pub(crate) fn write_incomplete(
        &mut self,
        report: &CollectionReport,
    ) -> Result<PathBuf, WriteError> {
        let path = self.dir.join(format!("incomplete_{}.json", self.stamp));
        write_json(&path, report)?;
        self.incomplete = Some(path.clone());
        Ok(path)
    }

    /// Writes the final report and removes the incomplete one.
    pub(crate) fn write_final(&mut self, report: &CollectionReport) -> Result<PathBuf, WriteError> {
        let path = self.dir.join(format!("{}.json", self.stamp));
        write_json(&path, report)?;
        if let Some(incomplete) = self.incomplete.take() {
            fs_err::remove_file(incomplete).map_err(WriteError::Io)?;
        }
        Ok(path)
    }
}

fn write_json(path: &Path, report: &CollectionReport) -> Result<(), WriteError> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(WriteError::CreateDir)?;
    }
    let json = serde_json::to_vec_pretty(report).map_err(WriteError::Report)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(crate::writer::TMP_SUFFIX);
    fs_err::write(&tmp, json).map_err(WriteError::Io)?;
    fs_err::rename(&tmp, path).map_err(WriteError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use common::ChunkSegment;

    use super::*;

    fn report() -> CollectionReport {
        CollectionReport {
            network: "ethereum".parse().expect("Failed to parse network"),
            label: None,
            range: "0:10".to_string(),
            dry: false,
            started_at: Utc::now(),
            finished_at: None,
            datatypes: BTreeMap::new(),
        }
    }

    #[test]
    fn final_report_replaces_the_incomplete_one() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut report = report();
        let mut files = ReportFiles::new(dir.path().join("reports"), report.started_at);
        let incomplete = files
            .write_incomplete(&report)
            .expect("Failed to write incomplete report");
        assert!(incomplete.exists());

        //* When
        report.finished_at = Some(Utc::now());
        let path = files.write_final(&report).expect("Failed to write final report");

        //* Then
        assert!(path.exists());
        assert!(!incomplete.exists());
        let json: serde_json::Value = serde_json::from_slice(
            &fs_err::read(&path).expect("Failed to read report"),
        )
        .expect("Failed to parse report");
        assert_eq!(json["network"], "ethereum");
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn errored_chunks_lists_every_datatype() {
        //* Given
        let chunk = Chunk {
            datatype: Datatype::Logs,
            segment: ChunkSegment::Blocks(vec![100..200]),
            partition_key: None,
            sequence_index: 1,
        };
        let mut report = report();
        report.datatypes.insert(
            Datatype::Blocks,
            DatatypeReport {
                n_chunks: 2,
                n_completed: 2,
                ..Default::default()
            },
        );
        report.datatypes.insert(
            Datatype::Logs,
            DatatypeReport {
                n_chunks: 2,
                n_completed: 1,
                n_errored: 1,
                errors: vec![ChunkError::new(&chunk, 6, &ChunkFetchError::Cancelled)],
                ..Default::default()
            },
        );
        report.finished_at = Some(Utc::now());

        //* When
        let errored = report.errored_chunks();

        //* Then
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].0, Datatype::Logs);
        assert_eq!(errored[0].1.label, "00000100_to_00000199");
        assert_eq!(errored[0].1.attempts, 6);
        assert!(!report.is_complete());
    }
}
