//! Progress callback infrastructure for collections.
//!
//! This module provides the [`ProgressCallback`] trait that allows external code to receive
//! progress updates while a collection runs, e.g. to drive a progress bar.

use std::sync::Arc;

use common::Datatype;

/// Lifecycle of one datatype within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Options validated, nothing resolved yet
    Planned,
    /// Resolving the range and splitting it into chunks
    Partitioning,
    /// Chunks are being fetched and written
    Collecting,
    /// Every chunk has an outcome, the report is being written
    Finalizing,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Planned => "planned",
            Phase::Partitioning => "partitioning",
            Phase::Collecting => "collecting",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

/// How a chunk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Completed,
    /// The output file already existed
    Skipped,
    Errored,
}

/// Progress information for one datatype of a collection.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub datatype: Datatype,
    pub phase: Phase,
    /// The chunk that just finished, when the update is about one
    pub chunk: Option<ChunkProgress>,
    /// Chunks with an outcome so far, including skipped and errored ones
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub label: String,
    pub status: ChunkStatus,
    pub n_rows: usize,
}

/// Trait for receiving progress updates during collections.
///
/// Implementations must be thread-safe as progress callbacks may be invoked
/// from multiple concurrent chunk tasks.
pub trait ProgressCallback: Send + Sync {
    /// Called when a chunk finishes or a datatype changes phase.
    ///
    /// This method should be non-blocking and should not fail - progress
    /// reporting is best-effort and should not impact the collection.
    fn on_progress(&self, update: ProgressUpdate);
}

/// A no-op progress callback that discards all progress updates.
///
/// Used when progress reporting is disabled.
pub struct NoOpProgressCallback;

impl ProgressCallback for NoOpProgressCallback {
    fn on_progress(&self, _update: ProgressUpdate) {}
}

/// Extension trait for optional progress callbacks.
pub trait ProgressCallbackExt {
    /// Report progress if a callback is configured.
    fn report_progress(&self, update: ProgressUpdate);
}

impl ProgressCallbackExt for Option<Arc<dyn ProgressCallback>> {
    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(callback) = self {
            callback.on_progress(update);
        }
    }
}
