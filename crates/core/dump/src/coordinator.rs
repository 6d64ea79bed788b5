//! Collection Coordinator.
//!
//! Drives every requested datatype through `Planned → Partitioning → Collecting → Finalizing →
//! Done`. The range is resolved once for all datatypes, then the chunks of all datatypes are
//! dispatched in `sequence_index` order through the shared chunk semaphore. A chunk that fails
//! to fetch is recorded in the report and the collection carries on; a chunk that fails to be
//! written stops everything.

use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use arrow::array::RecordBatch;
use chrono::Utc;
use common::{Chunk, Datatype, partition};
use datasets_raw::TableSchema;
use evm_rpc_datasets::{ChunkPlan, FetchOutcome, Fetcher, HeadResolver, Limits, RpcSource};
use monitoring::logging;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    collection::{CollectOpts, Query},
    error::{CollectError, ConfigError, WriteError},
    progress::{ChunkProgress, ChunkStatus, Phase, ProgressCallback, ProgressCallbackExt as _, ProgressUpdate},
    report::{ChunkError, CollectionReport, DatatypeReport, ExcludedUnits, ReportFiles},
    tasks::{FailFastJoinSet, TaskError},
    writer::{Accumulator, DatasetWriter, WrittenFile},
};

/// Interval between two progress log lines.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(15);

/// Rows of an in-memory collection.
#[derive(Debug)]
pub struct InMemoryCollection {
    /// Chunks concatenated in `sequence_index` order. Errored chunks contribute no rows.
    pub batch: RecordBatch,
    pub report: CollectionReport,
}

/// Runs collections against one source.
///
/// Each call to [`collect`](Self::collect) creates its own [`Limits`] from the options unless
/// limits are shared explicitly with [`with_limits`](Self::with_limits).
pub struct Collector<S> {
    source: Arc<S>,
    limits: Option<Arc<Limits>>,
    cancel: CancellationToken,
    progress: Option<Arc<dyn ProgressCallback>>,
}

impl<S: RpcSource> Collector<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            limits: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Shares concurrency and rate limits with other collectors.
    pub fn with_limits(mut self, limits: Arc<Limits>) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Cancelling the token stops new chunks and requests. In-flight requests finish, chunk
    /// files are never left half written, and the report lists every unfinished chunk.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Collects every requested datatype into files.
    ///
    /// Returns the report even when chunks errored; errors are only returned for invalid
    /// options, an unresolvable range and write failures.
    pub async fn collect(
        &self,
        query: &Query,
        opts: &CollectOpts,
    ) -> Result<CollectionReport, CollectError> {
        let writer = Arc::new(DatasetWriter::new(
            query.network.clone(),
            query.label.clone(),
            opts.output.clone(),
        )?);
        let mut collection = self.prepare(query, opts).await?;

        let mut paths = HashSet::new();
        for run in &collection.runs {
            for chunk in &run.chunks {
                let path = writer.path(chunk);
                if !paths.insert(path.clone()) {
                    return Err(ConfigError::DuplicateOutputPath(path).into());
                }
            }
        }

        if opts.dry {
            return Ok(collection.plan(query, opts, self.fetcher(query, opts)));
        }

        let mut report_files = (!opts.output.no_report)
            .then(|| ReportFiles::new(opts.output.report_dir(), collection.started_at));
        if let Some(files) = report_files.as_mut() {
            let path = files.write_incomplete(&collection.report(query, opts))?;
            tracing::debug!(path = %path.display(), "wrote incomplete report");
        }

        self.run(&mut collection, query, opts, Sink::Files(writer))
            .await?;

        collection.finalize(&self.progress);
        let report = collection.report(query, opts);
        if let Some(files) = report_files.as_mut() {
            let path = files.write_final(&report)?;
            tracing::info!(path = %path.display(), "wrote collection report");
        }
        collection.done(&self.progress);

        Ok(report)
    }

    /// Collects exactly one datatype into memory.
    ///
    /// Output options other than the format's hex rendering are ignored and no report file is
    /// written. A dry run returns an empty table with the plan in the report.
    pub async fn collect_in_memory(
        &self,
        query: &Query,
        opts: &CollectOpts,
    ) -> Result<InMemoryCollection, CollectError> {
        if query.datatypes.len() != 1 {
            return Err(ConfigError::InMemoryDatatypes(query.datatypes.len()).into());
        }
        let mut collection = self.prepare(query, opts).await?;

        if opts.dry {
            let schema = collection.runs[0].table.schema();
            let report = collection.plan(query, opts, self.fetcher(query, opts));
            return Ok(InMemoryCollection {
                batch: RecordBatch::new_empty(schema),
                report,
            });
        }

        for run in &mut collection.runs {
            run.accumulator = Some(Accumulator::new(run.table.schema()));
        }

        self.run(&mut collection, query, opts, Sink::Memory).await?;

        collection.finalize(&self.progress);
        let report = collection.report(query, opts);
        collection.done(&self.progress);

        let run = collection.runs.swap_remove(0);
        let accumulator = run
            .accumulator
            .unwrap_or_else(|| Accumulator::new(run.table.schema()));
        let batch = accumulator.finish().map_err(WriteError::Combine)?;

        Ok(InMemoryCollection { batch, report })
    }

    /// Validates, resolves the range and splits it for every datatype.
    async fn prepare(&self, query: &Query, opts: &CollectOpts) -> Result<Collection, CollectError> {
        let started_at = Utc::now();
        let tables = opts.validate(query)?;
        let mut runs: Vec<DatatypeRun> = tables.into_iter().map(DatatypeRun::new).collect();

        for run in &mut runs {
            run.advance(Phase::Partitioning, &self.progress);
        }
        let resolver = HeadResolver::new(Arc::clone(&self.source), opts.limits.retry_policy());
        let resolved =
            partition::resolve_range(&query.range, opts.partition.reorg_buffer, &resolver).await?;

        let keys = query.partition_keys();
        for run in &mut runs {
            run.chunks = partition::split(&resolved, &opts.partition, run.datatype, &keys);
            tracing::info!(
                datatype = %run.datatype,
                n_chunks = run.chunks.len(),
                "partitioned collection range"
            );
        }

        Ok(Collection { started_at, runs })
    }

    fn fetcher(&self, query: &Query, opts: &CollectOpts) -> Fetcher<S> {
        let limits = self
            .limits
            .clone()
            .unwrap_or_else(|| Arc::new(Limits::new(&opts.limits)));
        Fetcher::new(
            Arc::clone(&self.source),
            limits,
            opts.limits.retry_policy(),
            opts.fetch_options(query),
            self.cancel.child_token(),
        )
    }

    /// Dispatches the chunks of every datatype and records their outcomes.
    async fn run(
        &self,
        collection: &mut Collection,
        query: &Query,
        opts: &CollectOpts,
        sink: Sink,
    ) -> Result<(), CollectError> {
        let fetcher = self.fetcher(query, opts);
        let limits = Arc::clone(fetcher.limits());
        let mut progress_log = ProgressLog::new();

        for run in &mut collection.runs {
            run.advance(Phase::Collecting, &self.progress);
        }

        let work: Vec<(usize, Chunk)> = collection
            .runs
            .iter()
            .enumerate()
            .flat_map(|(index, run)| run.chunks.iter().cloned().map(move |chunk| (index, chunk)))
            .collect();
        let mut work = work.into_iter();

        let mut tasks = FailFastJoinSet::<Result<ChunkDone, WriteError>>::new();
        while let Some((index, chunk)) = work.next() {
            while let Some(done) = tasks.try_join_next().await {
                self.settle(collection, done, &mut progress_log)?;
            }

            let run = &mut collection.runs[index];
            if let Sink::Files(writer) = &sink {
                let path = writer.path(&chunk);
                if writer.should_skip(&path) {
                    tracing::debug!(datatype = %run.datatype, chunk = %chunk.label(), "output exists, skipping chunk");
                    let progress = run.skip(&chunk, path);
                    self.report_chunk(run, progress, &mut progress_log);
                    continue;
                }
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = limits.acquire_chunk() => permit.ok(),
            };
            let Some(permit) = permit else {
                tracing::info!("collection cancelled, not starting remaining chunks");
                run.cancel(&chunk);
                for (index, chunk) in work.by_ref() {
                    collection.runs[index].cancel(&chunk);
                }
                break;
            };

            let span = tracing::info_span!("chunk", datatype = %chunk.datatype, chunk = %chunk.label());
            let fetcher = fetcher.clone();
            let table = Arc::clone(&run.table);
            let sink = sink.clone();
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let outcome = fetcher.fetch(chunk, &table).await;
                    process(index, outcome, sink).await
                }
                .instrument(span),
            );
        }

        while let Some(done) = tasks.join_next().await {
            self.settle(collection, done, &mut progress_log)?;
        }

        Ok(())
    }

    fn settle(
        &self,
        collection: &mut Collection,
        done: Result<ChunkDone, TaskError<WriteError>>,
        progress_log: &mut ProgressLog,
    ) -> Result<(), CollectError> {
        let done = match done {
            Ok(done) => done,
            Err(TaskError::Error(err)) => {
                tracing::error!(error = %err, error_source = logging::error_source(&err), "failed to write chunk, stopping collection");
                return Err(err.into());
            }
            Err(TaskError::Panic(err)) => return Err(CollectError::Task(err)),
        };

        let run = &mut collection.runs[done.index];
        let progress = run.record(done);
        self.report_chunk(run, progress, progress_log);
        Ok(())
    }

    fn report_chunk(&self, run: &DatatypeRun, chunk: ChunkProgress, progress_log: &mut ProgressLog) {
        self.progress.report_progress(ProgressUpdate {
            datatype: run.datatype,
            phase: run.phase,
            chunk: Some(chunk),
            completed: run.n_settled(),
            total: run.chunks.len(),
        });
        progress_log.maybe_log(run);
    }
}

/// Where assembled chunks go.
#[derive(Clone)]
enum Sink {
    Files(Arc<DatasetWriter>),
    Memory,
}

/// A chunk with an outcome, sent back from its task.
struct ChunkDone {
    index: usize,
    chunk: Chunk,
    attempts: u32,
    excluded: Vec<String>,
    result: ChunkResult,
}

enum ChunkResult {
    Written(WrittenFile),
    Collected(RecordBatch),
    Errored(ChunkError),
}

/// Writes or keeps a fetched chunk. Only write failures are errors; fetch failures are part
/// of the result.
async fn process(index: usize, outcome: FetchOutcome, sink: Sink) -> Result<ChunkDone, WriteError> {
    let FetchOutcome {
        chunk,
        result,
        attempts,
        excluded,
    } = outcome;

    let result = match (result, sink) {
        (Ok(batch), Sink::Files(writer)) => {
            let path = writer.path(&chunk);
            let file = tokio::task::spawn_blocking(move || writer.write(&batch, &path))
                .await
                .map_err(WriteError::Task)??;
            ChunkResult::Written(file)
        }
        (Ok(batch), Sink::Memory) => ChunkResult::Collected(batch),
        (Err(err), _) => ChunkResult::Errored(ChunkError::new(&chunk, attempts, &err)),
    };

    Ok(ChunkDone {
        index,
        chunk,
        attempts,
        excluded,
        result,
    })
}

/// State of every datatype of one collection.
struct Collection {
    started_at: chrono::DateTime<Utc>,
    runs: Vec<DatatypeRun>,
}

impl Collection {
    fn report(&self, query: &Query, opts: &CollectOpts) -> CollectionReport {
        let finished = self.runs.iter().all(|run| run.phase >= Phase::Finalizing);
        CollectionReport {
            network: query.network.clone(),
            label: query.label.clone(),
            range: query.range.to_string(),
            dry: opts.dry,
            started_at: self.started_at,
            finished_at: finished.then(Utc::now),
            datatypes: self
                .runs
                .iter()
                .map(|run| (run.datatype, run.report()))
                .collect(),
        }
    }

    fn plan<S: RpcSource>(
        mut self,
        query: &Query,
        opts: &CollectOpts,
        fetcher: Fetcher<S>,
    ) -> CollectionReport {
        for run in &mut self.runs {
            run.plans = run
                .chunks
                .iter()
                .map(|chunk| fetcher.plan(chunk, &run.table))
                .collect();
            let n_requests: u64 = run.plans.iter().map(ChunkPlan::known_requests).sum();
            tracing::info!(
                datatype = %run.datatype,
                n_chunks = run.chunks.len(),
                n_requests,
                "planned dry run"
            );
        }
        let mut report = self.report(query, opts);
        report.finished_at = Some(Utc::now());
        report
    }

    fn finalize(&mut self, progress: &Option<Arc<dyn ProgressCallback>>) {
        for run in &mut self.runs {
            run.advance(Phase::Finalizing, progress);
            tracing::info!(
                datatype = %run.datatype,
                n_chunks = run.chunks.len(),
                n_completed = run.n_completed,
                n_skipped = run.n_skipped,
                n_errored = run.errors.len(),
                n_rows = run.n_rows,
                "finished collecting datatype"
            );
        }
    }

    fn done(&mut self, progress: &Option<Arc<dyn ProgressCallback>>) {
        for run in &mut self.runs {
            run.advance(Phase::Done, progress);
        }
    }
}

/// One datatype of a collection.
struct DatatypeRun {
    datatype: Datatype,
    table: Arc<TableSchema>,
    phase: Phase,
    chunks: Vec<Chunk>,
    paths: BTreeMap<usize, PathBuf>,
    errors: BTreeMap<usize, ChunkError>,
    excluded: BTreeMap<usize, ExcludedUnits>,
    plans: Vec<ChunkPlan>,
    n_completed: usize,
    n_skipped: usize,
    n_rows: u64,
    n_bytes: u64,
    accumulator: Option<Accumulator>,
}

impl DatatypeRun {
    fn new(table: Arc<TableSchema>) -> Self {
        Self {
            datatype: table.datatype(),
            table,
            phase: Phase::Planned,
            chunks: Vec::new(),
            paths: BTreeMap::new(),
            errors: BTreeMap::new(),
            excluded: BTreeMap::new(),
            plans: Vec::new(),
            n_completed: 0,
            n_skipped: 0,
            n_rows: 0,
            n_bytes: 0,
            accumulator: None,
        }
    }

    fn advance(&mut self, phase: Phase, progress: &Option<Arc<dyn ProgressCallback>>) {
        tracing::debug!(datatype = %self.datatype, from = %self.phase, to = %phase, "datatype phase");
        self.phase = phase;
        progress.report_progress(ProgressUpdate {
            datatype: self.datatype,
            phase,
            chunk: None,
            completed: self.n_settled(),
            total: self.chunks.len(),
        });
    }

    /// Chunks with an outcome.
    fn n_settled(&self) -> usize {
        self.n_completed + self.n_skipped + self.errors.len()
    }

    fn skip(&mut self, chunk: &Chunk, path: PathBuf) -> ChunkProgress {
        self.n_skipped += 1;
        self.paths.insert(chunk.sequence_index, path);
        ChunkProgress {
            label: chunk.label(),
            status: ChunkStatus::Skipped,
            n_rows: 0,
        }
    }

    fn cancel(&mut self, chunk: &Chunk) {
        self.errors
            .insert(chunk.sequence_index, ChunkError::cancelled(chunk));
    }

    fn record(&mut self, done: ChunkDone) -> ChunkProgress {
        let ChunkDone {
            chunk,
            attempts,
            excluded,
            result,
            ..
        } = done;
        let sequence_index = chunk.sequence_index;
        let label = chunk.label();

        if !excluded.is_empty() && !matches!(result, ChunkResult::Errored(_)) {
            self.excluded.insert(
                sequence_index,
                ExcludedUnits {
                    sequence_index,
                    label: label.clone(),
                    requests: excluded,
                },
            );
        }

        let (status, n_rows) = match result {
            ChunkResult::Written(file) => {
                self.n_completed += 1;
                self.n_rows += file.n_rows as u64;
                self.n_bytes += file.n_bytes;
                self.paths.insert(sequence_index, file.path);
                (ChunkStatus::Completed, file.n_rows)
            }
            ChunkResult::Collected(batch) => {
                self.n_completed += 1;
                let n_rows = batch.num_rows();
                self.n_rows += n_rows as u64;
                if let Some(accumulator) = self.accumulator.as_mut() {
                    accumulator.accumulate(sequence_index, batch);
                }
                (ChunkStatus::Completed, n_rows)
            }
            ChunkResult::Errored(err) => {
                tracing::warn!(
                    datatype = %self.datatype,
                    chunk = %label,
                    attempts,
                    error = %err.error,
                    "chunk errored, continuing with the remaining chunks"
                );
                self.errors.insert(sequence_index, err);
                (ChunkStatus::Errored, 0)
            }
        };

        ChunkProgress {
            label,
            status,
            n_rows,
        }
    }

    fn report(&self) -> DatatypeReport {
        DatatypeReport {
            paths: self.paths.values().cloned().collect(),
            n_chunks: self.chunks.len(),
            n_completed: self.n_completed,
            n_skipped: self.n_skipped,
            n_errored: self.errors.len(),
            n_rows: self.n_rows,
            n_bytes: self.n_bytes,
            errors: self.errors.values().cloned().collect(),
            excluded: self.excluded.values().cloned().collect(),
            plans: self.plans.clone(),
        }
    }
}

/// Rate limited progress logging.
struct ProgressLog {
    last: Instant,
}

impl ProgressLog {
    fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    fn maybe_log(&mut self, run: &DatatypeRun) {
        if self.last.elapsed() < PROGRESS_LOG_INTERVAL {
            return;
        }
        self.last = Instant::now();
        let total = run.chunks.len();
        let settled = run.n_settled();
        let percent = if total == 0 {
            100.0
        } else {
            settled as f64 * 100.0 / total as f64
        };
        tracing::info!(
            datatype = %run.datatype,
            completed = settled,
            total,
            n_errored = run.errors.len(),
            n_rows = run.n_rows,
            "collection progress: {percent:.1}%"
        );
    }
}
