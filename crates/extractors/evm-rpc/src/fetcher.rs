use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

use alloy::primitives::{Address, B256};
use arrow::array::RecordBatch;
use backon::Retryable as _;
use common::{BlockNum, BoxError, Chunk, ChunkSegment, Datatype, LatestBlockResolver};
use datasets_raw::{ColumnSource, RawRecord, TableSchema};
use futures::{StreamExt as _, TryStreamExt as _, stream};
use monitoring::logging;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    error::{ChunkFetchError, RpcError},
    limits::{Limits, RetryPolicy},
    rpc::{BlockTransactions, LogFilter, RpcBlock, RpcLog, RpcReceipt, RpcSource, RpcTransaction},
    strategy::{self, Call, FetchStrategy, Request, RequestShape},
    tables,
};

pub const DEFAULT_INNER_REQUEST_SIZE: u64 = 1;

/// Options that change what the fetcher requests, as opposed to how fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Drop units whose requests fail instead of failing the chunk
    pub exclude_failed: bool,
    /// Blocks per `eth_getLogs` request
    pub inner_request_size: u64,
    /// Fetch receipts per transaction instead of per block
    pub receipts_per_tx: bool,
    /// Log address filter, overridden by an address partition key
    pub addresses: Vec<Address>,
    /// Log topic0 filter, overridden by a topic0 partition key
    pub topic0s: Vec<B256>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            exclude_failed: false,
            inner_request_size: DEFAULT_INNER_REQUEST_SIZE,
            receipts_per_tx: false,
            addresses: Vec::new(),
            topic0s: Vec::new(),
        }
    }
}

/// Terminal result of fetching one chunk.
#[derive(Debug)]
pub struct FetchOutcome {
    pub chunk: Chunk,
    pub result: Result<RecordBatch, ChunkFetchError>,
    /// Requests issued for the chunk, including retries and fallback requests
    pub attempts: u32,
    /// Requests dropped because of `exclude_failed`
    pub excluded: Vec<String>,
}

impl FetchOutcome {
    pub fn n_rows(&self) -> usize {
        self.result.as_ref().map_or(0, |batch| batch.num_rows())
    }
}

/// Responses collected for one chunk while its steps run.
#[derive(Default)]
struct ChunkData {
    blocks: Vec<RpcBlock>,
    transactions: Vec<RpcTransaction>,
    receipts: HashMap<B256, RpcReceipt>,
    logs: Vec<RpcLog>,
    excluded: Vec<String>,
}

/// Fetches chunks from an [`RpcSource`].
///
/// Fetchers are cheap to clone; clones share the source, the limits and the cancellation
/// token.
pub struct Fetcher<S> {
    source: Arc<S>,
    limits: Arc<Limits>,
    retry: RetryPolicy,
    options: FetchOptions,
    cancel: CancellationToken,
}

impl<S> Clone for Fetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            limits: Arc::clone(&self.limits),
            retry: self.retry,
            options: self.options.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: RpcSource> Fetcher<S> {
    pub fn new(
        source: Arc<S>,
        limits: Arc<Limits>,
        retry: RetryPolicy,
        options: FetchOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            limits,
            retry,
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub fn limits(&self) -> &Arc<Limits> {
        &self.limits
    }

    /// Fetches the chunk and assembles its rows.
    ///
    /// Never fails as a whole: request failures, inconsistent responses and schema mismatches
    /// end up in [`FetchOutcome::result`].
    #[instrument(skip_all, fields(datatype = %chunk.datatype, chunk = %chunk.label()))]
    pub async fn fetch(&self, chunk: Chunk, table: &TableSchema) -> FetchOutcome {
        let attempts = AtomicU32::new(0);
        let mut data = ChunkData::default();

        let result = match self.fetch_data(&chunk, table, &mut data, &attempts).await {
            Ok(()) => self
                .records(&chunk, table, &data)
                .and_then(|records| Ok(table.assemble(&records)?)),
            Err(err) => Err(err),
        };

        if let Err(err) = &result
            && !err.is_cancelled()
        {
            tracing::warn!(
                error = %err,
                error_source = logging::error_source(err),
                "Chunk failed"
            );
        }

        FetchOutcome {
            chunk,
            result,
            attempts: attempts.into_inner(),
            excluded: data.excluded,
        }
    }

    async fn fetch_data(
        &self,
        chunk: &Chunk,
        table: &TableSchema,
        data: &mut ChunkData,
        attempts: &AtomicU32,
    ) -> Result<(), ChunkFetchError> {
        if self.cancel.is_cancelled() {
            return Err(ChunkFetchError::Cancelled);
        }

        for step in strategy::steps(chunk, table, self.options.receipts_per_tx) {
            match step {
                FetchStrategy::Direct(request) => self.run(request, chunk, data, attempts).await?,
                FetchStrategy::Fallback { primary, secondary }
                    if primary.call == Call::BlockReceipts
                        && secondary.call == Call::TransactionReceipt =>
                {
                    let blocks = blocks_with_transactions(&data.blocks);
                    let receipts = self
                        .fan_out(blocks, None, |(number, hashes)| {
                            self.block_receipts_or_fallback(number, hashes, attempts)
                        })
                        .await?;
                    data.receipts.extend(
                        receipts
                            .into_iter()
                            .flatten()
                            .map(|receipt| (receipt.transaction_hash, receipt)),
                    );
                }
                FetchStrategy::Fallback { primary, secondary } => {
                    let Err(primary_err) = self.run(primary, chunk, data, attempts).await else {
                        continue;
                    };
                    if primary_err.is_cancelled() {
                        return Err(primary_err);
                    }
                    tracing::warn!(
                        error = %primary_err,
                        error_source = logging::error_source(&primary_err),
                        "{} failed, falling back to {}",
                        primary.call.method(),
                        secondary.call.method(),
                    );
                    self.run(secondary, chunk, data, attempts)
                        .await
                        .map_err(|secondary_err| {
                            if secondary_err.is_cancelled() {
                                return secondary_err;
                            }
                            ChunkFetchError::Fallback {
                                primary: Box::new(primary_err),
                                secondary: Box::new(secondary_err),
                            }
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Issues the requests of one step and stores the responses.
    ///
    /// Responses are only stored once every request of the step succeeded, so a failed primary
    /// request leaves nothing behind for its fallback to trip over.
    async fn run(
        &self,
        request: Request,
        chunk: &Chunk,
        data: &mut ChunkData,
        attempts: &AtomicU32,
    ) -> Result<(), ChunkFetchError> {
        let mut excluded = Vec::new();
        let sink = (self.options.exclude_failed && request.shape != RequestShape::PerItem)
            .then_some(&mut excluded);

        match request.call {
            Call::Block | Call::BlockWithTransactions => {
                let full = request.call == Call::BlockWithTransactions;
                let numbers = chunk.segment.block_numbers();
                data.blocks = self
                    .fan_out(numbers, sink, |n| self.block(n, full, attempts))
                    .await?;
            }
            Call::BlockReceipts => {
                let blocks = blocks_with_transactions(&data.blocks);
                let receipts = self
                    .fan_out(blocks, None, |(number, hashes)| {
                        self.block_receipts(number, hashes, attempts)
                    })
                    .await?;
                let receipts = receipts.into_iter().flatten();
                data.receipts
                    .extend(receipts.map(|receipt| (receipt.transaction_hash, receipt)));
            }
            Call::TransactionReceipt => {
                let hashes: Vec<B256> = match (request.shape, chunk.datatype) {
                    (RequestShape::PerItem, _) => data
                        .blocks
                        .iter()
                        .flat_map(|block| block.transactions.hashes())
                        .collect(),
                    (_, Datatype::Transactions) => {
                        data.transactions.iter().map(|tx| tx.hash).collect()
                    }
                    _ => transaction_hashes(chunk).to_vec(),
                };
                let receipts = self
                    .fan_out(hashes, sink, |hash| self.transaction_receipt(hash, attempts))
                    .await?;
                data.receipts
                    .extend(receipts.into_iter().map(|r| (r.transaction_hash, r)));
            }
            Call::Transaction => {
                let hashes = transaction_hashes(chunk).to_vec();
                data.transactions = self
                    .fan_out(hashes, sink, |hash| self.transaction(hash, attempts))
                    .await?;
            }
            Call::Logs => {
                let filters = self.log_filters(chunk);
                let logs = self
                    .fan_out(filters, sink, |filter| self.logs(filter, attempts))
                    .await?;
                data.logs = logs.into_iter().flatten().collect();
            }
        }

        data.excluded.extend(excluded);
        Ok(())
    }

    /// Runs one request per unit, at most `max_concurrent_requests` at a time, keeping unit
    /// order.
    ///
    /// Without an `excluded` sink the first failure fails the whole step. With one, failed
    /// units are logged, recorded and dropped.
    async fn fan_out<U, T, Fut>(
        &self,
        units: impl IntoIterator<Item = U>,
        excluded: Option<&mut Vec<String>>,
        request: impl FnMut(U) -> Fut,
    ) -> Result<Vec<T>, ChunkFetchError>
    where
        Fut: Future<Output = Result<T, ChunkFetchError>>,
    {
        let results = stream::iter(units)
            .map(request)
            .buffered(self.limits.max_concurrent_requests());

        let Some(excluded) = excluded else {
            return results.try_collect().await;
        };

        let results: Vec<_> = results.collect().await;
        let mut values = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        error_source = logging::error_source(&err),
                        "Excluding failed request"
                    );
                    excluded.push(err.to_string());
                }
            }
        }
        Ok(values)
    }

    /// Sends one remote call through the limits, retrying transient failures.
    async fn request<T, Fut>(
        &self,
        method: &'static str,
        target: &str,
        attempts: &AtomicU32,
        call: impl Fn() -> Fut,
    ) -> Result<T, ChunkFetchError>
    where
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let retries = AtomicUsize::new(0);
        let escalate_after = self.retry.escalation_threshold();
        let cancel = self.cancel.clone();

        (|| async {
            if self.cancel.is_cancelled() {
                return Err(ChunkFetchError::Cancelled);
            }
            let _permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ChunkFetchError::Cancelled),
                permit = self.limits.admit_request() => {
                    permit.map_err(|_| ChunkFetchError::LimiterClosed)?
                }
            };
            attempts.fetch_add(1, Ordering::Relaxed);
            call()
                .await
                .map_err(|err| ChunkFetchError::request(method, target, err))
        })
        .retry(self.retry.backoff())
        .sleep(move |delay| {
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
        .when(|err| {
            matches!(err, ChunkFetchError::Request { source, .. } if source.is_retryable())
        })
        .notify(|err, delay| {
            let retry = retries.fetch_add(1, Ordering::Relaxed) + 1;
            if retry > escalate_after {
                tracing::error!(
                    error = %err,
                    error_source = logging::error_source(err),
                    retry,
                    "{method} failed. Retrying in {:.1}s",
                    delay.as_secs_f32()
                );
            } else {
                tracing::warn!(
                    error = %err,
                    error_source = logging::error_source(err),
                    retry,
                    "{method} failed. Retrying in {:.1}s",
                    delay.as_secs_f32()
                );
            }
        })
        .await
    }

    async fn block(
        &self,
        number: BlockNum,
        full: bool,
        attempts: &AtomicU32,
    ) -> Result<RpcBlock, ChunkFetchError> {
        let method = Call::Block.method();
        let target = format!("block {number}");
        self.request(method, &target, attempts, || self.source.block(number, full))
            .await?
            .ok_or_else(|| ChunkFetchError::not_found(method, target))
    }

    /// Fetches the receipts of a block and checks that they line up with its transactions.
    async fn block_receipts(
        &self,
        number: BlockNum,
        tx_hashes: Vec<B256>,
        attempts: &AtomicU32,
    ) -> Result<Vec<RpcReceipt>, ChunkFetchError> {
        let method = Call::BlockReceipts.method();
        let target = format!("block {number}");
        let mut receipts = self
            .request(method, &target, attempts, || self.source.block_receipts(number))
            .await?
            .ok_or_else(|| ChunkFetchError::not_found(method, &target))?;
        receipts.sort_by_key(|receipt| receipt.transaction_index);

        if tx_hashes.len() != receipts.len() {
            return Err(ChunkFetchError::ReceiptCountMismatch {
                block_num: number,
                tx_count: tx_hashes.len(),
                receipt_count: receipts.len(),
            });
        }
        for (tx_hash, receipt) in tx_hashes.iter().zip(&receipts) {
            if *tx_hash != receipt.transaction_hash {
                return Err(ChunkFetchError::ReceiptHashMismatch {
                    block_num: number,
                    tx_hash: *tx_hash,
                    receipt_hash: receipt.transaction_hash,
                });
            }
        }
        Ok(receipts)
    }

    /// Block receipts of one block, or its receipts one transaction at a time when the block
    /// request fails. Other blocks of the chunk keep their block receipts.
    async fn block_receipts_or_fallback(
        &self,
        number: BlockNum,
        tx_hashes: Vec<B256>,
        attempts: &AtomicU32,
    ) -> Result<Vec<RpcReceipt>, ChunkFetchError> {
        let primary_err = match self.block_receipts(number, tx_hashes.clone(), attempts).await {
            Ok(receipts) => return Ok(receipts),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => err,
        };
        tracing::warn!(
            block = number,
            error = %primary_err,
            error_source = logging::error_source(&primary_err),
            "{} failed, falling back to {}",
            Call::BlockReceipts.method(),
            Call::TransactionReceipt.method(),
        );

        self.fan_out(tx_hashes, None, |hash| self.transaction_receipt(hash, attempts))
            .await
            .map_err(|secondary_err| {
                if secondary_err.is_cancelled() {
                    return secondary_err;
                }
                ChunkFetchError::Fallback {
                    primary: Box::new(primary_err),
                    secondary: Box::new(secondary_err),
                }
            })
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
        attempts: &AtomicU32,
    ) -> Result<RpcReceipt, ChunkFetchError> {
        let method = Call::TransactionReceipt.method();
        let target = format!("transaction {hash}");
        self.request(method, &target, attempts, || {
            self.source.transaction_receipt(hash)
        })
        .await?
        .ok_or_else(|| ChunkFetchError::not_found(method, target))
    }

    async fn transaction(
        &self,
        hash: B256,
        attempts: &AtomicU32,
    ) -> Result<RpcTransaction, ChunkFetchError> {
        let method = Call::Transaction.method();
        let target = format!("transaction {hash}");
        self.request(method, &target, attempts, || self.source.transaction(hash))
            .await?
            .ok_or_else(|| ChunkFetchError::not_found(method, target))
    }

    async fn logs(
        &self,
        filter: LogFilter,
        attempts: &AtomicU32,
    ) -> Result<Vec<RpcLog>, ChunkFetchError> {
        let method = Call::Logs.method();
        let target = format!("blocks {}..={}", filter.from_block, filter.to_block);
        self.request(method, &target, attempts, || self.source.logs(&filter))
            .await
    }

    /// One filter per `inner_request_size` blocks of each contiguous interval of the chunk.
    pub(crate) fn log_filters(&self, chunk: &Chunk) -> Vec<LogFilter> {
        let (addresses, topic0s) = self.log_constraints(chunk);
        let step = self.options.inner_request_size.max(1);

        let ChunkSegment::Blocks(intervals) = &chunk.segment else {
            return Vec::new();
        };
        intervals
            .iter()
            .flat_map(|interval| {
                (interval.start..interval.end)
                    .step_by(step as usize)
                    .map(move |from| (from, (from + step).min(interval.end) - 1))
            })
            .map(|(from_block, to_block)| LogFilter {
                from_block,
                to_block,
                addresses: addresses.clone(),
                topic0s: topic0s.clone(),
            })
            .collect()
    }

    /// Address and topic0 constraints of the chunk. A partition key value replaces the query
    /// filter of its dimension.
    fn log_constraints(&self, chunk: &Chunk) -> (Vec<Address>, Vec<B256>) {
        let key = chunk.partition_key.as_ref();
        let addresses = match key.and_then(|key| key.address()) {
            Some(address) => vec![address],
            None => self.options.addresses.clone(),
        };
        let topic0s = match key.and_then(|key| key.topic0()) {
            Some(topic0) => vec![topic0],
            None => self.options.topic0s.clone(),
        };
        (addresses, topic0s)
    }

    /// Converts the collected responses into raw records of the chunk's datatype.
    fn records(
        &self,
        chunk: &Chunk,
        table: &TableSchema,
        data: &ChunkData,
    ) -> Result<Vec<RawRecord>, ChunkFetchError> {
        let needs_receipts = table.needs_source(ColumnSource::Receipt);
        let with_receipt = |tx: &RpcTransaction| {
            let receipt = data.receipts.get(&tx.hash);
            // Only reachable with `exclude_failed`: the receipt request was dropped.
            if needs_receipts && receipt.is_none() {
                return None;
            }
            Some(tables::transaction_record(tx, receipt))
        };

        let records = match (chunk.datatype, &chunk.segment) {
            (Datatype::Blocks, _) => data.blocks.iter().map(tables::block_record).collect(),
            (Datatype::Transactions, ChunkSegment::Blocks(_)) => {
                let mut records = Vec::new();
                for block in &data.blocks {
                    let BlockTransactions::Full(txs) = &block.transactions else {
                        return Err(ChunkFetchError::not_found(
                            Call::BlockWithTransactions.method(),
                            format!("transaction objects of block {}", block.number),
                        ));
                    };
                    records.extend(txs.iter().filter_map(with_receipt));
                }
                records
            }
            (Datatype::Transactions, ChunkSegment::Transactions(_)) => {
                data.transactions.iter().filter_map(with_receipt).collect()
            }
            (Datatype::Logs, ChunkSegment::Blocks(_)) => data
                .logs
                .iter()
                .filter(|log| !log.removed)
                .map(tables::log_record)
                .collect(),
            (Datatype::Logs, ChunkSegment::Transactions(hashes)) => {
                let (addresses, topic0s) = self.log_constraints(chunk);
                hashes
                    .iter()
                    .filter_map(|hash| data.receipts.get(hash))
                    .flat_map(|receipt| &receipt.logs)
                    .filter(|log| {
                        let address = addresses.is_empty() || addresses.contains(&log.address);
                        let topic0 = topic0s.is_empty()
                            || log.topics.first().is_some_and(|t| topic0s.contains(t));
                        address && topic0
                    })
                    .map(tables::log_record)
                    .collect()
            }
        };
        Ok(records)
    }
}

/// Block numbers and transaction hashes of the blocks that have transactions.
fn blocks_with_transactions(blocks: &[RpcBlock]) -> Vec<(BlockNum, Vec<B256>)> {
    blocks
        .iter()
        .filter(|block| !block.transactions.is_empty())
        .map(|block| (block.number, block.transactions.hashes()))
        .collect()
}

fn transaction_hashes(chunk: &Chunk) -> &[B256] {
    match &chunk.segment {
        ChunkSegment::Transactions(hashes) => hashes,
        ChunkSegment::Blocks(_) => &[],
    }
}

/// Resolves the chain head through an [`RpcSource`], retrying transient failures.
pub struct HeadResolver<S> {
    source: Arc<S>,
    retry: RetryPolicy,
}

impl<S> HeadResolver<S> {
    pub fn new(source: Arc<S>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }
}

impl<S: RpcSource> LatestBlockResolver for HeadResolver<S> {
    async fn latest_block(&self) -> Result<BlockNum, BoxError> {
        let latest = (|| self.source.latest_block())
            .retry(self.retry.backoff())
            .when(RpcError::is_retryable)
            .notify(|err, delay| {
                tracing::warn!(
                    error = %err,
                    error_source = logging::error_source(err),
                    "eth_blockNumber failed. Retrying in {:.1}s",
                    delay.as_secs_f32()
                );
            })
            .await?;
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroU32, time::Duration};

    use alloy::primitives::Address;
    use arrow::array::{AsArray as _, RecordBatch};
    use arrow::datatypes::UInt64Type;
    use common::{PartitionKey, PartitionValue};
    use datasets_raw::{AssembleOptions, ColumnSelection};

    use super::*;
    use crate::{
        limits::FetchLimits,
        mock::{Failure, MockSource},
    };

    fn fetcher(source: MockSource, options: FetchOptions) -> Fetcher<MockSource> {
        fetcher_with_limits(source, options, FetchLimits::default())
    }

    fn fetcher_with_limits(
        source: MockSource,
        options: FetchOptions,
        limits: FetchLimits,
    ) -> Fetcher<MockSource> {
        let limits = Arc::new(Limits::new(&limits));
        let retry = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
        };
        Fetcher::new(
            Arc::new(source),
            limits,
            retry,
            options,
            CancellationToken::new(),
        )
    }

    fn chunk(datatype: Datatype, segment: ChunkSegment) -> Chunk {
        Chunk {
            datatype,
            segment,
            partition_key: None,
            sequence_index: 0,
        }
    }

    fn table(datatype: Datatype) -> TableSchema {
        TableSchema::new(
            datatype,
            &ColumnSelection::default(),
            &AssembleOptions::default(),
        )
        .expect("Failed to project schema")
    }

    fn block_numbers(batch: &RecordBatch) -> Vec<u64> {
        let column = batch
            .column_by_name("block_number")
            .expect("block_number column should exist");
        column.as_primitive::<UInt64Type>().values().to_vec()
    }

    #[tokio::test]
    async fn fetch_blocks_fans_out_per_block() {
        //* Given
        let source = MockSource::new(0..20);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![5..10]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Blocks)).await;

        //* Then
        let batch = outcome.result.expect("Failed to fetch chunk");
        assert_eq!(block_numbers(&batch), vec![5, 6, 7, 8, 9]);
        assert_eq!(outcome.attempts, 5);
        assert_eq!(source.calls("eth_getBlockByNumber"), 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        //* Given
        let source = MockSource::new(0..10);
        source.fail_block(3, Failure::Transient { times: 2 });
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![0..5]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Blocks)).await;

        //* Then
        assert!(outcome.result.is_ok(), "got {:?}", outcome.result);
        assert_eq!(outcome.attempts, 7);
    }

    #[tokio::test]
    async fn permanent_failure_fails_the_chunk_after_max_retries() {
        //* Given
        let source = MockSource::new(0..10);
        source.fail_block(3, Failure::Permanent);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![3..4]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Blocks)).await;

        //* Then
        let err = outcome.result.expect_err("chunk should fail");
        assert!(matches!(err, ChunkFetchError::Request { .. }), "got {err:?}");
        assert_eq!(outcome.attempts, 4, "one attempt plus three retries");
    }

    #[tokio::test]
    async fn exclude_failed_drops_failed_units() {
        //* Given
        let source = MockSource::new(0..10);
        source.fail_block(2, Failure::Permanent);
        let options = FetchOptions {
            exclude_failed: true,
            ..Default::default()
        };
        let fetcher = fetcher(source, options);
        let chunk = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![0..4]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Blocks)).await;

        //* Then
        let batch = outcome.result.expect("Failed to fetch chunk");
        assert_eq!(block_numbers(&batch), vec![0, 1, 3]);
        assert_eq!(outcome.excluded.len(), 1);
        assert!(outcome.excluded[0].contains("block 2"));
    }

    #[tokio::test]
    async fn block_receipts_failure_falls_back_to_per_transaction_receipts() {
        //* Given
        let source = MockSource::new(0..10).with_transactions_per_block(3);
        source.fail_method("eth_getBlockReceipts", Failure::Permanent);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..2]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Transactions)).await;

        //* Then
        let batch = outcome.result.expect("Failed to fetch chunk");
        assert_eq!(batch.num_rows(), 6);
        assert_eq!(source.calls("eth_getTransactionReceipt"), 6);
    }

    #[tokio::test]
    async fn fallback_produces_the_same_rows_as_the_coarse_path() {
        //* Given
        let coarse = MockSource::new(0..10).with_transactions_per_block(4);
        let fine = coarse.clone_chain();
        fine.fail_method("eth_getBlockReceipts", Failure::Permanent);
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![2..6]));
        let table = table(Datatype::Transactions);

        //* When
        let coarse = fetcher(coarse, FetchOptions::default())
            .fetch(chunk.clone(), &table)
            .await;
        let fine = fetcher(fine, FetchOptions::default())
            .fetch(chunk, &table)
            .await;

        //* Then
        let coarse = coarse.result.expect("Failed to fetch coarse chunk");
        let fine = fine.result.expect("Failed to fetch fine chunk");
        assert_eq!(coarse, fine);
    }

    #[tokio::test]
    async fn block_receipts_fall_back_only_for_the_failing_block() {
        //* Given
        let source = MockSource::new(0..10).with_transactions_per_block(3);
        source.fail_block_receipts(1, Failure::Permanent);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..4]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Transactions)).await;

        //* Then
        assert_eq!(outcome.n_rows(), 12);
        assert_eq!(
            source.calls("eth_getBlockReceipts"),
            3 + 4,
            "healthy blocks once, the failing block with three retries"
        );
        assert_eq!(source.calls("eth_getTransactionReceipt"), 3);
    }

    #[tokio::test]
    async fn fallback_with_missing_item_fails_the_whole_chunk() {
        //* Given
        let source = MockSource::new(0..10).with_transactions_per_block(2);
        source.fail_method("eth_getBlockReceipts", Failure::Permanent);
        let missing = source.transaction_hashes(1)[1];
        source.fail_transaction(missing, Failure::Missing);
        let fetcher = fetcher(source, FetchOptions::default());
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..3]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Transactions)).await;

        //* Then
        let err = outcome.result.expect_err("chunk should fail");
        assert!(matches!(err, ChunkFetchError::Fallback { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn mismatched_block_receipts_trigger_fallback() {
        //* Given
        let source = MockSource::new(0..10).with_transactions_per_block(2);
        source.truncate_block_receipts(true);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..1]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Transactions)).await;

        //* Then
        assert_eq!(outcome.n_rows(), 2);
        assert_eq!(source.calls("eth_getTransactionReceipt"), 2);
    }

    #[tokio::test]
    async fn receipts_are_not_fetched_when_not_projected() {
        //* Given
        let source = MockSource::new(0..10).with_transactions_per_block(2);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..3]));
        let selection = ColumnSelection {
            exclude_columns: vec!["gas_used".to_string(), "success".to_string()],
            ..Default::default()
        };
        let table = TableSchema::new(
            Datatype::Transactions,
            &selection,
            &AssembleOptions::default(),
        )
        .expect("Failed to project schema");

        //* When
        let outcome = fetcher.fetch(chunk, &table).await;

        //* Then
        assert_eq!(outcome.n_rows(), 6);
        assert_eq!(source.calls("eth_getBlockReceipts"), 0);
        assert_eq!(source.calls("eth_getTransactionReceipt"), 0);
    }

    #[tokio::test]
    async fn logs_are_requested_per_inner_request_size_and_filtered_by_partition_key() {
        //* Given
        let source = MockSource::new(0..20).with_transactions_per_block(2);
        let address = source.log_addresses()[0];
        let options = FetchOptions {
            inner_request_size: 4,
            ..Default::default()
        };
        let fetcher = fetcher(source.clone(), options);
        let mut chunk = chunk(Datatype::Logs, ChunkSegment::Blocks(vec![0..10]));
        chunk.partition_key = Some(PartitionKey::new(vec![PartitionValue::Address(address)]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Logs)).await;

        //* Then
        let batch = outcome.result.expect("Failed to fetch chunk");
        assert_eq!(source.calls("eth_getLogs"), 3, "0..=3, 4..=7, 8..=9");
        assert!(batch.num_rows() > 0);
        let addresses = batch
            .column_by_name("address")
            .expect("address column should exist")
            .as_binary::<i32>();
        assert!(addresses.iter().all(|a| a == Some(address.as_slice())));
    }

    #[tokio::test]
    async fn transaction_domain_fetches_each_hash() {
        //* Given
        let source = MockSource::new(0..5).with_transactions_per_block(2);
        let hashes = source.transaction_hashes(3);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        let chunk = chunk(
            Datatype::Transactions,
            ChunkSegment::Transactions(hashes.clone()),
        );

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Transactions)).await;

        //* Then
        assert_eq!(outcome.n_rows(), 2);
        assert_eq!(source.calls("eth_getTransactionByHash"), 2);
        assert_eq!(source.calls("eth_getTransactionReceipt"), 2);
    }

    #[tokio::test]
    async fn cancelled_fetch_issues_no_requests() {
        //* Given
        let source = MockSource::new(0..10);
        let fetcher = fetcher(source.clone(), FetchOptions::default());
        fetcher.cancel.cancel();
        let chunk = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![0..5]));

        //* When
        let outcome = fetcher.fetch(chunk, &table(Datatype::Blocks)).await;

        //* Then
        let err = outcome.result.expect_err("chunk should be cancelled");
        assert!(err.is_cancelled());
        assert_eq!(source.calls("eth_getBlockByNumber"), 0);
    }

    #[tokio::test]
    async fn spawned_fetch_stops_issuing_requests_once_cancelled() {
        //* Given
        let source = MockSource::new(0..300).with_latency(Duration::from_millis(50));
        let limits = FetchLimits {
            max_concurrent_requests: 10,
            ..Default::default()
        };
        let fetcher = fetcher_with_limits(source.clone(), FetchOptions::default(), limits);
        let cancel = fetcher.cancel.clone();
        let chunk = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![0..200]));
        let table = table(Datatype::Blocks);

        //* When
        let task = tokio::spawn(async move { fetcher.fetch(chunk, &table).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = task.await.expect("Failed to join fetch task");

        //* Then
        let err = outcome.result.expect_err("chunk should be cancelled");
        assert!(err.is_cancelled(), "got {err:?}");
        assert!(
            source.calls("eth_getBlockByNumber") <= 10,
            "only the requests in flight at cancellation complete, got {}",
            source.calls("eth_getBlockByNumber")
        );
    }

    #[tokio::test]
    async fn concurrent_request_bound_is_shared_across_chunks() {
        //* Given
        let source = MockSource::new(0..100).with_latency(Duration::from_millis(5));
        let limits = FetchLimits {
            max_concurrent_requests: 3,
            ..Default::default()
        };
        let fetcher = fetcher_with_limits(source.clone(), FetchOptions::default(), limits);
        let table = table(Datatype::Blocks);
        let first = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![0..20]));
        let second = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![20..40]));

        //* When
        let (first, second) =
            tokio::join!(fetcher.fetch(first, &table), fetcher.fetch(second, &table));

        //* Then
        assert_eq!(first.n_rows() + second.n_rows(), 40);
        assert_eq!(source.peak_in_flight(), 3);
    }

    #[tokio::test]
    async fn request_rate_is_shared_across_chunks() {
        //* Given
        let source = MockSource::new(0..100);
        let limits = FetchLimits {
            requests_per_second: NonZeroU32::new(20),
            ..Default::default()
        };
        let fetcher = fetcher_with_limits(source.clone(), FetchOptions::default(), limits);
        let table = table(Datatype::Blocks);
        let first = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![0..20]));
        let second = chunk(Datatype::Blocks, ChunkSegment::Blocks(vec![20..40]));

        //* When
        let started = std::time::Instant::now();
        let (first, second) =
            tokio::join!(fetcher.fetch(first, &table), fetcher.fetch(second, &table));
        let elapsed = started.elapsed();

        //* Then
        assert_eq!(first.n_rows() + second.n_rows(), 40);
        // A burst of 20, then the other 20 requests at 20 per second.
        assert!(
            elapsed >= Duration::from_millis(900),
            "40 requests at 20 rps took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn head_resolver_retries_transient_failures() {
        //* Given
        let source = MockSource::new(0..100);
        source.fail_method("eth_blockNumber", Failure::Transient { times: 1 });
        let retry = RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        };
        let resolver = HeadResolver::new(Arc::new(source), retry);

        //* When
        let latest = resolver.latest_block().await;

        //* Then
        assert_eq!(latest.expect("Failed to resolve head"), 99);
    }

    #[test]
    fn log_filters_split_intervals() {
        //* Given
        let options = FetchOptions {
            inner_request_size: 3,
            addresses: vec![Address::repeat_byte(1)],
            ..Default::default()
        };
        let fetcher = fetcher(MockSource::new(0..1), options);
        let chunk = chunk(Datatype::Logs, ChunkSegment::Blocks(vec![0..5, 10..11]));

        //* When
        let filters = fetcher.log_filters(&chunk);

        //* Then
        let bounds: Vec<_> = filters.iter().map(|f| (f.from_block, f.to_block)).collect();
        assert_eq!(bounds, vec![(0, 2), (3, 4), (10, 10)]);
        assert!(filters.iter().all(|f| f.addresses == vec![Address::repeat_byte(1)]));
    }
}
