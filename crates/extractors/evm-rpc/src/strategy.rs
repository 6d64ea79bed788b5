//! Per-datatype fetch strategies.
//!
//! A chunk is fetched by running a short list of steps in order. Each step is either a
//! [`FetchStrategy::Direct`] request or a [`FetchStrategy::Fallback`] pair, where the coarse
//! primary request is replaced by fine-grained secondary requests when it fails. Block receipts
//! fall back one block at a time, so only the blocks whose receipts failed are refetched per
//! transaction. Adding a datatype means adding its steps here and its row conversion in the
//! fetcher; the coordinator is not involved.

use common::{Chunk, ChunkSegment, Datatype};
use datasets_raw::{ColumnSource, TableSchema};

/// A remote call used by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// Block header with transaction hashes only
    Block,
    /// Block with full transaction objects
    BlockWithTransactions,
    BlockReceipts,
    Transaction,
    TransactionReceipt,
    Logs,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Block | Call::BlockWithTransactions => "eth_getBlockByNumber",
            Call::BlockReceipts => "eth_getBlockReceipts",
            Call::Transaction => "eth_getTransactionByHash",
            Call::TransactionReceipt => "eth_getTransactionReceipt",
            Call::Logs => "eth_getLogs",
        }
    }
}

/// How many requests a step issues for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestShape {
    /// One request per contiguous interval of the chunk, split into `inner_request_size` blocks
    PerChunk,
    /// One request per unit of the chunk: per block or per transaction hash
    PerUnit,
    /// One request per item found inside the units, e.g. per transaction of a fetched block
    PerItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub call: Call,
    pub shape: RequestShape,
}

impl Request {
    pub const fn new(call: Call, shape: RequestShape) -> Self {
        Self { call, shape }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Direct(Request),
    /// Try `primary`; on any failure re-issue as `secondary`, which must fully succeed.
    ///
    /// Block receipts fall back per block, any other pair for the whole step.
    Fallback { primary: Request, secondary: Request },
}

impl FetchStrategy {
    pub fn primary(&self) -> Request {
        match self {
            FetchStrategy::Direct(request) => *request,
            FetchStrategy::Fallback { primary, .. } => *primary,
        }
    }
}

/// Steps needed to fetch one chunk of `table`'s datatype.
///
/// Receipt steps are only included when a receipt-derived column is projected. With
/// `receipts_per_tx` the block receipts shortcut is skipped and receipts are always fetched
/// per transaction.
pub fn steps(chunk: &Chunk, table: &TableSchema, receipts_per_tx: bool) -> Vec<FetchStrategy> {
    use Call::*;
    use RequestShape::*;

    let tx_domain = matches!(chunk.segment, ChunkSegment::Transactions(_));
    let needs_receipts = table.needs_source(ColumnSource::Receipt);

    match (chunk.datatype, tx_domain) {
        (Datatype::Blocks, _) => vec![FetchStrategy::Direct(Request::new(Block, PerUnit))],
        (Datatype::Transactions, false) => {
            let mut steps = vec![FetchStrategy::Direct(Request::new(
                BlockWithTransactions,
                PerUnit,
            ))];
            if needs_receipts {
                let per_tx = Request::new(TransactionReceipt, PerItem);
                steps.push(if receipts_per_tx {
                    FetchStrategy::Direct(per_tx)
                } else {
                    FetchStrategy::Fallback {
                        primary: Request::new(BlockReceipts, PerUnit),
                        secondary: per_tx,
                    }
                });
            }
            steps
        }
        (Datatype::Transactions, true) => {
            let mut steps = vec![FetchStrategy::Direct(Request::new(Transaction, PerUnit))];
            if needs_receipts {
                steps.push(FetchStrategy::Direct(Request::new(
                    TransactionReceipt,
                    PerUnit,
                )));
            }
            steps
        }
        (Datatype::Logs, false) => vec![FetchStrategy::Direct(Request::new(Logs, PerChunk))],
        (Datatype::Logs, true) => vec![FetchStrategy::Direct(Request::new(
            TransactionReceipt,
            PerUnit,
        ))],
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;
    use datasets_raw::{AssembleOptions, ColumnSelection};

    use super::*;

    fn chunk(datatype: Datatype, segment: ChunkSegment) -> Chunk {
        Chunk {
            datatype,
            segment,
            partition_key: None,
            sequence_index: 0,
        }
    }

    fn table(datatype: Datatype, exclude: &[&str]) -> TableSchema {
        let selection = ColumnSelection {
            exclude_columns: exclude.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        };
        TableSchema::new(datatype, &selection, &AssembleOptions::default())
            .expect("Failed to project schema")
    }

    #[test]
    fn transactions_fetch_receipts_with_fallback() {
        //* Given
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..10]));

        //* When
        let steps = steps(&chunk, &table(Datatype::Transactions, &[]), false);

        //* Then
        assert_eq!(
            steps,
            vec![
                FetchStrategy::Direct(Request::new(
                    Call::BlockWithTransactions,
                    RequestShape::PerUnit
                )),
                FetchStrategy::Fallback {
                    primary: Request::new(Call::BlockReceipts, RequestShape::PerUnit),
                    secondary: Request::new(Call::TransactionReceipt, RequestShape::PerItem),
                },
            ]
        );
    }

    #[test]
    fn receipts_are_skipped_when_no_receipt_column_is_projected() {
        //* Given
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..10]));
        let table = table(Datatype::Transactions, &["gas_used", "success"]);

        //* When
        let steps = steps(&chunk, &table, false);

        //* Then
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].primary().call, Call::BlockWithTransactions);
    }

    #[test]
    fn receipts_per_tx_skips_block_receipts() {
        //* Given
        let chunk = chunk(Datatype::Transactions, ChunkSegment::Blocks(vec![0..10]));

        //* When
        let steps = steps(&chunk, &table(Datatype::Transactions, &[]), true);

        //* Then
        assert_eq!(
            steps[1],
            FetchStrategy::Direct(Request::new(
                Call::TransactionReceipt,
                RequestShape::PerItem
            ))
        );
    }

    #[test]
    fn logs_in_transaction_domain_come_from_receipts() {
        //* Given
        let chunk = chunk(
            Datatype::Logs,
            ChunkSegment::Transactions(vec![B256::repeat_byte(1)]),
        );

        //* When
        let steps = steps(&chunk, &table(Datatype::Logs, &[]), false);

        //* Then
        assert_eq!(
            steps,
            vec![FetchStrategy::Direct(Request::new(
                Call::TransactionReceipt,
                RequestShape::PerUnit
            ))]
        );
    }
}
