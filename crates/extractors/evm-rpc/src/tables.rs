//! Conversion of JSON-RPC responses into raw records.
//!
//! Fields a node may leave out are only inserted when present. Whether a missing field is an
//! error is decided by the assembler against the projected schema.

use datasets_raw::{RawRecord, Timestamp};

use crate::rpc::{RpcBlock, RpcLog, RpcReceipt, RpcTransaction};

pub(crate) fn block_record(block: &RpcBlock) -> RawRecord {
    RawRecord::new()
        .with("block_hash", block.hash.as_slice())
        .with("parent_hash", block.parent_hash.as_slice())
        .with("author", block.miner.as_slice())
        .with("state_root", block.state_root.as_slice())
        .with("transactions_root", block.transactions_root.as_slice())
        .with("receipts_root", block.receipts_root.as_slice())
        .with("block_number", block.number)
        .with("gas_used", block.gas_used)
        .with("gas_limit", block.gas_limit)
        .with("extra_data", &block.extra_data[..])
        .with("logs_bloom", &block.logs_bloom[..])
        .with("timestamp", Timestamp::from_secs(block.timestamp))
        .with("difficulty", block.difficulty)
        .with("total_difficulty", block.total_difficulty)
        .with("size", block.size)
        .with("base_fee_per_gas", block.base_fee_per_gas)
        .with("transaction_count", block.transactions.len() as u64)
}

/// Builds a transaction row. Receipt columns are only filled when a receipt is given.
pub(crate) fn transaction_record(tx: &RpcTransaction, receipt: Option<&RpcReceipt>) -> RawRecord {
    let mut record = RawRecord::new()
        .with("transaction_hash", tx.hash.as_slice())
        .with("nonce", tx.nonce)
        .with("from_address", tx.from.as_slice())
        .with("to_address", tx.to.map(|to| to.to_vec()))
        .with("value", tx.value)
        .with("input", &tx.input[..])
        .with("gas_limit", tx.gas)
        .with("gas_price", tx.gas_price)
        .with("transaction_type", tx.transaction_type)
        .with("max_priority_fee_per_gas", tx.max_priority_fee_per_gas)
        .with("max_fee_per_gas", tx.max_fee_per_gas)
        .with("chain_id", tx.chain_id);

    if let Some(block_number) = tx.block_number {
        record.insert("block_number", block_number);
    }
    if let Some(block_hash) = tx.block_hash {
        record.insert("block_hash", block_hash.as_slice());
    }
    if let Some(index) = tx.transaction_index {
        record.insert("transaction_index", index);
    }
    if let Some(receipt) = receipt {
        record.insert("gas_used", receipt.gas_used);
        if let Some(status) = receipt.status {
            record.insert("success", status == 1);
        }
    }
    record
}

pub(crate) fn log_record(log: &RpcLog) -> RawRecord {
    let mut record = RawRecord::new()
        .with("address", log.address.as_slice())
        .with("data", &log.data[..]);
    for (column, i) in [("topic0", 0), ("topic1", 1), ("topic2", 2), ("topic3", 3)] {
        record.insert(column, log.topics.get(i).map(|t| t.to_vec()));
    }

    if let Some(block_number) = log.block_number {
        record.insert("block_number", block_number);
    }
    if let Some(block_hash) = log.block_hash {
        record.insert("block_hash", block_hash.as_slice());
    }
    if let Some(tx_hash) = log.transaction_hash {
        record.insert("transaction_hash", tx_hash.as_slice());
    }
    if let Some(index) = log.transaction_index {
        record.insert("transaction_index", index);
    }
    if let Some(index) = log.log_index {
        record.insert("log_index", index);
    }
    record
}
