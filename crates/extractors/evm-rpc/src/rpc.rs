//! JSON-RPC wire types and the remote source seam.
//!
//! Only the fields the datasets use are decoded. Optional fields that a node may leave out are
//! `Option`s, and the row builders simply omit absent values so that the assembler can decide
//! whether the projection tolerates them.

use std::future::Future;

use alloy::primitives::{Address, B256, Bytes, U256};
use common::BlockNum;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// The remote calls the fetcher needs from a node.
///
/// [`JsonRpcClient`](crate::JsonRpcClient) implements this over HTTP. Every method maps to a
/// single JSON-RPC request; retries, rate limiting and concurrency are handled by the caller.
pub trait RpcSource: Send + Sync + 'static {
    /// `eth_blockNumber`
    fn latest_block(&self) -> impl Future<Output = Result<BlockNum, RpcError>> + Send;

    /// `eth_getBlockByNumber`, with full transaction objects when `full` is set
    fn block(
        &self,
        number: BlockNum,
        full: bool,
    ) -> impl Future<Output = Result<Option<RpcBlock>, RpcError>> + Send;

    /// `eth_getBlockReceipts`
    fn block_receipts(
        &self,
        number: BlockNum,
    ) -> impl Future<Output = Result<Option<Vec<RpcReceipt>>, RpcError>> + Send;

    /// `eth_getTransactionByHash`
    fn transaction(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<RpcTransaction>, RpcError>> + Send;

    /// `eth_getTransactionReceipt`
    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<RpcReceipt>, RpcError>> + Send;

    /// `eth_getLogs`
    fn logs(
        &self,
        filter: &LogFilter,
    ) -> impl Future<Output = Result<Vec<RpcLog>, RpcError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    #[serde(with = "alloy::serde::quantity")]
    pub number: BlockNum,
    pub hash: B256,
    pub parent_hash: B256,
    pub miner: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    #[serde(with = "alloy::serde::quantity")]
    pub gas_used: u64,
    #[serde(with = "alloy::serde::quantity")]
    pub gas_limit: u64,
    pub extra_data: Bytes,
    pub logs_bloom: Bytes,
    #[serde(with = "alloy::serde::quantity")]
    pub timestamp: u64,
    #[serde(default)]
    pub difficulty: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_difficulty: Option<U256>,
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u64>,
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_fee_per_gas: Option<u64>,
    pub transactions: BlockTransactions,
}

/// Transactions of a block: full objects or hashes, depending on the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Full(Vec<RpcTransaction>),
    Hashes(Vec<B256>),
}

impl BlockTransactions {
    pub fn len(&self) -> usize {
        match self {
            BlockTransactions::Full(txs) => txs.len(),
            BlockTransactions::Hashes(hashes) => hashes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hashes(&self) -> Vec<B256> {
        match self {
            BlockTransactions::Full(txs) => txs.iter().map(|tx| tx.hash).collect(),
            BlockTransactions::Hashes(hashes) => hashes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    #[serde(with = "alloy::serde::quantity")]
    pub nonce: u64,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub block_number: Option<BlockNum>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub transaction_index: Option<u64>,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    #[serde(with = "alloy::serde::quantity")]
    pub gas: u64,
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub gas_price: Option<u64>,
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_priority_fee_per_gas: Option<u64>,
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_fee_per_gas: Option<u64>,
    #[serde(
        rename = "type",
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub transaction_type: Option<u64>,
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub transaction_index: Option<u64>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub block_number: Option<BlockNum>,
    #[serde(with = "alloy::serde::quantity")]
    pub gas_used: u64,
    /// `1` on success. Absent for pre-Byzantium receipts.
    #[serde(
        default,
        with = "alloy::serde::quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<u64>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub block_number: Option<BlockNum>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub transaction_index: Option<u64>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

/// Parameters of an `eth_getLogs` request. Both block bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: BlockNum,
    pub to_block: BlockNum,
    /// Matches any of the addresses; empty matches all
    pub addresses: Vec<Address>,
    /// Matches any of the first topics; empty matches all
    pub topic0s: Vec<B256>,
}

impl LogFilter {
    pub fn matches(&self, log: &RpcLog) -> bool {
        let in_range = log
            .block_number
            .is_some_and(|n| (self.from_block..=self.to_block).contains(&n));
        let address = self.addresses.is_empty() || self.addresses.contains(&log.address);
        let topic0 = self.topic0s.is_empty()
            || log.topics.first().is_some_and(|t| self.topic0s.contains(t));
        in_range && address && topic0
    }

    /// JSON-RPC filter object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut filter = serde_json::json!({
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
        });
        if !self.addresses.is_empty() {
            filter["address"] = serde_json::json!(self.addresses);
        }
        if !self.topic0s.is_empty() {
            filter["topics"] = serde_json::json!([self.topic0s]);
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_block_with_transaction_hashes() {
        //* Given
        let json = serde_json::json!({
            "number": "0x10",
            "hash": B256::repeat_byte(1),
            "parentHash": B256::repeat_byte(2),
            "miner": Address::repeat_byte(3),
            "stateRoot": B256::ZERO,
            "transactionsRoot": B256::ZERO,
            "receiptsRoot": B256::ZERO,
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "extraData": "0x",
            "logsBloom": "0x00",
            "timestamp": "0x6553f100",
            "difficulty": "0x0",
            "baseFeePerGas": "0x7",
            "transactions": [B256::repeat_byte(9)],
        });

        //* When
        let block: RpcBlock = serde_json::from_value(json).expect("Failed to decode block");

        //* Then
        assert_eq!(block.number, 16);
        assert_eq!(block.gas_used, 21_000);
        assert_eq!(block.base_fee_per_gas, Some(7));
        assert_eq!(block.size, None);
        assert_eq!(
            block.transactions,
            BlockTransactions::Hashes(vec![B256::repeat_byte(9)])
        );
    }

    #[test]
    fn log_filter_json_includes_only_given_constraints() {
        //* Given
        let filter = LogFilter {
            from_block: 16,
            to_block: 31,
            addresses: vec![],
            topic0s: vec![B256::repeat_byte(0xaa)],
        };

        //* When
        let json = filter.to_json();

        //* Then
        assert_eq!(json["fromBlock"], "0x10");
        assert_eq!(json["toBlock"], "0x1f");
        assert!(json.get("address").is_none());
        assert_eq!(json["topics"][0][0], B256::repeat_byte(0xaa).to_string());
    }
}
