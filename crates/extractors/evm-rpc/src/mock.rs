//! In-memory [`RpcSource`] for tests.
//!
//! [`MockSource`] serves a deterministic chain: every block carries a configurable number of
//! transactions and every transaction emits one log. Failures can be injected per method, per
//! block or per transaction hash, and every call is counted. With a latency set, the highest
//! number of calls in flight at once is tracked too.

use std::{
    collections::HashMap,
    ops::{Range, RangeInclusive},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::primitives::{Address, B256, Bytes, U256};
use common::BlockNum;

use crate::{
    error::RpcError,
    rpc::{BlockTransactions, LogFilter, RpcBlock, RpcLog, RpcReceipt, RpcSource, RpcTransaction},
};

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Fails with a retryable error the given number of times, then succeeds
    Transient { times: usize },
    /// Always fails with a retryable error
    Permanent,
    /// Always fails with a non-retryable JSON-RPC error
    Rejected,
    /// Answers `null`
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Method(&'static str),
    Block(BlockNum),
    BlockReceipts(BlockNum),
    Transaction(B256),
}

#[derive(Debug)]
struct Rule {
    scope: Scope,
    failure: Failure,
    remaining: usize,
}

enum Target {
    Head,
    Block(BlockNum),
    Blocks(RangeInclusive<BlockNum>),
    Transaction(B256),
}

impl Scope {
    fn matches(&self, method: &'static str, target: &Target) -> bool {
        match (self, target) {
            (Scope::Method(m), _) => *m == method,
            (Scope::Block(n), Target::Block(b)) => n == b,
            (Scope::Block(n), Target::Blocks(range)) => range.contains(n),
            (Scope::BlockReceipts(n), Target::Block(b)) => {
                method == "eth_getBlockReceipts" && n == b
            }
            (Scope::Transaction(h), Target::Transaction(t)) => h == t,
            _ => false,
        }
    }
}

struct Chain {
    blocks: Range<BlockNum>,
    transactions_per_block: u64,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// A deterministic chain served from memory.
#[derive(Clone)]
pub struct MockSource {
    chain: Arc<Chain>,
    state: Arc<Mutex<State>>,
    truncate_block_receipts: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
    latency: Duration,
}

impl MockSource {
    /// A chain with the given blocks and no transactions. The last block is the head.
    pub fn new(blocks: Range<BlockNum>) -> Self {
        Self {
            chain: Arc::new(Chain {
                blocks,
                transactions_per_block: 0,
            }),
            state: Default::default(),
            truncate_block_receipts: Default::default(),
            in_flight: Default::default(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_transactions_per_block(self, n: u64) -> Self {
        let blocks = self.chain.blocks.clone();
        Self {
            chain: Arc::new(Chain {
                blocks,
                transactions_per_block: n,
            }),
            ..self
        }
    }

    /// Delays every response.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self { latency, ..self }
    }

    /// The same chain with fresh counters and no injected failures.
    pub fn clone_chain(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            state: Default::default(),
            truncate_block_receipts: Default::default(),
            in_flight: Default::default(),
            latency: self.latency,
        }
    }

    pub fn fail_method(&self, method: &'static str, failure: Failure) {
        self.add_rule(Scope::Method(method), failure);
    }

    /// Fails every call touching the block: block, block receipts and logs ranges.
    pub fn fail_block(&self, number: BlockNum, failure: Failure) {
        self.add_rule(Scope::Block(number), failure);
    }

    /// Fails `eth_getBlockReceipts` for one block only.
    pub fn fail_block_receipts(&self, number: BlockNum, failure: Failure) {
        self.add_rule(Scope::BlockReceipts(number), failure);
    }

    /// Fails transaction and receipt lookups of the hash.
    pub fn fail_transaction(&self, hash: B256, failure: Failure) {
        self.add_rule(Scope::Transaction(hash), failure);
    }

    /// Makes `eth_getBlockReceipts` drop the last receipt of every block.
    pub fn truncate_block_receipts(&self, truncate: bool) {
        self.truncate_block_receipts.store(truncate, Ordering::Relaxed);
    }

    /// Removes every injected failure.
    pub fn heal(&self) {
        self.lock().rules.clear();
    }

    /// Number of calls made to a method, failed ones included.
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    pub fn transaction_hashes(&self, number: BlockNum) -> Vec<B256> {
        (0..self.chain.transactions_per_block)
            .map(|i| tx_hash(number, i))
            .collect()
    }

    /// Addresses emitting logs, alternating by transaction index.
    pub fn log_addresses(&self) -> [Address; 2] {
        [Address::repeat_byte(0xa0), Address::repeat_byte(0xa1)]
    }

    /// Topic0 values of the emitted logs, alternating by transaction index.
    pub fn log_topic0s(&self) -> [B256; 2] {
        [B256::repeat_byte(0xe0), B256::repeat_byte(0xe1)]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_rule(&self, scope: Scope, failure: Failure) {
        let remaining = match failure {
            Failure::Transient { times } => times,
            _ => usize::MAX,
        };
        self.lock().rules.push(Rule {
            scope,
            failure,
            remaining,
        });
    }

    /// Counts the call and applies matching failure rules. `Ok(false)` means answer `null`.
    async fn enter(&self, method: &'static str, target: Target) -> Result<bool, RpcError> {
        let current = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.peak.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.current.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        *state.calls.entry(method).or_default() += 1;
        for rule in state.rules.iter_mut() {
            if !rule.scope.matches(method, &target) || rule.remaining == 0 {
                continue;
            }
            return match rule.failure {
                Failure::Transient { .. } => {
                    rule.remaining -= 1;
                    Err(RpcError::Transport("injected transient failure".into()))
                }
                Failure::Permanent => Err(RpcError::Transport("injected failure".into())),
                Failure::Rejected => Err(RpcError::Response {
                    code: -32000,
                    message: "injected rejection".to_string(),
                }),
                Failure::Missing => Ok(false),
            };
        }
        Ok(true)
    }

    fn has_block(&self, number: BlockNum) -> bool {
        self.chain.blocks.contains(&number)
    }

    fn block_at(&self, number: BlockNum, full: bool) -> RpcBlock {
        let transactions = if full {
            BlockTransactions::Full(
                (0..self.chain.transactions_per_block)
                    .map(|i| self.transaction_at(number, i))
                    .collect(),
            )
        } else {
            BlockTransactions::Hashes(self.transaction_hashes(number))
        };
        RpcBlock {
            number,
            hash: block_hash(number),
            parent_hash: number.checked_sub(1).map(block_hash).unwrap_or_default(),
            miner: Address::repeat_byte(0x01),
            state_root: B256::repeat_byte(0x02),
            transactions_root: B256::repeat_byte(0x03),
            receipts_root: B256::repeat_byte(0x04),
            gas_used: 21_000 * self.chain.transactions_per_block,
            gas_limit: 30_000_000,
            extra_data: Bytes::from(number.to_be_bytes().to_vec()),
            logs_bloom: Bytes::from(vec![0; 256]),
            timestamp: 1_600_000_000 + number * 12,
            difficulty: U256::ZERO,
            total_difficulty: None,
            size: Some(1_000 + number),
            base_fee_per_gas: Some(7),
            transactions,
        }
    }

    fn transaction_at(&self, number: BlockNum, index: u64) -> RpcTransaction {
        RpcTransaction {
            hash: tx_hash(number, index),
            nonce: index,
            block_hash: Some(block_hash(number)),
            block_number: Some(number),
            transaction_index: Some(index),
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(number * 1_000 + index),
            input: Bytes::from(vec![index as u8; 4]),
            gas: 21_000,
            gas_price: Some(1_000_000_000),
            max_priority_fee_per_gas: Some(1),
            max_fee_per_gas: Some(2_000_000_000),
            transaction_type: Some(2),
            chain_id: Some(1),
        }
    }

    fn receipt_at(&self, number: BlockNum, index: u64) -> RpcReceipt {
        let parity = (index % 2) as usize;
        let log = RpcLog {
            address: self.log_addresses()[parity],
            topics: vec![self.log_topic0s()[parity], tx_hash(number, index)],
            data: Bytes::from(index.to_be_bytes().to_vec()),
            block_hash: Some(block_hash(number)),
            block_number: Some(number),
            transaction_hash: Some(tx_hash(number, index)),
            transaction_index: Some(index),
            log_index: Some(index),
            removed: false,
        };
        RpcReceipt {
            transaction_hash: tx_hash(number, index),
            transaction_index: Some(index),
            block_number: Some(number),
            gas_used: 21_000 + index,
            status: Some(1),
            logs: vec![log],
        }
    }

    /// Finds the block and index of a transaction hash of this chain.
    fn locate(&self, hash: B256) -> Option<(BlockNum, u64)> {
        let number = u64::from_be_bytes(hash[8..16].try_into().ok()?);
        let index = u64::from_be_bytes(hash[16..24].try_into().ok()?);
        let known = hash[0] == 2
            && self.has_block(number)
            && index < self.chain.transactions_per_block;
        known.then_some((number, index))
    }
}

fn block_hash(number: BlockNum) -> B256 {
    synthetic_hash(1, number, 0)
}

fn tx_hash(number: BlockNum, index: u64) -> B256 {
    synthetic_hash(2, number, index)
}

fn synthetic_hash(kind: u8, a: u64, b: u64) -> B256 {
    let mut bytes = [0xff; 32];
    bytes[0] = kind;
    bytes[8..16].copy_from_slice(&a.to_be_bytes());
    bytes[16..24].copy_from_slice(&b.to_be_bytes());
    B256::from(bytes)
}

impl RpcSource for MockSource {
    async fn latest_block(&self) -> Result<BlockNum, RpcError> {
        self.enter("eth_blockNumber", Target::Head).await?;
        Ok(self.chain.blocks.end.saturating_sub(1))
    }

    async fn block(&self, number: BlockNum, full: bool) -> Result<Option<RpcBlock>, RpcError> {
        let found = self.enter("eth_getBlockByNumber", Target::Block(number)).await?;
        Ok((found && self.has_block(number)).then(|| self.block_at(number, full)))
    }

    async fn block_receipts(&self, number: BlockNum) -> Result<Option<Vec<RpcReceipt>>, RpcError> {
        let found = self.enter("eth_getBlockReceipts", Target::Block(number)).await?;
        if !found || !self.has_block(number) {
            return Ok(None);
        }
        let mut receipts: Vec<_> = (0..self.chain.transactions_per_block)
            .map(|i| self.receipt_at(number, i))
            .collect();
        if self.truncate_block_receipts.load(Ordering::Relaxed) {
            receipts.pop();
        }
        Ok(Some(receipts))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<RpcTransaction>, RpcError> {
        let found = self
            .enter("eth_getTransactionByHash", Target::Transaction(hash))
            .await?;
        Ok(self
            .locate(hash)
            .filter(|_| found)
            .map(|(number, index)| self.transaction_at(number, index)))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, RpcError> {
        let found = self
            .enter("eth_getTransactionReceipt", Target::Transaction(hash))
            .await?;
        Ok(self
            .locate(hash)
            .filter(|_| found)
            .map(|(number, index)| self.receipt_at(number, index)))
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, RpcError> {
        let range = filter.from_block..=filter.to_block;
        self.enter("eth_getLogs", Target::Blocks(range.clone())).await?;
        let logs = range
            .filter(|n| self.has_block(*n))
            .flat_map(|n| (0..self.chain.transactions_per_block).map(move |i| (n, i)))
            .flat_map(|(n, i)| self.receipt_at(n, i).logs)
            .filter(|log| filter.matches(log))
            .collect();
        Ok(logs)
    }
}
