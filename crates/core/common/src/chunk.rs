//! Chunks: the unit of fetching, writing and reporting.

use std::ops::Range;

use alloy::primitives::{Address, B256};

use crate::{BlockNum, datatype::Datatype, partition::PartitionDimension};

/// The part of the ordering dimension covered by a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSegment {
    /// Sorted, disjoint block intervals. Dense selections produce a single interval.
    Blocks(Vec<Range<BlockNum>>),
    /// Transaction hashes in selection order.
    Transactions(Vec<B256>),
}

impl ChunkSegment {
    pub fn n_units(&self) -> u64 {
        match self {
            ChunkSegment::Blocks(intervals) => intervals.iter().map(|r| r.end - r.start).sum(),
            ChunkSegment::Transactions(hashes) => hashes.len() as u64,
        }
    }

    /// Iterates the block numbers of a block segment in ascending order. Empty for
    /// transaction segments.
    pub fn block_numbers(&self) -> impl Iterator<Item = BlockNum> + '_ {
        let intervals: &[Range<BlockNum>] = match self {
            ChunkSegment::Blocks(intervals) => intervals,
            ChunkSegment::Transactions(_) => &[],
        };
        intervals.iter().flat_map(|r| r.clone())
    }

    /// File-name friendly label: `{first:08}_to_{last:08}` with an inclusive last block, or the
    /// leading 8 hex digits of the first and last transaction hashes.
    pub fn label(&self) -> String {
        match self {
            ChunkSegment::Blocks(intervals) => {
                let first = intervals.first().map(|r| r.start).unwrap_or_default();
                let last = intervals
                    .last()
                    .map(|r| r.end.saturating_sub(1))
                    .unwrap_or_default();
                format!("{first:0>8}_to_{last:0>8}")
            }
            ChunkSegment::Transactions(hashes) => {
                let short = |h: Option<&B256>| {
                    h.map(|h| alloy::hex::encode(&h[..4])).unwrap_or_default()
                };
                format!("{}_to_{}", short(hashes.first()), short(hashes.last()))
            }
        }
    }
}

/// One value of an auxiliary partition dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionValue {
    Address(Address),
    Topic0(B256),
}

impl PartitionValue {
    pub fn dimension(&self) -> PartitionDimension {
        match self {
            PartitionValue::Address(_) => PartitionDimension::Address,
            PartitionValue::Topic0(_) => PartitionDimension::Topic0,
        }
    }
}

impl std::fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionValue::Address(address) => {
                f.write_str(&alloy::hex::encode_prefixed(address))
            }
            PartitionValue::Topic0(topic) => f.write_str(&alloy::hex::encode_prefixed(topic)),
        }
    }
}

/// The auxiliary key of a chunk: one value per `partition_by` dimension, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(Vec<PartitionValue>);

impl PartitionKey {
    pub fn new(values: Vec<PartitionValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[PartitionValue] {
        &self.0
    }

    pub fn address(&self) -> Option<Address> {
        self.0.iter().find_map(|v| match v {
            PartitionValue::Address(address) => Some(*address),
            _ => None,
        })
    }

    pub fn topic0(&self) -> Option<B256> {
        self.0.iter().find_map(|v| match v {
            PartitionValue::Topic0(topic) => Some(*topic),
            _ => None,
        })
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("__")?;
            }
            value.fmt(f)?;
        }
        Ok(())
    }
}

/// A bounded, independently fetchable piece of a collection.
///
/// Chunks are immutable once created by the partitioner. `sequence_index` is the position in
/// the deterministic output ordering and is the only thing that numbers outputs and report
/// entries; completion order never matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub datatype: Datatype,
    pub segment: ChunkSegment,
    pub partition_key: Option<PartitionKey>,
    pub sequence_index: usize,
}

impl Chunk {
    /// Segment label, followed by the partition key when there is one.
    pub fn label(&self) -> String {
        match &self.partition_key {
            Some(key) => format!("{}__{}", self.segment.label(), key),
            None => self.segment.label(),
        }
    }

    pub fn n_units(&self) -> u64 {
        self.segment.n_units()
    }
}
