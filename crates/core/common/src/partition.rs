//! Partitioning of a resolved selection into an ordered list of chunks.
//!
//! Partitioning happens in two steps. [`resolve_range`] fixes any open bound against the chain
//! head (once per collection, so the dataset does not grow while it is being collected) and
//! applies the reorg buffer. [`split`] is then a pure function of the resolved range and the
//! [`PartitionPolicy`], so running it twice always yields the same chunks.

use std::{future::Future, ops::Range};

use alloy::primitives::{Address, B256};
use tracing::instrument;

use crate::{
    BlockNum, BoxError,
    chunk::{Chunk, ChunkSegment, PartitionKey, PartitionValue},
    datatype::Datatype,
    range::{BlockSet, RangeSelector, ResolvedRange},
};

/// Chunk size used when neither `chunk_size` nor `n_chunks` is given.
pub const DEFAULT_CHUNK_SIZE: u64 = 1000;

/// Source of the chain head used to resolve open-ended ranges.
///
/// Injected into the partitioner rather than read from global state. Tests can use a plain
/// [`BlockNum`], which resolves to itself.
pub trait LatestBlockResolver: Send + Sync {
    fn latest_block(&self) -> impl Future<Output = Result<BlockNum, BoxError>> + Send;
}

impl LatestBlockResolver for BlockNum {
    async fn latest_block(&self) -> Result<BlockNum, BoxError> {
        Ok(*self)
    }
}

impl<T: LatestBlockResolver> LatestBlockResolver for std::sync::Arc<T> {
    fn latest_block(&self) -> impl Future<Output = Result<BlockNum, BoxError>> + Send {
        self.as_ref().latest_block()
    }
}

/// An auxiliary dimension chunks can be split by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionDimension {
    Address,
    Topic0,
}

impl PartitionDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionDimension::Address => "address",
            PartitionDimension::Topic0 => "topic0",
        }
    }
}

impl std::fmt::Display for PartitionDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl std::str::FromStr for PartitionDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address" | "contract" => Ok(PartitionDimension::Address),
            "topic0" => Ok(PartitionDimension::Topic0),
            other => Err(format!("invalid partition dimension: '{other}'")),
        }
    }
}

impl serde::Serialize for PartitionDimension {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for PartitionDimension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Order in which `sequence_index` is assigned to the chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkOrder {
    #[default]
    Ascending,
    Descending,
}

/// How a range is cut into chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PartitionPolicy {
    /// Units per chunk. Mutually exclusive with `n_chunks`.
    pub chunk_size: Option<u64>,
    /// Exact number of chunks. Mutually exclusive with `chunk_size`.
    pub n_chunks: Option<u64>,
    /// Snap chunk boundaries to multiples of the chunk size.
    pub align: bool,
    /// Units below the chain head to leave out.
    pub reorg_buffer: u64,
    pub partition_by: Vec<PartitionDimension>,
    #[serde(rename = "chunk_order")]
    pub order: ChunkOrder,
}

impl PartitionPolicy {
    /// Checks the policy against the selection it will be applied to.
    ///
    /// Runs before anything is resolved or fetched.
    pub fn validate(
        &self,
        selector: &RangeSelector,
        keys: &PartitionKeys,
    ) -> Result<(), PartitionPolicyError> {
        match (self.chunk_size, self.n_chunks) {
            (Some(chunk_size), Some(n_chunks)) => {
                return Err(PartitionPolicyError::ChunkSizeAndNChunks {
                    chunk_size,
                    n_chunks,
                });
            }
            (Some(0), None) => return Err(PartitionPolicyError::ZeroChunkSize),
            (None, Some(0)) => return Err(PartitionPolicyError::ZeroNChunks),
            (None, Some(_)) if self.align => return Err(PartitionPolicyError::AlignWithNChunks),
            _ => {}
        }
        if self.align && selector.is_transactions() {
            return Err(PartitionPolicyError::AlignWithTransactions);
        }
        for (i, dimension) in self.partition_by.iter().enumerate() {
            if self.partition_by[..i].contains(dimension) {
                return Err(PartitionPolicyError::DuplicateDimension(*dimension));
            }
            if keys.values(*dimension).is_empty() {
                return Err(PartitionPolicyError::MissingPartitionValues(*dimension));
            }
        }
        Ok(())
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }
}

/// Values of the auxiliary partition dimensions, taken from the query's filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionKeys {
    pub addresses: Vec<Address>,
    pub topic0s: Vec<B256>,
}

impl PartitionKeys {
    pub fn values(&self, dimension: PartitionDimension) -> Vec<PartitionValue> {
        match dimension {
            PartitionDimension::Address => self
                .addresses
                .iter()
                .copied()
                .map(PartitionValue::Address)
                .collect(),
            PartitionDimension::Topic0 => self
                .topic0s
                .iter()
                .copied()
                .map(PartitionValue::Topic0)
                .collect(),
        }
    }
}

/// Splits selections into chunks, resolving open bounds through `R`.
pub struct Partitioner<R> {
    resolver: R,
}

impl<R: LatestBlockResolver> Partitioner<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Validates, resolves and splits in one call.
    ///
    /// The returned chunks are ordered by `sequence_index`.
    #[instrument(skip_all, fields(%datatype), err)]
    pub async fn partition(
        &self,
        selector: &RangeSelector,
        policy: &PartitionPolicy,
        datatype: Datatype,
        keys: &PartitionKeys,
    ) -> Result<Vec<Chunk>, PartitionError> {
        policy.validate(selector, keys)?;
        let resolved = resolve_range(selector, policy.reorg_buffer, &self.resolver).await?;
        Ok(split(&resolved, policy, datatype, keys))
    }
}

/// Fixes the open bounds of `selector` against the chain head and applies the reorg buffer.
///
/// The head is read at most once, and only when the selector references it or a reorg buffer
/// is set. A selection left empty by the buffer is not an error.
pub async fn resolve_range(
    selector: &RangeSelector,
    reorg_buffer: u64,
    resolver: &impl LatestBlockResolver,
) -> Result<ResolvedRange, RangeResolutionError> {
    let selector = match selector {
        RangeSelector::Transactions(txs) => {
            return Ok(ResolvedRange::Transactions(txs.hashes().to_vec()));
        }
        RangeSelector::Blocks(selector) => selector,
    };

    if !selector.needs_latest() && reorg_buffer == 0 {
        return Ok(ResolvedRange::Blocks(selector.resolve(0)));
    }

    let latest = resolver
        .latest_block()
        .await
        .map_err(RangeResolutionError::FetchLatestFailed)?;
    let mut set = selector.resolve(latest);

    if reorg_buffer > 0 {
        let cap = latest.saturating_add(1).saturating_sub(reorg_buffer);
        let requested = set.n_units();
        set = set.truncate(cap);
        if requested > 0 && set.is_empty() {
            tracing::warn!(
                latest,
                reorg_buffer,
                "selected range is entirely within the reorg buffer, nothing to collect"
            );
        }
    }

    Ok(ResolvedRange::Blocks(set))
}

/// Splits a resolved range into chunks for one datatype.
///
/// Assumes `policy` passed [`PartitionPolicy::validate`]. Each segment is expanded into one
/// chunk per partition key (Cartesian product over the dimensions the datatype supports), and
/// `sequence_index` is assigned by segment first and key second.
pub fn split(
    resolved: &ResolvedRange,
    policy: &PartitionPolicy,
    datatype: Datatype,
    keys: &PartitionKeys,
) -> Vec<Chunk> {
    let segments: Vec<ChunkSegment> = match resolved {
        ResolvedRange::Blocks(set) => split_blocks(set, policy)
            .into_iter()
            .map(ChunkSegment::Blocks)
            .collect(),
        ResolvedRange::Transactions(hashes) => split_counts(hashes.len() as u64, policy)
            .into_iter()
            .map(|r| ChunkSegment::Transactions(hashes[r.start as usize..r.end as usize].to_vec()))
            .collect(),
    };

    let partition_keys = partition_keys(policy, datatype, keys);
    let total = segments.len() * partition_keys.len();

    let mut chunks = Vec::with_capacity(total);
    for (segment_index, segment) in segments.into_iter().enumerate() {
        for (key_index, partition_key) in partition_keys.iter().enumerate() {
            let position = segment_index * partition_keys.len() + key_index;
            let sequence_index = match policy.order {
                ChunkOrder::Ascending => position,
                ChunkOrder::Descending => total - 1 - position,
            };
            chunks.push(Chunk {
                datatype,
                segment: segment.clone(),
                partition_key: partition_key.clone(),
                sequence_index,
            });
        }
    }
    chunks.sort_by_key(|chunk| chunk.sequence_index);
    chunks
}

fn partition_keys(
    policy: &PartitionPolicy,
    datatype: Datatype,
    keys: &PartitionKeys,
) -> Vec<Option<PartitionKey>> {
    let dimensions: Vec<_> = policy
        .partition_by
        .iter()
        .copied()
        .filter(|d| datatype.supports_dimension(*d))
        .collect();
    if dimensions.is_empty() {
        return vec![None];
    }

    let mut combinations: Vec<Vec<PartitionValue>> = vec![vec![]];
    for dimension in dimensions {
        let values = keys.values(dimension);
        combinations = combinations
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |value| {
                    let mut combination = prefix.clone();
                    combination.push(*value);
                    combination
                })
            })
            .collect();
    }
    combinations
        .into_iter()
        .map(|values| Some(PartitionKey::new(values)))
        .collect()
}

fn split_blocks(set: &BlockSet, policy: &PartitionPolicy) -> Vec<Vec<Range<BlockNum>>> {
    if policy.align && policy.n_chunks.is_none() {
        return split_aligned(set.intervals(), policy.chunk_size());
    }

    let offsets = split_counts(set.n_units(), policy);
    let mut intervals = set.intervals().iter().cloned();
    let mut current = intervals.next();
    let mut segments = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let mut remaining = offset.end - offset.start;
        let mut segment = Vec::new();
        while remaining > 0 {
            let Some(interval) = current.as_mut() else {
                break;
            };
            let take = remaining.min(interval.end - interval.start);
            segment.push(interval.start..interval.start + take);
            interval.start += take;
            remaining -= take;
            if interval.start == interval.end {
                current = intervals.next();
            }
        }
        segments.push(segment);
    }
    segments
}

/// Cuts every interval at multiples of `chunk_size` and groups the pieces by multiple.
fn split_aligned(intervals: &[Range<BlockNum>], chunk_size: u64) -> Vec<Vec<Range<BlockNum>>> {
    let mut buckets: Vec<(u64, Vec<Range<BlockNum>>)> = Vec::new();
    for interval in intervals {
        let mut start = interval.start;
        while start < interval.end {
            let bucket = start / chunk_size;
            let end = interval
                .end
                .min((bucket + 1).saturating_mul(chunk_size));
            match buckets.last_mut() {
                Some((last, pieces)) if *last == bucket => pieces.push(start..end),
                _ => buckets.push((bucket, vec![start..end])),
            }
            start = end;
        }
    }
    buckets.into_iter().map(|(_, pieces)| pieces).collect()
}

/// Unit offsets `[start, end)` of each chunk over `n_units` units, ignoring alignment.
///
/// With `n_chunks`, sizes differ by at most one and earlier chunks are the larger ones.
fn split_counts(n_units: u64, policy: &PartitionPolicy) -> Vec<Range<u64>> {
    if n_units == 0 {
        return vec![];
    }
    match policy.n_chunks {
        Some(n_chunks) => {
            let n_chunks = n_chunks.min(n_units);
            let base = n_units / n_chunks;
            let remainder = n_units % n_chunks;
            let mut start = 0;
            (0..n_chunks)
                .map(|i| {
                    let len = base + u64::from(i < remainder);
                    let range = start..start + len;
                    start += len;
                    range
                })
                .collect()
        }
        None => {
            let chunk_size = policy.chunk_size();
            (0..n_units.div_ceil(chunk_size))
                .map(|i| i * chunk_size..((i + 1) * chunk_size).min(n_units))
                .collect()
        }
    }
}

/// Errors in the partition policy, detected before anything is fetched.
#[derive(Debug, thiserror::Error)]
pub enum PartitionPolicyError {
    /// Both `chunk_size` and `n_chunks` were given
    ///
    /// The two options are alternative ways of sizing chunks; exactly one (or neither, for the
    /// default chunk size) may be set.
    #[error("chunk_size ({chunk_size}) and n_chunks ({n_chunks}) are mutually exclusive")]
    ChunkSizeAndNChunks { chunk_size: u64, n_chunks: u64 },

    /// `chunk_size` is zero
    #[error("chunk_size must be positive")]
    ZeroChunkSize,

    /// `n_chunks` is zero
    #[error("n_chunks must be positive")]
    ZeroNChunks,

    /// `align` was combined with `n_chunks`
    ///
    /// Alignment snaps boundaries to multiples of the chunk size, which is undefined when the
    /// number of chunks is fixed instead.
    #[error("align requires chunk_size, it cannot be combined with n_chunks")]
    AlignWithNChunks,

    /// `align` was requested over transaction hashes
    ///
    /// Transaction hashes have no numeric order to align to.
    #[error("align is only supported for block ranges")]
    AlignWithTransactions,

    /// A dimension appears more than once in `partition_by`
    #[error("partition dimension '{0}' is listed more than once")]
    DuplicateDimension(PartitionDimension),

    /// `partition_by` names a dimension the query supplies no values for
    ///
    /// For example partitioning by `address` without any `addresses` in the query.
    #[error("partition_by '{0}' requires at least one value in the query")]
    MissingPartitionValues(PartitionDimension),
}

/// Errors that occur when resolving an open-ended range.
#[derive(Debug, thiserror::Error)]
pub enum RangeResolutionError {
    /// Failed to fetch the latest block number
    ///
    /// The chain head is needed for open ranges (`start:`, `latest`) and for the reorg
    /// buffer. This usually means the remote source is unreachable.
    #[error("failed to fetch latest block")]
    FetchLatestFailed(#[source] BoxError),
}

/// Errors returned by [`Partitioner::partition`].
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(transparent)]
    Config(#[from] PartitionPolicyError),

    #[error(transparent)]
    Resolution(#[from] RangeResolutionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{BlockSelector, TxSelector};

    fn blocks(selector: &str) -> RangeSelector {
        RangeSelector::Blocks(selector.parse::<BlockSelector>().expect("valid selector"))
    }

    fn policy(chunk_size: Option<u64>, n_chunks: Option<u64>, align: bool) -> PartitionPolicy {
        PartitionPolicy {
            chunk_size,
            n_chunks,
            align,
            ..Default::default()
        }
    }

    fn segments(chunks: &[Chunk]) -> Vec<Vec<Range<BlockNum>>> {
        chunks
            .iter()
            .map(|c| match &c.segment {
                ChunkSegment::Blocks(intervals) => intervals.clone(),
                ChunkSegment::Transactions(_) => panic!("expected block segment"),
            })
            .collect()
    }

    async fn partition(
        selector: &str,
        policy: &PartitionPolicy,
        latest: BlockNum,
    ) -> Result<Vec<Chunk>, PartitionError> {
        Partitioner::new(latest)
            .partition(
                &blocks(selector),
                policy,
                Datatype::Blocks,
                &PartitionKeys::default(),
            )
            .await
    }

    #[tokio::test]
    async fn partition_unaligned_range_into_fixed_size_chunks() {
        //* Given
        let policy = policy(Some(100), None, false);

        //* When
        let chunks = partition("1000:1500", &policy, 0)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(
            segments(&chunks),
            vec![
                vec![1000..1100],
                vec![1100..1200],
                vec![1200..1300],
                vec![1300..1400],
                vec![1400..1500],
            ]
        );
        let indices: Vec<_> = chunks.iter().map(|c| c.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn partition_aligned_range_snaps_to_multiples() {
        //* Given
        let policy = policy(Some(300), None, true);

        //* When
        let chunks = partition("0:1000", &policy, 0)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(
            segments(&chunks),
            vec![vec![0..300], vec![300..600], vec![600..900], vec![900..1000]]
        );
    }

    #[tokio::test]
    async fn partition_aligned_range_shortens_first_and_last_chunks() {
        //* Given
        let policy = policy(Some(100), None, true);

        //* When
        let chunks = partition("150:420", &policy, 0)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(
            segments(&chunks),
            vec![vec![150..200], vec![200..300], vec![300..400], vec![400..420]]
        );
    }

    #[tokio::test]
    async fn partition_with_chunk_size_and_n_chunks_fails() {
        //* Given
        let policy = policy(Some(1000), Some(5), false);

        //* When
        let result = partition("0:10000", &policy, 0).await;

        //* Then
        assert!(matches!(
            result,
            Err(PartitionError::Config(
                PartitionPolicyError::ChunkSizeAndNChunks {
                    chunk_size: 1000,
                    n_chunks: 5
                }
            ))
        ));
    }

    #[tokio::test]
    async fn partition_with_invalid_policies_fails() {
        for policy in [
            policy(Some(0), None, false),
            policy(None, Some(0), false),
            policy(None, Some(4), true),
        ] {
            let result = partition("0:100", &policy, 0).await;
            assert!(
                matches!(result, Err(PartitionError::Config(_))),
                "{policy:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn partition_n_chunks_gives_earlier_chunks_the_remainder() {
        //* Given
        let policy = policy(None, Some(3), false);

        //* When
        let chunks = partition("0:10", &policy, 0)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(segments(&chunks), vec![vec![0..4], vec![4..7], vec![7..10]]);
    }

    #[tokio::test]
    async fn partition_n_chunks_larger_than_range_yields_one_chunk_per_unit() {
        //* Given
        let policy = policy(None, Some(10), false);

        //* When
        let chunks = partition("0:3", &policy, 0)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(segments(&chunks), vec![vec![0..1], vec![1..2], vec![2..3]]);
    }

    #[tokio::test]
    async fn partition_zero_length_range_yields_no_chunks() {
        let chunks = partition("100:100", &PartitionPolicy::default(), 0)
            .await
            .expect("Failed to partition range");
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn partition_applies_reorg_buffer_to_resolved_head() {
        //* Given
        let policy = PartitionPolicy {
            chunk_size: Some(100),
            reorg_buffer: 50,
            ..Default::default()
        };

        //* When
        let chunks = partition("0:", &policy, 299)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(segments(&chunks), vec![vec![0..100], vec![100..200], vec![200..250]]);
    }

    #[tokio::test]
    async fn partition_range_inside_reorg_buffer_yields_no_chunks() {
        //* Given
        let policy = PartitionPolicy {
            reorg_buffer: 100,
            ..Default::default()
        };

        //* When
        let chunks = partition("950:1000", &policy, 1000)
            .await
            .expect("Failed to partition range");

        //* Then
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn partition_reports_unreachable_head() {
        //* Given
        struct Unreachable;
        impl LatestBlockResolver for Unreachable {
            async fn latest_block(&self) -> Result<BlockNum, BoxError> {
                Err("connection refused".into())
            }
        }

        //* When
        let result = Partitioner::new(Unreachable)
            .partition(
                &blocks("0:"),
                &PartitionPolicy::default(),
                Datatype::Blocks,
                &PartitionKeys::default(),
            )
            .await;

        //* Then
        assert!(matches!(
            result,
            Err(PartitionError::Resolution(
                RangeResolutionError::FetchLatestFailed(_)
            ))
        ));
    }

    #[tokio::test]
    async fn partition_is_deterministic_and_covers_the_resolved_range() {
        //* Params
        let selectors = ["0:1000", "17:1234", "0:5000:7 9000:9100", "0:100/13", "5:"];
        let policies = [
            policy(Some(100), None, false),
            policy(Some(64), None, true),
            policy(None, Some(7), false),
            PartitionPolicy {
                chunk_size: Some(33),
                reorg_buffer: 10,
                order: ChunkOrder::Descending,
                ..Default::default()
            },
        ];
        let latest = 2_000;

        //* Test
        for selector in selectors {
            for policy in &policies {
                let first = partition(selector, policy, latest)
                    .await
                    .expect("Failed to partition range");
                let second = partition(selector, policy, latest)
                    .await
                    .expect("Failed to partition range");
                assert_eq!(first, second, "{selector} / {policy:?} not deterministic");

                let ResolvedRange::Blocks(expected) =
                    resolve_range(&blocks(selector), policy.reorg_buffer, &latest)
                        .await
                        .expect("Failed to resolve range")
                else {
                    panic!("expected block range");
                };
                let covered = BlockSet::from_intervals(
                    first
                        .iter()
                        .flat_map(|c| c.segment.block_numbers().map(|n| n..n + 1)),
                );
                let total: u64 = first.iter().map(Chunk::n_units).sum();
                assert_eq!(covered, expected, "{selector} / {policy:?} coverage");
                assert_eq!(total, expected.n_units(), "{selector} / {policy:?} overlap");
            }
        }
    }

    #[tokio::test]
    async fn partition_by_expands_segments_into_keyed_chunks() {
        //* Given
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        let keys = PartitionKeys {
            addresses: vec![a, b],
            topic0s: vec![],
        };
        let policy = PartitionPolicy {
            chunk_size: Some(10),
            partition_by: vec![PartitionDimension::Address],
            ..Default::default()
        };

        //* When
        let chunks = Partitioner::new(0)
            .partition(&blocks("0:20"), &policy, Datatype::Logs, &keys)
            .await
            .expect("Failed to partition range");

        //* Then
        let layout: Vec<_> = chunks
            .iter()
            .map(|c| {
                (
                    c.sequence_index,
                    c.segment.clone(),
                    c.partition_key.as_ref().and_then(PartitionKey::address),
                )
            })
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, ChunkSegment::Blocks(vec![0..10]), Some(a)),
                (1, ChunkSegment::Blocks(vec![0..10]), Some(b)),
                (2, ChunkSegment::Blocks(vec![10..20]), Some(a)),
                (3, ChunkSegment::Blocks(vec![10..20]), Some(b)),
            ]
        );
    }

    #[tokio::test]
    async fn partition_by_is_ignored_for_datatypes_without_the_dimension() {
        //* Given
        let keys = PartitionKeys {
            addresses: vec![Address::repeat_byte(0xaa), Address::repeat_byte(0xbb)],
            topic0s: vec![],
        };
        let policy = PartitionPolicy {
            chunk_size: Some(10),
            partition_by: vec![PartitionDimension::Address],
            ..Default::default()
        };

        //* When
        let chunks = Partitioner::new(0)
            .partition(&blocks("0:20"), &policy, Datatype::Blocks, &keys)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.partition_key.is_none()));
    }

    #[tokio::test]
    async fn partition_by_without_values_fails() {
        //* Given
        let policy = PartitionPolicy {
            partition_by: vec![PartitionDimension::Topic0],
            ..Default::default()
        };

        //* When
        let result = Partitioner::new(0)
            .partition(
                &blocks("0:20"),
                &policy,
                Datatype::Logs,
                &PartitionKeys::default(),
            )
            .await;

        //* Then
        assert!(matches!(
            result,
            Err(PartitionError::Config(
                PartitionPolicyError::MissingPartitionValues(PartitionDimension::Topic0)
            ))
        ));
    }

    #[tokio::test]
    async fn descending_order_reverses_sequence_indices() {
        //* Given
        let policy = PartitionPolicy {
            chunk_size: Some(100),
            order: ChunkOrder::Descending,
            ..Default::default()
        };

        //* When
        let chunks = partition("0:300", &policy, 0)
            .await
            .expect("Failed to partition range");

        //* Then
        assert_eq!(segments(&chunks), vec![vec![200..300], vec![100..200], vec![0..100]]);
        let indices: Vec<_> = chunks.iter().map(|c| c.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn partition_transactions_by_count() {
        //* Given
        let hashes: Vec<B256> = (1..=5u8).map(B256::repeat_byte).collect();
        let selector = RangeSelector::Transactions(
            TxSelector::new(hashes.clone()).expect("Failed to build selector"),
        );
        let policy = policy(Some(2), None, false);

        //* When
        let chunks = Partitioner::new(0)
            .partition(
                &selector,
                &policy,
                Datatype::Transactions,
                &PartitionKeys::default(),
            )
            .await
            .expect("Failed to partition transactions");

        //* Then
        let segments: Vec<_> = chunks.into_iter().map(|c| c.segment).collect();
        assert_eq!(
            segments,
            vec![
                ChunkSegment::Transactions(hashes[0..2].to_vec()),
                ChunkSegment::Transactions(hashes[2..4].to_vec()),
                ChunkSegment::Transactions(hashes[4..5].to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn align_over_transactions_fails() {
        //* Given
        let selector = RangeSelector::Transactions(
            TxSelector::new([B256::repeat_byte(1)]).expect("Failed to build selector"),
        );

        //* When
        let result = Partitioner::new(0)
            .partition(
                &selector,
                &policy(Some(10), None, true),
                Datatype::Transactions,
                &PartitionKeys::default(),
            )
            .await;

        //* Then
        assert!(matches!(
            result,
            Err(PartitionError::Config(
                PartitionPolicyError::AlignWithTransactions
            ))
        ));
    }
}
