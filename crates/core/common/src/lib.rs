//! Shared types for chunked collection: the ordering dimension, chunks and the partitioner.

pub mod chunk;
pub mod datatype;
pub mod network_id;
pub mod partition;
pub mod range;

pub use alloy::primitives::{Address, B256};
pub use chunk::{Chunk, ChunkSegment, PartitionKey, PartitionValue};
pub use datatype::Datatype;
pub use network_id::NetworkId;
pub use partition::{
    ChunkOrder, LatestBlockResolver, PartitionDimension, PartitionError, PartitionKeys,
    PartitionPolicy, PartitionPolicyError, Partitioner, RangeResolutionError,
};
pub use range::{BlockSelector, BlockSet, RangeSelector, ResolvedRange, TxSelector};

/// Type alias for block numbers used throughout the collection pipeline.
pub type BlockNum = u64;

pub type BoxError = Box<dyn std::error::Error + Sync + Send + 'static>;
pub type BoxResult<T> = Result<T, BoxError>;
