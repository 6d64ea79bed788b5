//! # Dump
//!
//! Collection of raw datasets into chunk files: the [`Collector`] partitions the requested
//! range, fetches every chunk through the `evm-rpc-datasets` fetcher, writes each chunk to its
//! own file with the [`DatasetWriter`] and summarizes the run in a [`CollectionReport`].

pub mod collection;
pub mod coordinator;
pub mod error;
pub mod progress;
pub mod report;
mod tasks;
pub mod writer;

pub use collection::{CollectOpts, Query};
pub use coordinator::{Collector, InMemoryCollection};
pub use error::{CollectError, ConfigError, WriteError};
pub use progress::{
    ChunkProgress, ChunkStatus, NoOpProgressCallback, Phase, ProgressCallback,
    ProgressCallbackExt, ProgressUpdate,
};
pub use report::{ChunkError, CollectionReport, DatatypeReport, ExcludedUnits};
pub use writer::{Accumulator, Compression, DatasetWriter, OutputFormat, OutputOptions, Subdir};
