//! Fatal collection errors.
//!
//! Per-chunk failures never show up here: they are recorded in the
//! [`CollectionReport`](crate::report::CollectionReport) and the collection carries on.

use std::path::PathBuf;

use common::{Datatype, PartitionPolicyError, RangeResolutionError};
use datasets_raw::ColumnSelectionError;
use evm_rpc_datasets::InvalidLimitsError;
use tokio::task::JoinError;

/// Errors that stop a collection.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The query or options are invalid
    ///
    /// Always detected before the first remote request.
    #[error("invalid collection config")]
    Config(#[from] ConfigError),

    /// An open range bound could not be resolved against the chain head
    ///
    /// This happens when the node stays unreachable through every retry of the head lookup.
    /// Nothing has been fetched or written at that point.
    #[error("failed to resolve the collection range")]
    RangeResolution(#[from] RangeResolutionError),

    /// A chunk file could not be written
    ///
    /// Writing failures stop the whole collection: the remaining chunks are cancelled and the
    /// incomplete report is left in place. Files already renamed into place are complete.
    #[error("failed to write collection output")]
    Write(#[from] WriteError),

    /// A chunk task panicked
    ///
    /// Indicates a bug. The remaining chunk tasks are aborted.
    #[error("chunk task panicked")]
    Task(#[source] JoinError),
}

/// Invalid or contradictory options.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No datatype was requested
    #[error("at least one datatype is required")]
    NoDatatypes,

    /// The same datatype was requested twice
    ///
    /// Both requests would map to the same output paths.
    #[error("datatype {0} is requested more than once")]
    DuplicateDatatype(Datatype),

    /// A datatype cannot be collected over transaction hashes
    #[error("datatype {0} does not support transaction ranges")]
    TransactionDomainUnsupported(Datatype),

    /// More than one output format flag was set
    #[error("only one of csv and json can be set")]
    MultipleFormats,

    /// Both `row_group_size` and `n_row_groups` were given
    #[error("row_group_size ({row_group_size}) and n_row_groups ({n_row_groups}) are mutually exclusive")]
    RowGroupSizeAndCount {
        row_group_size: usize,
        n_row_groups: usize,
    },

    /// `row_group_size` or `n_row_groups` is zero
    #[error("row_group_size and n_row_groups must be positive")]
    ZeroRowGroups,

    /// `inner_request_size` is zero
    #[error("inner_request_size must be positive")]
    ZeroInnerRequestSize,

    /// An invalid compression string
    #[error("invalid compression: {0}")]
    Compression(String),

    /// An invalid `subdirs` entry
    #[error("invalid subdir '{0}': must be a single, non-empty path component")]
    Subdir(String),

    /// Two chunks map to the same output file
    ///
    /// Usually caused by collecting several datatypes into the same directory with a
    /// `file_suffix` or `subdirs` setup that removes the datatype from the path.
    #[error("duplicate output path: {}", .0.display())]
    DuplicateOutputPath(PathBuf),

    /// In-memory collection of more than one datatype
    #[error("in-memory collection takes exactly one datatype, got {0}")]
    InMemoryDatatypes(usize),

    #[error(transparent)]
    Policy(#[from] PartitionPolicyError),

    #[error(transparent)]
    Limits(#[from] InvalidLimitsError),

    #[error(transparent)]
    Columns(#[from] ColumnSelectionError),
}

/// Filesystem failures while writing chunk files or reports.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Creating the output or report directory failed
    #[error("failed to create directory")]
    CreateDir(#[source] std::io::Error),

    /// Creating, renaming or removing a file failed
    ///
    /// The error message names the path.
    #[error("file operation failed")]
    Io(#[source] std::io::Error),

    /// The parquet encoder failed
    #[error("failed to encode parquet file {}", path.display())]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    /// The CSV or JSON encoder failed
    #[error("failed to encode file {}", path.display())]
    Arrow {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },

    /// The chunk tables of an in-memory collection could not be concatenated
    ///
    /// All chunks are assembled with the same table schema, so this indicates a bug.
    #[error("failed to combine chunk tables")]
    Combine(#[source] arrow::error::ArrowError),

    /// The report could not be serialized
    #[error("failed to serialize report")]
    Report(#[source] serde_json::Error),

    /// The blocking write task did not complete
    #[error("write task failed")]
    Task(#[source] JoinError),
}
