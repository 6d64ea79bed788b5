//! TOML collection file loading with environment variable overrides.
//!
//! Deserializes a [`ConfigFile`] from TOML using [Figment](figment::Figment), optionally
//! merging `GLACIER_CONFIG_*` environment variables on top. The raw [`ConfigFile`] is then turned
//! into a validated [`Query`] and [`CollectOpts`] by [`ConfigFile::into_collection`].
//!
//! ## Priority chain
//!
//! | Priority | Source | Mechanism |
//! |----------|--------|-----------|
//! | 1 (highest) | `GLACIER_CONFIG_*` env vars | `merge`, always wins |
//! | 2 | TOML file values | `merge`, base configuration |
//! | 3 (lowest) | serde defaults | missing keys only |
//!
//! ## Environment variables
//!
//! All env vars are prefixed with `GLACIER_CONFIG_` and use double underscores to separate
//! nested keys. For example, `GLACIER_CONFIG_FETCH__MAX_RETRIES` maps to `fetch.max_retries`.
//!
//! ## Example
//!
//! ```toml
//! datatypes = ["blocks", "logs"]
//! blocks = "18M:+10K"
//!
//! [source]
//! rpc_url = "http://localhost:8545"
//! network = "ethereum"
//!
//! [partition]
//! chunk_size = 1000
//!
//! [output]
//! output_dir = "data"
//! subdirs = ["datatype"]
//! compression = "zstd:3"
//! ```

use std::{num::NonZeroU32, path::PathBuf};

use common::{
    Address, B256, BlockSelector, Datatype, NetworkId, PartitionPolicy, RangeSelector, TxSelector,
};
use datasets_raw::{AssembleOptions, ColumnSelection, U256Type};
use dump::{CollectOpts, Compression, OutputFormat, OutputOptions, Query, Subdir};
use evm_rpc_datasets::{
    DEFAULT_INNER_REQUEST_SIZE, FetchLimits,
    limits::{
        DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_CONCURRENT_CHUNKS,
        DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_RETRIES,
    },
};
use url::Url;

use crate::ConfigError;

/// Raw collection configuration as deserialized from TOML and the environment.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub datatypes: Vec<Datatype>,
    /// Block range selector. Exactly one of `blocks` and `txs` is required.
    pub blocks: Option<BlockSelector>,
    /// Transaction hashes
    pub txs: Option<TxSelector>,
    pub label: Option<String>,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub topic0s: Vec<B256>,

    pub source: SourceConfig,
    #[serde(default)]
    pub partition: PartitionPolicy,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub columns: ColumnsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// The node to collect from.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// JSON-RPC endpoint
    pub rpc_url: Url,
    /// Network name used in output file names
    pub network: NetworkId,
}

/// Request limits, retries and fetch behavior.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Chunks fetched at the same time (default: 4)
    pub max_concurrent_chunks: usize,
    /// Requests in flight at the same time (default: 100)
    pub max_concurrent_requests: usize,
    /// Global request rate, unlimited when unset
    pub requests_per_second: Option<NonZeroU32>,
    /// Retries per request (default: 5)
    pub max_retries: usize,
    /// Delay before the first retry in milliseconds (default: 500)
    pub initial_backoff_ms: u64,
    pub exclude_failed: bool,
    /// Blocks per `eth_getLogs` request (default: 1)
    pub inner_request_size: u64,
    pub receipts_per_tx: bool,
    pub dry: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            requests_per_second: None,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            exclude_failed: false,
            inner_request_size: DEFAULT_INNER_REQUEST_SIZE,
            receipts_per_tx: false,
            dry: false,
        }
    }
}

/// Column selection and encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnsConfig {
    pub columns: Option<Vec<String>>,
    pub include_columns: Vec<String>,
    pub exclude_columns: Vec<String>,
    pub hex: bool,
    /// Defaults to `["binary", "string", "f64"]`
    pub u256_types: Option<Vec<U256Type>>,
    /// Defaults to the datatype's sort columns. An empty list disables sorting.
    pub sort: Option<Vec<String>>,
}

/// Output files and report.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Default: current directory
    pub output_dir: PathBuf,
    pub csv: bool,
    pub json: bool,
    pub subdirs: Vec<Subdir>,
    pub file_suffix: Option<String>,
    pub overwrite: bool,
    /// Default: `lz4`
    pub compression: Compression,
    pub row_group_size: Option<usize>,
    pub n_row_groups: Option<usize>,
    pub no_report: bool,
    /// Default: `{output_dir}/.glacier/reports`
    pub report_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let defaults = OutputOptions::default();
        Self {
            output_dir: defaults.output_dir,
            csv: false,
            json: false,
            subdirs: defaults.subdirs,
            file_suffix: defaults.file_suffix,
            overwrite: defaults.overwrite,
            compression: defaults.compression,
            row_group_size: defaults.row_group_size,
            n_row_groups: defaults.n_row_groups,
            no_report: defaults.no_report,
            report_dir: defaults.report_dir,
        }
    }
}

impl ConfigFile {
    /// Resolves the file into a collection and validates it.
    ///
    /// Nothing is fetched: every error returned here is a configuration error.
    pub fn into_collection(self) -> Result<(Query, CollectOpts), ConfigError> {
        let range = match (self.blocks, self.txs) {
            (Some(blocks), None) => RangeSelector::Blocks(blocks),
            (None, Some(txs)) => RangeSelector::Transactions(txs),
            (Some(_), Some(_)) => return Err(ConfigError::BothRanges),
            (None, None) => return Err(ConfigError::MissingRange),
        };

        let query = Query {
            network: self.source.network,
            datatypes: self.datatypes,
            range,
            label: self.label,
            addresses: self.addresses,
            topic0s: self.topic0s,
        };

        let fetch = self.fetch;
        let columns = self.columns;
        let output = self.output;
        let defaults = AssembleOptions::default();
        let opts = CollectOpts {
            partition: self.partition,
            limits: FetchLimits {
                max_concurrent_chunks: fetch.max_concurrent_chunks,
                max_concurrent_requests: fetch.max_concurrent_requests,
                requests_per_second: fetch.requests_per_second,
                max_retries: fetch.max_retries,
                initial_backoff_ms: fetch.initial_backoff_ms,
            },
            exclude_failed: fetch.exclude_failed,
            inner_request_size: fetch.inner_request_size,
            receipts_per_tx: fetch.receipts_per_tx,
            dry: fetch.dry,
            columns: ColumnSelection {
                columns: columns.columns,
                include_columns: columns.include_columns,
                exclude_columns: columns.exclude_columns,
            },
            assemble: AssembleOptions {
                hex: columns.hex,
                u256_types: columns.u256_types.unwrap_or(defaults.u256_types),
                sort: columns.sort,
            },
            output: OutputOptions {
                output_dir: output.output_dir,
                format: OutputFormat::from_flags(output.csv, output.json)?,
                subdirs: output.subdirs,
                file_suffix: output.file_suffix,
                overwrite: output.overwrite,
                compression: output.compression,
                row_group_size: output.row_group_size,
                n_row_groups: output.n_row_groups,
                no_report: output.no_report,
                report_dir: output.report_dir,
            },
        };

        opts.validate(&query)?;
        tracing::debug!(
            network = %query.network,
            range = %query.range,
            datatypes = ?query.datatypes,
            "loaded collection config"
        );

        Ok((query, opts))
    }
}
