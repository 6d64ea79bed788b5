//! What to collect and how.

use std::sync::Arc;

use common::{Address, B256, Datatype, NetworkId, PartitionKeys, PartitionPolicy, RangeSelector};
use datasets_raw::{AssembleOptions, ColumnSelection, TableSchema};
use evm_rpc_datasets::{DEFAULT_INNER_REQUEST_SIZE, FetchLimits, FetchOptions};

use crate::{error::ConfigError, writer::OutputOptions};

/// The data a collection produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub network: NetworkId,
    pub datatypes: Vec<Datatype>,
    pub range: RangeSelector,
    /// Optional extra field of the output file names
    pub label: Option<String>,
    /// Log address filter. Also the values of the `address` partition dimension.
    pub addresses: Vec<Address>,
    /// Log topic0 filter. Also the values of the `topic0` partition dimension.
    pub topic0s: Vec<B256>,
}

impl Query {
    pub fn new(network: NetworkId, datatypes: Vec<Datatype>, range: RangeSelector) -> Self {
        Self {
            network,
            datatypes,
            range,
            label: None,
            addresses: Vec::new(),
            topic0s: Vec::new(),
        }
    }

    pub fn partition_keys(&self) -> PartitionKeys {
        PartitionKeys {
            addresses: self.addresses.clone(),
            topic0s: self.topic0s.clone(),
        }
    }
}

/// Options of a collection. None of them change which rows exist, only how they are cut,
/// fetched, encoded and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOpts {
    pub partition: PartitionPolicy,
    pub limits: FetchLimits,
    /// Drop individually failing units instead of failing their chunk
    pub exclude_failed: bool,
    /// Blocks per `eth_getLogs` request
    pub inner_request_size: u64,
    /// Fetch transaction receipts one by one instead of per block
    pub receipts_per_tx: bool,
    /// Partition and plan requests without fetching anything
    pub dry: bool,
    pub columns: ColumnSelection,
    pub assemble: AssembleOptions,
    pub output: OutputOptions,
}

impl Default for CollectOpts {
    fn default() -> Self {
        Self {
            partition: PartitionPolicy::default(),
            limits: FetchLimits::default(),
            exclude_failed: false,
            inner_request_size: DEFAULT_INNER_REQUEST_SIZE,
            receipts_per_tx: false,
            dry: false,
            columns: ColumnSelection::default(),
            assemble: AssembleOptions::default(),
            output: OutputOptions::default(),
        }
    }
}

impl CollectOpts {
    /// Checks the options against the query and projects one table per requested datatype.
    ///
    /// Everything that can be wrong without looking at the chain is reported here, before any
    /// remote request.
    pub fn validate(&self, query: &Query) -> Result<Vec<Arc<TableSchema>>, ConfigError> {
        if query.datatypes.is_empty() {
            return Err(ConfigError::NoDatatypes);
        }
        for (i, datatype) in query.datatypes.iter().enumerate() {
            if query.datatypes[..i].contains(datatype) {
                return Err(ConfigError::DuplicateDatatype(*datatype));
            }
            if query.range.is_transactions() && !datatype.supports_transaction_domain() {
                return Err(ConfigError::TransactionDomainUnsupported(*datatype));
            }
        }

        self.partition.validate(&query.range, &query.partition_keys())?;
        self.limits.validate()?;
        if self.inner_request_size == 0 {
            return Err(ConfigError::ZeroInnerRequestSize);
        }
        self.output.validate()?;

        let assemble = self.assemble_options();
        query
            .datatypes
            .iter()
            .map(|datatype| {
                TableSchema::new(*datatype, &self.columns, &assemble)
                    .map(Arc::new)
                    .map_err(ConfigError::from)
            })
            .collect()
    }

    /// Assembly options with hex forced for the text formats.
    pub fn assemble_options(&self) -> AssembleOptions {
        let mut options = self.assemble.clone();
        options.hex |= self.output.format.requires_hex();
        options
    }

    pub(crate) fn fetch_options(&self, query: &Query) -> FetchOptions {
        FetchOptions {
            exclude_failed: self.exclude_failed,
            inner_request_size: self.inner_request_size,
            receipts_per_tx: self.receipts_per_tx,
            addresses: query.addresses.clone(),
            topic0s: query.topic0s.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{PartitionDimension, PartitionPolicyError};

    use super::*;
    use crate::writer::OutputFormat;

    fn query(datatypes: Vec<Datatype>, range: &str) -> Query {
        let range = if range.starts_with("0x") {
            RangeSelector::Transactions(range.parse().expect("Failed to parse tx selector"))
        } else {
            RangeSelector::Blocks(range.parse().expect("Failed to parse block selector"))
        };
        Query::new(
            "ethereum".parse().expect("Failed to parse network"),
            datatypes,
            range,
        )
    }

    #[test]
    fn chunk_size_and_n_chunks_are_rejected() {
        //* Given
        let query = query(vec![Datatype::Blocks], "1000:1500");
        let mut opts = CollectOpts::default();
        opts.partition.chunk_size = Some(1000);
        opts.partition.n_chunks = Some(5);

        //* When
        let result = opts.validate(&query);

        //* Then
        assert!(matches!(
            result,
            Err(ConfigError::Policy(PartitionPolicyError::ChunkSizeAndNChunks { .. }))
        ));
    }

    #[test]
    fn blocks_cannot_be_collected_over_transactions() {
        //* Given
        let hash = format!("0x{}", "11".repeat(32));
        let query = query(vec![Datatype::Transactions, Datatype::Blocks], &hash);

        //* When
        let result = CollectOpts::default().validate(&query);

        //* Then
        assert!(matches!(
            result,
            Err(ConfigError::TransactionDomainUnsupported(Datatype::Blocks))
        ));
    }

    #[test]
    fn partition_dimension_needs_query_values() {
        //* Given
        let query = query(vec![Datatype::Logs], "0:100");
        let mut opts = CollectOpts::default();
        opts.partition.partition_by = vec![PartitionDimension::Address];

        //* When
        let result = opts.validate(&query);

        //* Then
        assert!(matches!(
            result,
            Err(ConfigError::Policy(
                PartitionPolicyError::MissingPartitionValues(PartitionDimension::Address)
            ))
        ));
    }

    #[test]
    fn text_formats_force_hex() {
        //* Given
        let query = query(vec![Datatype::Blocks], "0:10");
        let mut opts = CollectOpts::default();
        opts.output.format = OutputFormat::Csv;

        //* When
        let tables = opts.validate(&query).expect("Failed to validate options");

        //* Then
        assert!(opts.assemble_options().hex);
        let schema = tables[0].schema();
        let hash = schema
            .field_with_name("block_hash")
            .expect("block_hash is a default column");
        assert_eq!(hash.data_type(), &arrow::datatypes::DataType::Utf8);
    }

    #[test]
    fn duplicate_datatypes_are_rejected() {
        //* Given
        let query = query(vec![Datatype::Logs, Datatype::Logs], "0:10");

        //* When
        let result = CollectOpts::default().validate(&query);

        //* Then
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateDatatype(Datatype::Logs))
        ));
    }
}
