//! Raw dataset schemas and the row assembler.
//!
//! Every datatype has a fixed [`DatasetSchema`](schema::DatasetSchema). A collection projects
//! it once into a [`TableSchema`](projection::TableSchema) according to the column selection
//! and encoding options, and then assembles each chunk's [`RawRecord`](record::RawRecord)s
//! into an Arrow `RecordBatch` with that schema.

use std::time::Duration;

use ::arrow::datatypes::{DataType, TimeUnit};

pub mod assemble;
pub mod projection;
pub mod record;
pub mod schema;
pub mod tables;

pub use assemble::{AssembleError, SchemaMismatchError};
pub use projection::{AssembleOptions, ColumnSelection, ColumnSelectionError, TableSchema, U256Type};
pub use record::{RawRecord, Value};
pub use schema::{ColumnDef, ColumnSource, ColumnType, DatasetSchema};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub Duration);

impl Timestamp {
    pub fn from_secs(secs: u64) -> Self {
        Timestamp(Duration::from_secs(secs))
    }
}

// Nanosecond precision even though block timestamps have second precision: it is all i64 at the
// Arrow level and keeps the column compatible with more precise sources.
pub fn timestamp_type() -> DataType {
    let timezone = Some("+00:00".into());
    DataType::Timestamp(TimeUnit::Nanosecond, timezone)
}
