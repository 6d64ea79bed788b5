use common::Datatype;

use crate::schema::{ColumnDef, ColumnType::*, DatasetSchema};

pub static SCHEMA: DatasetSchema = DatasetSchema {
    datatype: Datatype::Logs,
    columns: COLUMNS,
    sort: &["block_number", "log_index"],
};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("block_number", UInt64),
    ColumnDef::new("block_hash", Binary).optional(),
    ColumnDef::new("transaction_index", UInt64),
    ColumnDef::new("log_index", UInt64),
    ColumnDef::new("transaction_hash", Binary),
    ColumnDef::new("address", Binary),
    ColumnDef::new("topic0", Binary).nullable(),
    ColumnDef::new("topic1", Binary).nullable(),
    ColumnDef::new("topic2", Binary).nullable(),
    ColumnDef::new("topic3", Binary).nullable(),
    ColumnDef::new("data", Binary),
];
