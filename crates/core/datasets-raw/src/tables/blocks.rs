use common::Datatype;

use crate::schema::{ColumnDef, ColumnType::*, DatasetSchema};

pub static SCHEMA: DatasetSchema = DatasetSchema {
    datatype: Datatype::Blocks,
    columns: COLUMNS,
    sort: &["block_number"],
};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("block_hash", Binary),
    ColumnDef::new("parent_hash", Binary),
    ColumnDef::new("author", Binary),
    ColumnDef::new("state_root", Binary).optional(),
    ColumnDef::new("transactions_root", Binary).optional(),
    ColumnDef::new("receipts_root", Binary).optional(),
    ColumnDef::new("block_number", UInt64),
    ColumnDef::new("gas_used", UInt64),
    ColumnDef::new("gas_limit", UInt64),
    ColumnDef::new("extra_data", Binary),
    ColumnDef::new("logs_bloom", Binary).optional(),
    ColumnDef::new("timestamp", Timestamp),
    ColumnDef::new("difficulty", UInt256).optional(),
    ColumnDef::new("total_difficulty", UInt256).nullable().optional(),
    ColumnDef::new("size", UInt64).nullable(),
    ColumnDef::new("base_fee_per_gas", UInt64).nullable(),
    ColumnDef::new("transaction_count", UInt32).optional(),
];
