use common::Datatype;

use crate::schema::{ColumnDef, ColumnType::*, DatasetSchema};

pub static SCHEMA: DatasetSchema = DatasetSchema {
    datatype: Datatype::Transactions,
    columns: COLUMNS,
    sort: &["block_number", "transaction_index"],
};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("block_number", UInt64),
    ColumnDef::new("block_hash", Binary).optional(),
    ColumnDef::new("transaction_index", UInt64),
    ColumnDef::new("transaction_hash", Binary),
    ColumnDef::new("nonce", UInt64),
    ColumnDef::new("from_address", Binary),
    ColumnDef::new("to_address", Binary).nullable(),
    ColumnDef::new("value", UInt256),
    ColumnDef::new("input", Binary),
    ColumnDef::new("gas_limit", UInt64),
    ColumnDef::new("gas_price", UInt64).nullable(),
    ColumnDef::new("transaction_type", UInt32).nullable(),
    ColumnDef::new("max_priority_fee_per_gas", UInt64).nullable(),
    ColumnDef::new("max_fee_per_gas", UInt64).nullable(),
    ColumnDef::new("chain_id", UInt64).nullable().optional(),
    ColumnDef::new("gas_used", UInt64).from_receipt(),
    ColumnDef::new("success", Boolean).from_receipt(),
];
