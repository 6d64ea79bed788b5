//! Assembly of raw records into typed, sorted Arrow tables.

use std::sync::Arc;

use alloy::primitives::U256;
use arrow::{
    array::{
        ArrayRef, BinaryArray, BooleanArray, Decimal128Array, FixedSizeBinaryArray,
        Float64Array, RecordBatch, StringArray, TimestampNanosecondArray, UInt32Array,
        UInt64Array,
    },
    compute::take_record_batch,
    error::ArrowError,
    row::{RowConverter, SortField},
};
use common::Datatype;

use crate::{
    projection::{Encoding, OutputColumn, TableSchema, U256Type},
    record::{RawRecord, Value},
    schema::ColumnType,
};

const DECIMAL128_MAX: i128 = 10i128.pow(38) - 1;

impl TableSchema {
    /// Builds one table from the raw records of a chunk, then sorts it.
    ///
    /// Every projected column is read from every record. A missing or null value in a
    /// non-nullable column fails the whole table with a [`SchemaMismatchError`].
    pub fn assemble(&self, records: &[RawRecord]) -> Result<RecordBatch, AssembleError> {
        let columns = self
            .columns()
            .iter()
            .map(|column| build_column(self.datatype(), column, records))
            .collect::<Result<Vec<_>, _>>()?;
        let batch = RecordBatch::try_new(self.schema(), columns)?;
        Ok(self.sort(batch)?)
    }

    /// Stable ascending sort by the table's sort columns.
    fn sort(&self, batch: RecordBatch) -> Result<RecordBatch, ArrowError> {
        if self.sort_indices().is_empty() || batch.num_rows() < 2 {
            return Ok(batch);
        }

        let sort_columns: Vec<ArrayRef> = self
            .sort_indices()
            .iter()
            .map(|i| batch.column(*i).clone())
            .collect();
        let converter = RowConverter::new(
            sort_columns
                .iter()
                .map(|c| SortField::new(c.data_type().clone()))
                .collect(),
        )?;
        let rows = converter.convert_columns(&sort_columns)?;

        let mut indices: Vec<u32> = (0..batch.num_rows() as u32).collect();
        // `sort_by` is stable, rows with equal keys keep their fetch order.
        indices.sort_by(|a, b| rows.row(*a as usize).cmp(&rows.row(*b as usize)));
        take_record_batch(&batch, &UInt32Array::from(indices))
    }
}

fn build_column(
    datatype: Datatype,
    column: &OutputColumn,
    records: &[RawRecord],
) -> Result<ArrayRef, SchemaMismatchError> {
    let def = column.def;
    let mismatch = |row: usize, kind: MismatchKind| SchemaMismatchError {
        datatype,
        column: def.name,
        row,
        kind,
    };

    // Applies `convert` to the value of every row, mapping absent nullable values to `None`.
    let values = |convert: &dyn Fn(&Value) -> Result<Option<Converted>, MismatchKind>| {
        records
            .iter()
            .enumerate()
            .map(|(row, record)| match record.get(def.name) {
                None | Some(Value::Null) if def.nullable => Ok(None),
                None => Err(mismatch(row, MismatchKind::Missing)),
                Some(Value::Null) => Err(mismatch(row, MismatchKind::UnexpectedNull)),
                Some(value) => convert(value).map_err(|kind| mismatch(row, kind)),
            })
            .collect::<Result<Vec<Option<Converted>>, _>>()
    };

    let array: ArrayRef = match (def.ty, column.encoding) {
        (ColumnType::UInt256, Encoding::U256 { ty, hex }) => {
            let converted = values(&|v| u256(v).map(|v| encode_u256(v, ty, hex)))?;
            match ty {
                U256Type::Binary if hex => Arc::new(StringArray::from_iter(strings(converted))),
                U256Type::Binary => Arc::new(
                    FixedSizeBinaryArray::try_from_sparse_iter_with_size(bytes(converted), 32)
                        .map_err(|err| mismatch(0, MismatchKind::Encoding(err.to_string())))?,
                ),
                U256Type::String => Arc::new(StringArray::from_iter(strings(converted))),
                U256Type::F64 => Arc::new(Float64Array::from_iter(converted.into_iter().map(
                    |v| match v {
                        Some(Converted::F64(f)) => Some(f),
                        _ => None,
                    },
                ))),
                U256Type::U64 => Arc::new(UInt64Array::from_iter(converted.into_iter().map(
                    |v| match v {
                        Some(Converted::UInt(n)) => Some(n),
                        _ => None,
                    },
                ))),
                U256Type::Decimal128 => Arc::new(
                    Decimal128Array::from_iter(converted.into_iter().map(|v| match v {
                        Some(Converted::Decimal(d)) => Some(d),
                        _ => None,
                    }))
                    .with_precision_and_scale(38, 0)
                    .map_err(|err| mismatch(0, MismatchKind::Encoding(err.to_string())))?,
                ),
            }
        }
        (ColumnType::Binary, Encoding::Hex) => {
            let converted = values(&|v| match v {
                Value::Binary(b) => Ok(Some(Converted::String(alloy::hex::encode_prefixed(b)))),
                other => Err(wrong_type("binary", other)),
            })?;
            Arc::new(StringArray::from_iter(strings(converted)))
        }
        (ColumnType::Binary, _) => {
            let converted = values(&|v| match v {
                Value::Binary(b) => Ok(Some(Converted::Bytes(b.clone()))),
                other => Err(wrong_type("binary", other)),
            })?;
            Arc::new(BinaryArray::from_iter(bytes(converted)))
        }
        (ColumnType::UInt32, _) => {
            let converted = values(&|v| match v {
                Value::UInt(n) => u32::try_from(*n)
                    .map(|n| Some(Converted::UInt(n.into())))
                    .map_err(|_| MismatchKind::OutOfRange(n.to_string())),
                other => Err(wrong_type("uint", other)),
            })?;
            Arc::new(UInt32Array::from_iter(converted.into_iter().map(|v| match v {
                // Range checked above.
                Some(Converted::UInt(n)) => Some(n as u32),
                _ => None,
            })))
        }
        (ColumnType::UInt64, _) => {
            let converted = values(&|v| match v {
                Value::UInt(n) => Ok(Some(Converted::UInt(*n))),
                other => Err(wrong_type("uint", other)),
            })?;
            Arc::new(UInt64Array::from_iter(converted.into_iter().map(|v| match v {
                Some(Converted::UInt(n)) => Some(n),
                _ => None,
            })))
        }
        (ColumnType::Boolean, _) => {
            let converted = values(&|v| match v {
                Value::Bool(b) => Ok(Some(Converted::Bool(*b))),
                other => Err(wrong_type("bool", other)),
            })?;
            Arc::new(BooleanArray::from_iter(converted.into_iter().map(|v| match v {
                Some(Converted::Bool(b)) => Some(b),
                _ => None,
            })))
        }
        (ColumnType::String, _) => {
            let converted = values(&|v| match v {
                Value::String(s) => Ok(Some(Converted::String(s.clone()))),
                other => Err(wrong_type("string", other)),
            })?;
            Arc::new(StringArray::from_iter(strings(converted)))
        }
        (ColumnType::Timestamp, _) => {
            let converted = values(&|v| {
                let nanos = match v {
                    Value::Timestamp(ts) => ts.0.as_nanos(),
                    Value::UInt(secs) => u128::from(*secs) * 1_000_000_000,
                    other => return Err(wrong_type("timestamp", other)),
                };
                i64::try_from(nanos)
                    .map(|n| Some(Converted::Nanos(n)))
                    .map_err(|_| MismatchKind::OutOfRange(nanos.to_string()))
            })?;
            Arc::new(
                TimestampNanosecondArray::from_iter(converted.into_iter().map(|v| match v {
                    Some(Converted::Nanos(n)) => Some(n),
                    _ => None,
                }))
                .with_timezone("+00:00"),
            )
        }
        (ColumnType::UInt256, _) => {
            let converted = values(&|v| u256(v).map(|v| encode_u256(v, U256Type::Binary, false)))?;
            Arc::new(
                FixedSizeBinaryArray::try_from_sparse_iter_with_size(bytes(converted), 32)
                    .map_err(|err| mismatch(0, MismatchKind::Encoding(err.to_string())))?,
            )
        }
    };
    Ok(array)
}

/// A single value converted to its output representation.
enum Converted {
    Bool(bool),
    UInt(u64),
    F64(f64),
    Decimal(i128),
    Nanos(i64),
    String(String),
    Bytes(Vec<u8>),
}

fn strings(values: Vec<Option<Converted>>) -> impl Iterator<Item = Option<String>> {
    values.into_iter().map(|v| match v {
        Some(Converted::String(s)) => Some(s),
        _ => None,
    })
}

fn bytes(values: Vec<Option<Converted>>) -> impl Iterator<Item = Option<Vec<u8>>> {
    values.into_iter().map(|v| match v {
        Some(Converted::Bytes(b)) => Some(b),
        _ => None,
    })
}

fn u256(value: &Value) -> Result<U256, MismatchKind> {
    match value {
        Value::U256(v) => Ok(*v),
        Value::UInt(n) => Ok(U256::from(*n)),
        other => Err(wrong_type("u256", other)),
    }
}

fn encode_u256(value: U256, ty: U256Type, hex: bool) -> Option<Converted> {
    match ty {
        U256Type::Binary if hex => Some(Converted::String(alloy::hex::encode_prefixed(
            value.to_be_bytes::<32>(),
        ))),
        U256Type::Binary => Some(Converted::Bytes(value.to_be_bytes::<32>().to_vec())),
        U256Type::String => Some(Converted::String(value.to_string())),
        U256Type::F64 => Some(Converted::F64(u256_to_f64(value))),
        U256Type::U64 => u64::try_from(value).ok().map(Converted::UInt),
        U256Type::Decimal128 => u128::try_from(value)
            .ok()
            .and_then(|v| i128::try_from(v).ok())
            .filter(|v| *v <= DECIMAL128_MAX)
            .map(Converted::Decimal),
    }
}

fn u256_to_f64(value: U256) -> f64 {
    const LIMB: f64 = 18_446_744_073_709_551_616.0; // 2^64
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * LIMB + *limb as f64)
}

fn wrong_type(expected: &'static str, found: &Value) -> MismatchKind {
    MismatchKind::WrongType {
        expected,
        found: found.kind(),
    }
}

/// A raw record cannot populate a projected column.
///
/// Fails the chunk the records belong to; it never fails the whole collection.
#[derive(Debug, thiserror::Error)]
#[error("cannot populate {datatype} column '{column}' at row {row}: {kind}")]
pub struct SchemaMismatchError {
    pub datatype: Datatype,
    pub column: &'static str,
    pub row: usize,
    #[source]
    pub kind: MismatchKind,
}

/// The specific way a raw value failed to fit its column.
#[derive(Debug, thiserror::Error)]
pub enum MismatchKind {
    /// The record has no value for a non-nullable column
    #[error("value is missing")]
    Missing,

    /// The record has an explicit null for a non-nullable column
    #[error("value is null in a non-nullable column")]
    UnexpectedNull,

    /// The value has a different kind than the column type expects
    #[error("expected {expected} value, found {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    /// The value does not fit the column's integer width
    #[error("value {0} is out of range")]
    OutOfRange(String),

    /// The converted values could not be encoded into an Arrow array
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Errors returned by [`TableSchema::assemble`].
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatchError),

    /// The assembled columns could not form a record batch or could not be sorted
    ///
    /// This indicates a bug in schema projection rather than bad input.
    #[error("failed to build record batch")]
    Arrow(#[from] ArrowError),
}
