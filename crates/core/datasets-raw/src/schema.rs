//! Fixed per-datatype dataset schemas.

use common::Datatype;

use crate::tables;

/// Semantic type of a dataset column, independent of its output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    UInt32,
    UInt64,
    /// 256-bit unsigned integer, expanded into one output column per requested
    /// [`U256Type`](crate::U256Type)
    UInt256,
    /// Variable length binary, encoded as `0x` hex strings when `hex` is set
    Binary,
    String,
    Boolean,
    Timestamp,
}

/// Which remote call populates a column.
///
/// Columns whose source is not [`ColumnSource::Primary`] allow the fetcher to skip a whole
/// class of requests when none of them is projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    Primary,
    Receipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Part of the default projection
    pub default: bool,
    pub source: ColumnSource,
}

impl ColumnDef {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            default: true,
            source: ColumnSource::Primary,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn optional(mut self) -> Self {
        self.default = false;
        self
    }

    pub const fn from_receipt(mut self) -> Self {
        self.source = ColumnSource::Receipt;
        self
    }
}

/// The ordered column catalog of one datatype.
#[derive(Debug)]
pub struct DatasetSchema {
    pub datatype: Datatype,
    pub columns: &'static [ColumnDef],
    /// Columns the assembled table is sorted by unless the caller overrides it
    pub sort: &'static [&'static str],
}

impl DatasetSchema {
    pub fn for_datatype(datatype: Datatype) -> &'static DatasetSchema {
        match datatype {
            Datatype::Blocks => &tables::blocks::SCHEMA,
            Datatype::Transactions => &tables::transactions::SCHEMA,
            Datatype::Logs => &tables::logs::SCHEMA,
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn default_columns(&self) -> impl Iterator<Item = &'static ColumnDef> + use<> {
        let columns: &'static [ColumnDef] = self.columns;
        columns.iter().filter(|c| c.default)
    }
}
