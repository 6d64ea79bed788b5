//! Column projection and output encoding of a dataset schema.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use common::Datatype;

use crate::{
    schema::{ColumnDef, ColumnSource, ColumnType, DatasetSchema},
    timestamp_type,
};

/// Keyword selecting every column of a schema.
pub const ALL_COLUMNS: &str = "all";

/// Output representation of 256-bit integer columns.
///
/// Every requested representation becomes its own output column, named after the source column
/// with the type's suffix (`value_string`, `value_f64`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum U256Type {
    /// 32-byte big-endian
    Binary,
    /// Decimal string, lossless
    String,
    /// Nearest `f64`, lossy
    F64,
    /// `u64`, null when the value does not fit
    U64,
    /// `Decimal128(38, 0)`, null when the value does not fit
    Decimal128,
}

pub const DEFAULT_U256_TYPES: [U256Type; 3] = [U256Type::Binary, U256Type::String, U256Type::F64];

impl U256Type {
    pub fn as_str(&self) -> &'static str {
        match self {
            U256Type::Binary => "binary",
            U256Type::String => "string",
            U256Type::F64 => "f64",
            U256Type::U64 => "u64",
            U256Type::Decimal128 => "decimal128",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            U256Type::Binary => "_binary",
            U256Type::String => "_string",
            U256Type::F64 => "_f64",
            U256Type::U64 => "_u64",
            U256Type::Decimal128 => "_d128",
        }
    }

    fn is_lossy_nullable(&self) -> bool {
        matches!(self, U256Type::U64 | U256Type::Decimal128)
    }
}

impl std::fmt::Display for U256Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl std::str::FromStr for U256Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(U256Type::Binary),
            "string" | "str" => Ok(U256Type::String),
            "f64" | "float64" | "float" => Ok(U256Type::F64),
            "u64" | "uint64" => Ok(U256Type::U64),
            "decimal128" | "d128" => Ok(U256Type::Decimal128),
            other => Err(format!("invalid u256 type: '{other}'")),
        }
    }
}

impl serde::Serialize for U256Type {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for U256Type {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which columns of a datatype to output.
///
/// `columns` fully overrides the default set. Otherwise `include_columns` adds to it and
/// `exclude_columns` removes from it. Any of them may contain `"all"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ColumnSelection {
    pub columns: Option<Vec<String>>,
    pub include_columns: Vec<String>,
    pub exclude_columns: Vec<String>,
}

impl ColumnSelection {
    /// Resolves the selection against `schema`, keeping schema column order.
    pub fn resolve(
        &self,
        schema: &'static DatasetSchema,
    ) -> Result<Vec<&'static ColumnDef>, ColumnSelectionError> {
        let names = self
            .columns
            .iter()
            .flatten()
            .chain(&self.include_columns)
            .chain(&self.exclude_columns);
        for name in names {
            if name != ALL_COLUMNS && schema.column(name).is_none() {
                return Err(ColumnSelectionError::UnknownColumn {
                    datatype: schema.datatype,
                    column: name.clone(),
                });
            }
        }

        let has_all = |names: &[String]| names.iter().any(|n| n == ALL_COLUMNS);
        let contains = |names: &[String], def: &ColumnDef| names.iter().any(|n| n == def.name);

        let selected: Vec<&'static ColumnDef> = match &self.columns {
            Some(columns) if has_all(columns) => schema.columns.iter().collect(),
            Some(columns) => schema
                .columns
                .iter()
                .filter(|def| contains(columns, *def))
                .collect(),
            None if has_all(&self.include_columns) => schema.columns.iter().collect(),
            None => schema
                .columns
                .iter()
                .filter(|def| def.default || contains(&self.include_columns, *def))
                .filter(|def| !contains(&self.exclude_columns, *def))
                .collect(),
        };

        if selected.is_empty() {
            return Err(ColumnSelectionError::EmptySelection(schema.datatype));
        }
        Ok(selected)
    }
}

/// Encoding options applied uniformly to an assembled table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembleOptions {
    /// Render binary columns as `0x` prefixed hex strings
    pub hex: bool,
    pub u256_types: Vec<U256Type>,
    /// Sort columns. `None` uses the datatype's default sort, an empty list disables sorting.
    pub sort: Option<Vec<String>>,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            hex: false,
            u256_types: DEFAULT_U256_TYPES.to_vec(),
            sort: None,
        }
    }
}

/// How one output column is derived from its source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Native,
    Hex,
    U256 { ty: U256Type, hex: bool },
}

#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub def: &'static ColumnDef,
    pub encoding: Encoding,
}

/// A dataset schema projected for one collection.
///
/// Fixed for the lifetime of a collection, so every chunk of a datatype is assembled with the
/// same columns and the same encodings.
#[derive(Debug, Clone)]
pub struct TableSchema {
    datatype: Datatype,
    schema: SchemaRef,
    columns: Vec<OutputColumn>,
    sort: Vec<usize>,
}

impl TableSchema {
    pub fn new(
        datatype: Datatype,
        selection: &ColumnSelection,
        options: &AssembleOptions,
    ) -> Result<Self, ColumnSelectionError> {
        let dataset = DatasetSchema::for_datatype(datatype);
        let selected = selection.resolve(dataset)?;

        let mut u256_types: Vec<U256Type> = Vec::with_capacity(options.u256_types.len());
        for ty in &options.u256_types {
            if !u256_types.contains(ty) {
                u256_types.push(*ty);
            }
        }
        if u256_types.is_empty() {
            return Err(ColumnSelectionError::EmptyU256Types);
        }

        let mut columns = Vec::new();
        let mut fields = Vec::new();
        for def in &selected {
            match def.ty {
                ColumnType::UInt256 => {
                    for ty in &u256_types {
                        let encoding = Encoding::U256 {
                            ty: *ty,
                            hex: options.hex,
                        };
                        fields.push(Field::new(
                            format!("{}{}", def.name, ty.suffix()),
                            output_type(def.ty, encoding),
                            def.nullable || ty.is_lossy_nullable(),
                        ));
                        columns.push(OutputColumn { def, encoding });
                    }
                }
                ColumnType::Binary if options.hex => {
                    fields.push(Field::new(def.name, DataType::Utf8, def.nullable));
                    columns.push(OutputColumn {
                        def,
                        encoding: Encoding::Hex,
                    });
                }
                ty => {
                    fields.push(Field::new(
                        def.name,
                        output_type(ty, Encoding::Native),
                        def.nullable,
                    ));
                    columns.push(OutputColumn {
                        def,
                        encoding: Encoding::Native,
                    });
                }
            }
        }

        let first_output = |name: &str| columns.iter().position(|c| c.def.name == name);
        let sort = match &options.sort {
            None => dataset.sort.iter().filter_map(|&name| first_output(name)).collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    if dataset.column(name).is_none() {
                        return Err(ColumnSelectionError::UnknownSortColumn {
                            datatype,
                            column: name.clone(),
                        });
                    }
                    first_output(name).ok_or_else(|| ColumnSelectionError::SortColumnNotSelected {
                        datatype,
                        column: name.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(Self {
            datatype,
            schema: Arc::new(Schema::new(fields)),
            columns,
            sort,
        })
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn columns(&self) -> &[OutputColumn] {
        &self.columns
    }

    /// Indices of the output columns the table is sorted by.
    pub fn sort_indices(&self) -> &[usize] {
        &self.sort
    }

    /// Whether the projection contains a source column.
    pub fn selects(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.def.name == column)
    }

    /// Whether any projected column is populated by `source`.
    pub fn needs_source(&self, source: ColumnSource) -> bool {
        self.columns.iter().any(|c| c.def.source == source)
    }
}

fn output_type(ty: ColumnType, encoding: Encoding) -> DataType {
    match (ty, encoding) {
        (_, Encoding::Hex) => DataType::Utf8,
        (_, Encoding::U256 { ty, hex }) => match ty {
            U256Type::Binary if hex => DataType::Utf8,
            U256Type::Binary => DataType::FixedSizeBinary(32),
            U256Type::String => DataType::Utf8,
            U256Type::F64 => DataType::Float64,
            U256Type::U64 => DataType::UInt64,
            U256Type::Decimal128 => DataType::Decimal128(38, 0),
        },
        (ColumnType::UInt32, _) => DataType::UInt32,
        (ColumnType::UInt64, _) => DataType::UInt64,
        (ColumnType::UInt256, _) => DataType::FixedSizeBinary(32),
        (ColumnType::Binary, _) => DataType::Binary,
        (ColumnType::String, _) => DataType::Utf8,
        (ColumnType::Boolean, _) => DataType::Boolean,
        (ColumnType::Timestamp, _) => timestamp_type(),
    }
}

/// Errors in the column selection or encoding options, detected before anything is fetched.
#[derive(Debug, thiserror::Error)]
pub enum ColumnSelectionError {
    /// A column name in `columns`, `include_columns` or `exclude_columns` is not in the schema
    #[error("unknown column '{column}' for datatype {datatype}")]
    UnknownColumn { datatype: Datatype, column: String },

    /// A sort column is not in the schema
    #[error("unknown sort column '{column}' for datatype {datatype}")]
    UnknownSortColumn { datatype: Datatype, column: String },

    /// A sort column exists but was projected out
    ///
    /// Sorting happens on the assembled table, which only holds projected columns.
    #[error("sort column '{column}' is not selected for datatype {datatype}")]
    SortColumnNotSelected { datatype: Datatype, column: String },

    /// The selection leaves no columns at all
    #[error("column selection for datatype {0} is empty")]
    EmptySelection(Datatype),

    /// `u256_types` is empty
    #[error("at least one u256 type is required")]
    EmptyU256Types,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(datatype: Datatype, selection: &ColumnSelection) -> Vec<&'static str> {
        selection
            .resolve(DatasetSchema::for_datatype(datatype))
            .expect("Failed to resolve column selection")
            .into_iter()
            .map(|def| def.name)
            .collect()
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn columns_override_defaults_and_ignore_excludes() {
        //* Given
        let selection = ColumnSelection {
            columns: Some(strings(&["topic0", "block_number"])),
            include_columns: vec![],
            exclude_columns: strings(&["block_number"]),
        };

        //* When
        let selected = names(Datatype::Logs, &selection);

        //* Then
        assert_eq!(selected, vec!["block_number", "topic0"]);
    }

    #[test]
    fn include_and_exclude_adjust_defaults() {
        //* Given
        let selection = ColumnSelection {
            columns: None,
            include_columns: strings(&["block_hash"]),
            exclude_columns: strings(&["data", "topic3"]),
        };

        //* When
        let selected = names(Datatype::Logs, &selection);

        //* Then
        assert_eq!(
            selected,
            vec![
                "block_number",
                "block_hash",
                "transaction_index",
                "log_index",
                "transaction_hash",
                "address",
                "topic0",
                "topic1",
                "topic2",
            ]
        );
    }

    #[test]
    fn exclude_is_a_no_op_when_including_all() {
        //* Given
        let selection = ColumnSelection {
            columns: None,
            include_columns: strings(&[ALL_COLUMNS]),
            exclude_columns: strings(&["data"]),
        };

        //* When
        let selected = names(Datatype::Logs, &selection);

        //* Then
        assert_eq!(selected.len(), DatasetSchema::for_datatype(Datatype::Logs).columns.len());
        assert!(selected.contains(&"data"));
    }

    #[test]
    fn unknown_column_is_rejected() {
        //* Given
        let selection = ColumnSelection {
            exclude_columns: strings(&["not_a_column"]),
            ..Default::default()
        };

        //* When
        let result = selection.resolve(DatasetSchema::for_datatype(Datatype::Blocks));

        //* Then
        assert!(matches!(
            result,
            Err(ColumnSelectionError::UnknownColumn { column, .. }) if column == "not_a_column"
        ));
    }

    #[test]
    fn u256_columns_expand_per_type_with_suffixes() {
        //* Given
        let selection = ColumnSelection {
            columns: Some(strings(&["block_number", "value"])),
            ..Default::default()
        };
        let options = AssembleOptions {
            u256_types: vec![U256Type::String, U256Type::U64, U256Type::String],
            ..Default::default()
        };

        //* When
        let table = TableSchema::new(Datatype::Transactions, &selection, &options)
            .expect("Failed to build table schema");

        //* Then
        let schema = table.schema();
        let fields: Vec<_> = schema
            .fields()
            .iter()
            .map(|f| (f.name().as_str(), f.data_type().clone(), f.is_nullable()))
            .collect();
        assert_eq!(
            fields,
            vec![
                ("block_number", DataType::UInt64, false),
                ("value_string", DataType::Utf8, false),
                ("value_u64", DataType::UInt64, true),
            ]
        );
    }

    #[test]
    fn hex_turns_binary_columns_into_strings() {
        //* Given
        let options = AssembleOptions {
            hex: true,
            ..Default::default()
        };

        //* When
        let table = TableSchema::new(Datatype::Logs, &ColumnSelection::default(), &options)
            .expect("Failed to build table schema");

        //* Then
        let schema = table.schema();
        let address = schema.field_with_name("address").expect("address column");
        assert_eq!(address.data_type(), &DataType::Utf8);
    }

    #[test]
    fn default_sort_drops_excluded_columns() {
        //* Given
        let selection = ColumnSelection {
            exclude_columns: strings(&["log_index"]),
            ..Default::default()
        };

        //* When
        let table = TableSchema::new(Datatype::Logs, &selection, &AssembleOptions::default())
            .expect("Failed to build table schema");

        //* Then
        assert_eq!(table.sort_indices(), &[0]);
    }

    #[test]
    fn explicit_sort_must_name_selected_columns() {
        //* Given
        let selection = ColumnSelection {
            exclude_columns: strings(&["log_index"]),
            ..Default::default()
        };
        let options = AssembleOptions {
            sort: Some(strings(&["log_index"])),
            ..Default::default()
        };

        //* When
        let result = TableSchema::new(Datatype::Logs, &selection, &options);

        //* Then
        assert!(matches!(
            result,
            Err(ColumnSelectionError::SortColumnNotSelected { .. })
        ));
    }

    #[test]
    fn receipt_source_follows_projection() {
        //* Given
        let without_receipts = ColumnSelection {
            exclude_columns: strings(&["gas_used", "success"]),
            ..Default::default()
        };

        //* When
        let full = TableSchema::new(
            Datatype::Transactions,
            &ColumnSelection::default(),
            &AssembleOptions::default(),
        )
        .expect("Failed to build table schema");
        let trimmed = TableSchema::new(
            Datatype::Transactions,
            &without_receipts,
            &AssembleOptions::default(),
        )
        .expect("Failed to build table schema");

        //* Then
        assert!(full.needs_source(ColumnSource::Receipt));
        assert!(!trimmed.needs_source(ColumnSource::Receipt));
    }
}
