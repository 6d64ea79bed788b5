//! Dataset Writer: deterministic output paths and atomic per-chunk files.
//!
//! Every chunk maps to exactly one file whose path depends only on the collection and the
//! chunk. Files are written under a temporary name and renamed into place once complete, so a
//! path that exists always holds a complete chunk. That is what makes re-running a collection
//! with `overwrite = false` a resume.

use std::{
    collections::BTreeMap,
    io::{BufWriter, Write as _},
    path::{Path, PathBuf},
};

use arrow::{
    array::RecordBatch,
    compute::concat_batches,
    datatypes::SchemaRef,
    error::ArrowError,
};
use common::{Chunk, NetworkId};
use parquet::{
    arrow::ArrowWriter,
    file::properties::{EnabledStatistics, WriterProperties},
};

use crate::error::{ConfigError, WriteError};

pub mod compression;

pub use compression::Compression;

/// Appended to an output path while the file is being written.
pub const TMP_SUFFIX: &str = "_tmp";

/// On-disk format of the chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Parquet,
    Csv,
    Json,
}

impl OutputFormat {
    /// Picks the format from the exclusive `csv` / `json` flags. Parquet when neither is set.
    pub fn from_flags(csv: bool, json: bool) -> Result<Self, ConfigError> {
        match (csv, json) {
            (true, true) => Err(ConfigError::MultipleFormats),
            (true, false) => Ok(OutputFormat::Csv),
            (false, true) => Ok(OutputFormat::Json),
            (false, false) => Ok(OutputFormat::Parquet),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }

    /// Text formats cannot hold raw binary, so binary columns are rendered as hex.
    pub fn requires_hex(&self) -> bool {
        !matches!(self, OutputFormat::Parquet)
    }
}

/// One extra path component between the output directory and the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subdir {
    Datatype,
    Network,
    Literal(String),
}

impl std::str::FromStr for Subdir {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datatype" => Ok(Subdir::Datatype),
            "network" => Ok(Subdir::Network),
            "" | "." | ".." => Err(ConfigError::Subdir(s.to_string())),
            s if s.contains(['/', '\\']) => Err(ConfigError::Subdir(s.to_string())),
            s => Ok(Subdir::Literal(s.to_string())),
        }
    }
}

impl std::fmt::Display for Subdir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subdir::Datatype => f.write_str("datatype"),
            Subdir::Network => f.write_str("network"),
            Subdir::Literal(s) => f.write_str(s),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Subdir {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where and how chunk files are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputOptions {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub subdirs: Vec<Subdir>,
    /// Appended to every file stem as `__{suffix}`
    pub file_suffix: Option<String>,
    /// Replace existing chunk files instead of skipping their chunks
    pub overwrite: bool,
    pub compression: Compression,
    /// Rows per parquet row group. Mutually exclusive with `n_row_groups`.
    pub row_group_size: Option<usize>,
    /// Row groups per parquet file. Mutually exclusive with `row_group_size`.
    pub n_row_groups: Option<usize>,
    pub no_report: bool,
    /// Defaults to `{output_dir}/.glacier/reports`
    pub report_dir: Option<PathBuf>,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            format: OutputFormat::default(),
            subdirs: Vec::new(),
            file_suffix: None,
            overwrite: false,
            compression: Compression::default(),
            row_group_size: None,
            n_row_groups: None,
            no_report: false,
            report_dir: None,
        }
    }
}

impl OutputOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.row_group_size, self.n_row_groups) {
            (Some(row_group_size), Some(n_row_groups)) => {
                Err(ConfigError::RowGroupSizeAndCount {
                    row_group_size,
                    n_row_groups,
                })
            }
            (Some(0), None) | (None, Some(0)) => Err(ConfigError::ZeroRowGroups),
            _ => Ok(()),
        }
    }

    pub fn report_dir(&self) -> PathBuf {
        self.report_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".glacier").join("reports"))
    }

    /// Rows per row group for a file of `n_rows` rows, when the layout is tuned at all.
    fn rows_per_group(&self, n_rows: usize) -> Option<usize> {
        match (self.row_group_size, self.n_row_groups) {
            (Some(size), _) => Some(size.max(1)),
            (None, Some(n)) => Some(n_rows.div_ceil(n.max(1)).max(1)),
            (None, None) => None,
        }
    }
}

/// A chunk file that was renamed into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub n_rows: usize,
    pub n_bytes: u64,
}

/// Writes assembled chunk tables to their output files.
#[derive(Debug, Clone)]
pub struct DatasetWriter {
    network: NetworkId,
    label: Option<String>,
    options: OutputOptions,
}

impl DatasetWriter {
    pub fn new(
        network: NetworkId,
        label: Option<String>,
        options: OutputOptions,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            network,
            label,
            options,
        })
    }

    pub fn options(&self) -> &OutputOptions {
        &self.options
    }

    /// The output path of a chunk:
    /// `{output_dir}/{subdirs..}/{network}__{datatype}__{label?}__{chunk}[__{suffix}].{ext}`.
    pub fn path(&self, chunk: &Chunk) -> PathBuf {
        let mut path = self.options.output_dir.clone();
        for subdir in &self.options.subdirs {
            match subdir {
                Subdir::Datatype => path.push(chunk.datatype.as_str()),
                Subdir::Network => path.push(self.network.to_string()),
                Subdir::Literal(s) => path.push(s),
            }
        }

        let mut stem = vec![self.network.to_string(), chunk.datatype.to_string()];
        stem.extend(self.label.clone());
        stem.push(chunk.label());
        stem.extend(self.options.file_suffix.clone());

        path.push(format!(
            "{}.{}",
            stem.join("__"),
            self.options.format.extension()
        ));
        path
    }

    /// Whether the chunk's file exists and the chunk should therefore be skipped.
    pub fn should_skip(&self, path: &Path) -> bool {
        !self.options.overwrite && matches!(path.try_exists(), Ok(true))
    }

    /// Writes `batch` to `path` through a temporary file.
    ///
    /// A stale temporary file from an interrupted run is truncated, and the temporary file of a
    /// failed write is removed. Blocking, run it off the async workers.
    pub fn write(&self, batch: &RecordBatch, path: &Path) -> Result<WrittenFile, WriteError> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).map_err(WriteError::CreateDir)?;
        }

        let tmp = tmp_path(path);
        let written = self
            .encode(batch, &tmp)
            .and_then(|()| fs_err::rename(&tmp, path).map_err(WriteError::Io));
        if let Err(err) = written {
            if let Err(remove_err) = fs_err::remove_file(&tmp)
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(
                    error = %remove_err,
                    "failed to remove temporary file"
                );
            }
            return Err(err);
        }

        let n_bytes = fs_err::metadata(path).map_err(WriteError::Io)?.len();

        tracing::debug!(path = %path.display(), n_rows = batch.num_rows(), n_bytes, "wrote chunk file");

        Ok(WrittenFile {
            path: path.to_path_buf(),
            n_rows: batch.num_rows(),
            n_bytes,
        })
    }

    /// Encodes `batch` into the temporary file `tmp`.
    fn encode(&self, batch: &RecordBatch, tmp: &Path) -> Result<(), WriteError> {
        let file = fs_err::File::create(tmp).map_err(WriteError::Io)?;
        match self.options.format {
            OutputFormat::Parquet => {
                let props = self.parquet_properties(batch.num_rows());
                let parquet_err = |source| WriteError::Parquet {
                    path: tmp.to_path_buf(),
                    source,
                };
                let mut writer =
                    ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(parquet_err)?;
                writer.write(batch).map_err(parquet_err)?;
                writer.close().map_err(parquet_err)?;
            }
            OutputFormat::Csv => {
                let mut writer = arrow::csv::WriterBuilder::new()
                    .with_header(true)
                    .build(BufWriter::new(file));
                writer.write(batch).map_err(|source| WriteError::Arrow {
                    path: tmp.to_path_buf(),
                    source,
                })?;
                writer.into_inner().flush().map_err(WriteError::Io)?;
            }
            OutputFormat::Json => {
                let arrow_err = |source| WriteError::Arrow {
                    path: tmp.to_path_buf(),
                    source,
                };
                let mut writer = arrow::json::LineDelimitedWriter::new(BufWriter::new(file));
                writer.write(batch).map_err(arrow_err)?;
                writer.finish().map_err(arrow_err)?;
                writer.into_inner().flush().map_err(WriteError::Io)?;
            }
        }
        Ok(())
    }

    fn parquet_properties(&self, n_rows: usize) -> WriterProperties {
        let mut builder = WriterProperties::builder()
            .set_compression((&self.options.compression).into())
            .set_statistics_enabled(EnabledStatistics::Page);
        if let Some(rows) = self.options.rows_per_group(n_rows) {
            builder = builder.set_max_row_group_size(rows);
        }
        builder.build()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    PathBuf::from(tmp)
}

/// Collects chunk tables in memory and combines them in `sequence_index` order.
#[derive(Debug)]
pub struct Accumulator {
    schema: SchemaRef,
    batches: BTreeMap<usize, RecordBatch>,
}

impl Accumulator {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: BTreeMap::new(),
        }
    }

    pub fn accumulate(&mut self, sequence_index: usize, batch: RecordBatch) {
        self.batches.insert(sequence_index, batch);
    }

    pub fn finish(self) -> Result<RecordBatch, ArrowError> {
        concat_batches(&self.schema, self.batches.values())
    }
}
