//! Collection configuration.
//!
//! A collection is described by a TOML file (see [`config_file`]) that resolves into a
//! [`dump::Query`] and [`dump::CollectOpts`]. Loading only parses: call
//! [`ConfigFile::into_collection`] to validate.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use fs_err as fs;

pub mod config_file;

pub use config_file::{ColumnsConfig, ConfigFile, FetchConfig, OutputConfig, SourceConfig};

/// Prefix of the environment variables that override config file values
pub const ENV_PREFIX: &str = "GLACIER_CONFIG_";

/// Errors from loading or validating a collection config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    /// The TOML or an environment override could not be deserialized
    ///
    /// The figment error names the offending key and the provider it came from.
    #[error("failed to parse config")]
    Parse(#[source] Box<figment::Error>),

    /// Neither `blocks` nor `txs` was given
    #[error("one of blocks or txs is required")]
    MissingRange,

    /// Both `blocks` and `txs` were given
    #[error("blocks and txs are mutually exclusive")]
    BothRanges,

    /// The resolved collection failed validation
    #[error(transparent)]
    Collection(#[from] dump::ConfigError),
}

/// Load a [`ConfigFile`] from a TOML file with env-var overrides.
///
/// Relative `output.output_dir` and `output.report_dir` paths are resolved against the
/// directory of the config file.
pub fn load(path: impl AsRef<Path>) -> Result<ConfigFile, ConfigError> {
    let path = path.as_ref();
    let config_path =
        fs::canonicalize(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
    let contents = fs::read_to_string(&config_path)
        .map_err(|err| ConfigError::Io(config_path.clone(), err))?;

    let mut config = load_str(&contents)?;

    // Resolve any filesystem paths relative to the directory of the config file.
    if let Some(base) = config_path.parent() {
        let output = &mut config.output;
        output.output_dir = base.join(&output.output_dir);
        if let Some(report_dir) = &mut output.report_dir {
            *report_dir = base.join(&*report_dir);
        }
    }

    Ok(config)
}

/// Load a [`ConfigFile`] from TOML contents with env-var overrides.
///
/// Relative paths are kept as they are.
pub fn load_str(contents: &str) -> Result<ConfigFile, ConfigError> {
    Figment::new()
        .merge(Toml::string(contents))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|err| ConfigError::Parse(Box::new(err)))
}
