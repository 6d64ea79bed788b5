//! Parquet compression codecs.

use parquet::basic::{self as pq, BrotliLevel, GzipLevel, ZstdLevel};

/// Parquet compression algorithm.
///
/// Parsed from a case-insensitive string with the following accepted values:
///
/// | Input              | Result                                   |
/// |--------------------|------------------------------------------|
/// | `uncompressed`     | No compression                           |
/// | `snappy`           | Snappy                                   |
/// | `lz4`              | LZ4 raw                                  |
/// | `gzip` / `gzip:N`  | Gzip at the default level (6) or N (0–9) |
/// | `brotli` / `brotli:N` | Brotli at the default level (1) or N (0–11) |
/// | `zstd` / `zstd:N`  | Zstandard at the default level (1) or N (1–22) |
///
/// Levels are validated at parse time against parquet's own constraints.
///
/// Default: `lz4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    Uncompressed,
    Snappy,
    #[default]
    Lz4,
    Gzip(GzipLevel),
    Brotli(BrotliLevel),
    Zstd(ZstdLevel),
}

impl<'de> serde::Deserialize<'de> for Compression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for Compression {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl std::str::FromStr for Compression {
    // Only ever surfaced through `serde::de::Error::custom` or a config error message.
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let (name, level) = match lower.split_once(':') {
            Some((name, level)) => (name, Some(level)),
            None => (lower.as_str(), None),
        };

        match (name, level) {
            ("uncompressed", None) => Ok(Self::Uncompressed),
            ("snappy", None) => Ok(Self::Snappy),
            ("lz4", None) => Ok(Self::Lz4),
            ("gzip", None) => Ok(Self::Gzip(GzipLevel::default())),
            ("gzip", Some(level)) => GzipLevel::try_new(parse_level(name, level)?)
                .map(Self::Gzip)
                .map_err(|err| format!("invalid gzip level: {err}")),
            ("brotli", None) => Ok(Self::Brotli(BrotliLevel::default())),
            ("brotli", Some(level)) => BrotliLevel::try_new(parse_level(name, level)?)
                .map(Self::Brotli)
                .map_err(|err| format!("invalid brotli level: {err}")),
            ("zstd", None) => Ok(Self::Zstd(ZstdLevel::default())),
            ("zstd", Some(level)) => ZstdLevel::try_new(parse_level(name, level)?)
                .map(Self::Zstd)
                .map_err(|err| format!("invalid zstd level: {err}")),
            ("uncompressed" | "snappy" | "lz4", Some(_)) => {
                Err(format!("compression '{name}' does not take a level"))
            }
            _ => Err(format!(
                "unknown compression algorithm: {s}. \
                 Supported: uncompressed, snappy, lz4, gzip[:N], brotli[:N], zstd[:N]"
            )),
        }
    }
}

fn parse_level<T: std::str::FromStr>(name: &str, level: &str) -> Result<T, String> {
    level
        .parse()
        .map_err(|_| format!("invalid {name} level: {level}"))
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncompressed => write!(f, "uncompressed"),
            Self::Snappy => write!(f, "snappy"),
            Self::Lz4 => write!(f, "lz4"),
            Self::Gzip(level) => write!(f, "gzip:{}", level.compression_level()),
            Self::Brotli(level) => write!(f, "brotli:{}", level.compression_level()),
            Self::Zstd(level) => write!(f, "zstd:{}", level.compression_level()),
        }
    }
}

impl From<&Compression> for pq::Compression {
    fn from(c: &Compression) -> Self {
        match c {
            Compression::Uncompressed => pq::Compression::UNCOMPRESSED,
            Compression::Snappy => pq::Compression::SNAPPY,
            Compression::Lz4 => pq::Compression::LZ4_RAW,
            Compression::Gzip(level) => pq::Compression::GZIP(*level),
            Compression::Brotli(level) => pq::Compression::BROTLI(*level),
            Compression::Zstd(level) => pq::Compression::ZSTD(*level),
        }
    }
}
