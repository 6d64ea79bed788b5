//! Datatype identifiers and their ordering-dimension support.

use crate::partition::PartitionDimension;

/// A named record schema that can be extracted from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Datatype {
    Blocks,
    Transactions,
    Logs,
}

impl Datatype {
    pub const ALL: [Datatype; 3] = [Datatype::Blocks, Datatype::Transactions, Datatype::Logs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Blocks => "blocks",
            Datatype::Transactions => "transactions",
            Datatype::Logs => "logs",
        }
    }

    /// Whether this datatype can be collected over a list of transaction hashes.
    pub fn supports_transaction_domain(&self) -> bool {
        match self {
            Datatype::Blocks => false,
            Datatype::Transactions | Datatype::Logs => true,
        }
    }

    /// Whether chunks of this datatype can be split by the given auxiliary dimension.
    pub fn supports_dimension(&self, dimension: PartitionDimension) -> bool {
        match (self, dimension) {
            (Datatype::Logs, PartitionDimension::Address | PartitionDimension::Topic0) => true,
            (Datatype::Blocks | Datatype::Transactions, _) => false,
        }
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl std::str::FromStr for Datatype {
    type Err = UnknownDatatypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(Datatype::Blocks),
            "transactions" | "txs" => Ok(Datatype::Transactions),
            "logs" | "events" => Ok(Datatype::Logs),
            other => Err(UnknownDatatypeError(other.to_string())),
        }
    }
}

impl serde::Serialize for Datatype {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Datatype {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error returned when parsing a datatype name that is not in the catalog.
#[derive(Debug, thiserror::Error)]
#[error("unknown datatype: '{0}', expected one of: blocks, transactions, logs")]
pub struct UnknownDatatypeError(String);
