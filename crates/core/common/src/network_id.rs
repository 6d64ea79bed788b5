//! Network identifiers as they appear in output file names.

/// A validated network name, e.g. `ethereum` or `base-sepolia`.
///
/// The name is embedded verbatim in output paths, so it must be non-empty, must not contain
/// the `__` field separator and may only use ASCII alphanumerics, `-` and `_`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl PartialEq<str> for NetworkId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NetworkId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == **other
    }
}

impl TryFrom<String> for NetworkId {
    type Error = InvalidNetworkIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_network_id(&value)?;
        Ok(NetworkId(value))
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for NetworkId {
    type Err = InvalidNetworkIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_network_id(s)?;
        Ok(NetworkId(s.to_string()))
    }
}

impl serde::Serialize for NetworkId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for NetworkId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.try_into().map_err(serde::de::Error::custom)
    }
}

fn validate_network_id(value: &str) -> Result<(), InvalidNetworkIdError> {
    if value.is_empty() {
        return Err(InvalidNetworkIdError::Empty);
    }
    if value.contains("__") {
        return Err(InvalidNetworkIdError::ContainsSeparator(value.to_string()));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(InvalidNetworkIdError::InvalidCharacter {
            value: value.to_string(),
            character: c,
        });
    }
    Ok(())
}

/// Errors that occur when validating a network identifier.
#[derive(Debug, thiserror::Error)]
pub enum InvalidNetworkIdError {
    /// The network name is an empty string
    #[error("network name cannot be empty")]
    Empty,

    /// The network name contains `__`
    ///
    /// Output file names use `__` to separate their fields, so a network name containing it
    /// would make file names ambiguous.
    #[error("network name '{0}' must not contain '__'")]
    ContainsSeparator(String),

    /// The network name contains a character that is unsafe in file names
    #[error("network name '{value}' contains invalid character '{character}'")]
    InvalidCharacter { value: String, character: char },
}

#[cfg(test)]
mod tests {
    use super::NetworkId;

    #[test]
    fn parse_with_valid_names_succeeds() {
        for name in ["ethereum", "base-sepolia", "arbitrum_one"] {
            let network: NetworkId = name.parse().expect("network name should parse");
            assert_eq!(network, name);
        }
    }

    #[test]
    fn parse_with_invalid_names_fails() {
        for name in ["", "eth__main", "eth/main", "eth main"] {
            assert!(name.parse::<NetworkId>().is_err(), "{name:?} should fail");
        }
    }

    #[test]
    fn deserialize_with_empty_string_fails() {
        //* Given
        let json = r#""""#;

        //* When
        let result = serde_json::from_str::<NetworkId>(json);

        //* Then
        assert!(result.is_err(), "empty string should fail deserialization");
    }
}
