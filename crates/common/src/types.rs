use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest name accepted for a folder or document.
pub const MAX_NAME_LEN: usize = 200;

/// Identity of a node (worker process).
///
/// Stored verbatim as lock document content and as the builder of a
/// projection instance, so it must stay stable across restarts of the
/// same node if crash-safe lock re-acquisition is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Creates a node ID from a fixed string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Reads `NODE_ID` from the environment, falling back to a random ID.
    pub fn from_env() -> Self {
        match std::env::var("NODE_ID") {
            Ok(id) if !id.trim().is_empty() => Self(id.trim().to_string()),
            _ => Self::new(),
        }
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A folder or document name outside the allowed character set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,

    #[error("name '{name}' is longer than {max} characters")]
    TooLong { name: String, max: usize },

    #[error("name '{name}' contains invalid character {found:?}")]
    InvalidCharacter { name: String, found: char },
}

/// Validates a single path segment: ASCII letters, digits, `_`, `-` and `.`.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            name: name.to_string(),
            max: MAX_NAME_LEN,
        });
    }
    if let Some(found) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(NameError::InvalidCharacter {
            name: name.to_string(),
            found,
        });
    }
    Ok(())
}
