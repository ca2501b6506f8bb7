use serde::{Deserialize, Serialize};

/// Write precondition for a document save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStoreVersion {
    /// Unconditional write.
    Any,
    /// The document must not exist.
    New,
    /// The document must be at exactly this version (`>= 1`).
    At(i64),
}

impl DocumentStoreVersion {
    /// Encodes as `Any = -1`, `New = 0`, or the version number.
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Any => -1,
            Self::New => 0,
            Self::At(version) => *version,
        }
    }

    /// Decodes the integer form; values below -1 are rejected.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::Any),
            0 => Some(Self::New),
            n if n > 0 => Some(Self::At(n)),
            _ => None,
        }
    }

    /// Returns whether a document currently at `current` (0 = absent) may be written.
    pub fn matches(&self, current: i64) -> bool {
        match self {
            Self::Any => true,
            Self::New => current == 0,
            Self::At(version) => current == *version,
        }
    }
}

impl std::fmt::Display for DocumentStoreVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::New => write!(f, "new"),
            Self::At(version) => write!(f, "{version}"),
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Name within its folder.
    pub name: String,
    /// Starts at 1 and grows by one per save.
    pub version: i64,
    pub content: String,
}

impl Document {
    /// Deserializes the content as JSON.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.content)
    }
}

/// Outcome of a conditional read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewerDocument {
    /// The document changed since the known version.
    Found(Document),
    /// The document is still at the known version.
    Unchanged,
    /// The document does not exist.
    Missing,
}

/// A secondary index annotation: the document can be found by any of `values`
/// under index `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub values: Vec<String>,
}

impl IndexEntry {
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// An entry with a single value.
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_encoding() {
        assert_eq!(DocumentStoreVersion::Any.as_i64(), -1);
        assert_eq!(DocumentStoreVersion::New.as_i64(), 0);
        assert_eq!(DocumentStoreVersion::At(4).as_i64(), 4);
        assert_eq!(DocumentStoreVersion::from_i64(-1), Some(DocumentStoreVersion::Any));
        assert_eq!(DocumentStoreVersion::from_i64(3), Some(DocumentStoreVersion::At(3)));
        assert_eq!(DocumentStoreVersion::from_i64(-2), None);
    }

    #[test]
    fn version_preconditions() {
        assert!(DocumentStoreVersion::Any.matches(0));
        assert!(DocumentStoreVersion::Any.matches(7));
        assert!(DocumentStoreVersion::New.matches(0));
        assert!(!DocumentStoreVersion::New.matches(1));
        assert!(DocumentStoreVersion::At(2).matches(2));
        assert!(!DocumentStoreVersion::At(2).matches(3));
    }
}
