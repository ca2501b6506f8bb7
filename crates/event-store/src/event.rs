use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{EventStoreError, Result};

/// Position of an event within its stream.
///
/// Versions start at 1 for the first event and increment by 1 for each
/// subsequent event on a stream; 0 means the stream does not exist.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of a stream that does not exist yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Cursor position in the global event log.
///
/// Wraps the monotonically increasing id assigned at append time. The
/// string form is the decimal id, with `""` standing for the initial
/// position before any event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct EventStoreToken(i64);

impl EventStoreToken {
    /// The position before the first event.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Creates a token from a storage id.
    pub fn from_id(id: i64) -> Self {
        Self(id.max(0))
    }

    /// Returns the storage id (0 for the initial token).
    pub fn id(&self) -> i64 {
        self.0
    }

    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for EventStoreToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            Ok(())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::str::FromStr for EventStoreToken {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::initial());
        }
        match s.parse::<i64>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(EventStoreError::InvalidToken(s.to_string())),
        }
    }
}

impl From<EventStoreToken> for String {
    fn from(token: EventStoreToken) -> Self {
        token.to_string()
    }
}

impl TryFrom<String> for EventStoreToken {
    type Error = EventStoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Expected stream version for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStoreVersion {
    /// No version check.
    Any,
    /// The stream must not exist yet.
    EmptyStream,
    /// The stream must be at exactly this version.
    Number(i64),
}

impl EventStoreVersion {
    /// Encoded form: `Any = -2`, `EmptyStream = -1`, numbered `>= 0`.
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Any => -2,
            Self::EmptyStream => -1,
            Self::Number(n) => *n,
        }
    }

    /// Decodes the numeric form, rejecting values below -2.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            -2 => Some(Self::Any),
            -1 => Some(Self::EmptyStream),
            n if n >= 0 => Some(Self::Number(n)),
            _ => None,
        }
    }

    /// Expects the stream to be at `version`.
    pub fn at(version: Version) -> Self {
        Self::Number(version.as_i64())
    }

    /// Returns whether a stream currently at `current` satisfies this expectation.
    pub fn matches(&self, current: Version) -> bool {
        match self {
            Self::Any => true,
            Self::EmptyStream => current == Version::initial(),
            Self::Number(n) => current.as_i64() == *n,
        }
    }
}

impl std::fmt::Display for EventStoreVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::EmptyStream => write!(f, "empty stream"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Serialization format tag for JSON bodies.
pub const FORMAT_JSON: &str = "json";

/// An event submitted for appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// The type discriminator (e.g., "ToolCreated").
    pub event_type: String,

    /// Serialization format of `contents`.
    pub format: String,

    /// The serialized body.
    pub contents: String,
}

impl NewEvent {
    /// Creates an event with a pre-serialized JSON body.
    pub fn new(event_type: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            format: FORMAT_JSON.to_string(),
            contents: contents.into(),
        }
    }

    /// Serializes `payload` as the JSON body.
    pub fn json<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_string(payload)?))
    }

    /// Overrides the serialization format tag.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }
}

/// An event as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Global position, assigned at append time.
    pub token: EventStoreToken,

    /// The stream this event belongs to.
    pub stream_name: String,

    /// Position within the stream (1-based).
    pub stream_version: Version,

    /// The type discriminator.
    pub event_type: String,

    /// Serialization format of the body.
    pub format: String,

    /// The body, `None` when the event was read header-only.
    pub contents: Option<String>,
}

impl StoredEvent {
    pub fn has_body(&self) -> bool {
        self.contents.is_some()
    }

    /// Returns a copy without the body.
    pub fn header(&self) -> Self {
        Self {
            contents: None,
            ..self.clone()
        }
    }

    /// Deserializes the JSON body.
    ///
    /// Fails with [`EventStoreError::BodyNotLoaded`] for header-only events.
    pub fn deserialize_body<T: DeserializeOwned>(&self) -> Result<T> {
        let contents = self
            .contents
            .as_deref()
            .ok_or(EventStoreError::BodyNotLoaded(self.token))?;
        Ok(serde_json::from_str(contents)?)
    }
}
