//! Error types for the model crate.

use std::fmt;

#[derive(Debug)]
pub enum ModelError {
    /// A payload class that requires a uuid was built without one.
    MissingUuid,
    /// Content was present but not decodable into the expected shape.
    MalformedContent(String),
    /// An operation referenced a uuid with no live item behind it.
    ItemNotFound(String),
    /// A raw record could not be interpreted as a payload.
    MalformedPayload(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingUuid => write!(f, "payload requires a uuid"),
            Self::MalformedContent(msg) => write!(f, "malformed content: {}", msg),
            Self::ItemNotFound(uuid) => write!(f, "no item with uuid {}", uuid),
            Self::MalformedPayload(msg) => write!(f, "malformed payload: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {}
