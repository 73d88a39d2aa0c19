//! Shelf core types: records, drafts, view entries and the error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod event;

pub use event::{LiveEvent, RawEvent, EVENT_CREATED, EVENT_DELETED};

/// Server-assigned record identifier. Opaque; stable for the record's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Client-generated token tying a create request to its response and live event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(pub String);

impl CorrelationToken {
    /// Fresh random token (uuid v4).
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4().to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for CorrelationToken {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// One catalog item as delivered by the snapshot and the live event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(alias = "_id")]
    pub id: RecordId,
    pub title: String,
    pub description: String,
    pub image_url: String,
    /// Display only; never used for ordering.
    pub created_at: DateTime<Utc>,
    /// Echo of the token sent with the create request, when the server has one.
    #[serde(rename = "clientToken", default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CorrelationToken>,
}

/// Image file attached to a create request.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    /// Build an upload from a path-like name; falls back to `image.jpg` when the
    /// name has no final segment.
    pub fn new(path: &str, bytes: Vec<u8>) -> Self {
        let file_name = path
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("image.jpg")
            .to_string();
        let mime_type = Self::infer_mime(&file_name).to_string();
        Self { file_name, mime_type, bytes }
    }

    pub fn infer_mime(file_name: &str) -> &'static str {
        if file_name.to_ascii_lowercase().ends_with(".png") { "image/png" } else { "image/jpeg" }
    }
}

impl fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageUpload")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Candidate fields for a new record, before the server has assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub title: String,
    pub description: String,
    pub image: Option<ImageUpload>,
}

impl Draft {
    pub fn new(title: &str, description: &str, image: Option<ImageUpload>) -> Self {
        Self { title: title.trim().to_string(), description: description.trim().to_string(), image }
    }

    /// Local checks run before any optimistic effect is applied.
    pub fn validate(&self) -> SyncResult<()> {
        if self.title.trim().is_empty() || self.description.trim().is_empty() {
            return Err(SyncError::Validation("title and description are required".into()));
        }
        match &self.image {
            Some(img) if !img.bytes.is_empty() => Ok(()),
            _ => Err(SyncError::Validation("an image is required".into())),
        }
    }
}

/// Locally created entry awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisional {
    pub token: CorrelationToken,
    pub title: String,
    pub description: String,
    pub image_name: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl Provisional {
    pub fn from_draft(token: CorrelationToken, draft: &Draft) -> Self {
        Self {
            token,
            title: draft.title.clone(),
            description: draft.description.clone(),
            image_name: draft.image.as_ref().map(|i| i.file_name.clone()),
            issued_at: Utc::now(),
        }
    }
}

/// One element of the view handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Entry {
    Confirmed(Record),
    Provisional(Provisional),
}

impl Entry {
    pub fn id(&self) -> Option<&RecordId> {
        match self { Entry::Confirmed(r) => Some(&r.id), Entry::Provisional(_) => None }
    }

    pub fn token(&self) -> Option<&CorrelationToken> {
        match self { Entry::Confirmed(_) => None, Entry::Provisional(p) => Some(&p.token) }
    }

    pub fn record(&self) -> Option<&Record> {
        match self { Entry::Confirmed(r) => Some(r), Entry::Provisional(_) => None }
    }

    pub fn title(&self) -> &str {
        match self { Entry::Confirmed(r) => &r.title, Entry::Provisional(p) => &p.title }
    }
}

/// Errors surfaced by the loader, the mutation calls and event decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("event: {0}")]
    EventApplication(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("closed: {0}")]
    Closed(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

pub mod prelude {
    pub use super::{
        CorrelationToken, Draft, Entry, ImageUpload, LiveEvent, Provisional, RawEvent, Record, RecordId, SyncError,
        SyncResult,
    };
}
