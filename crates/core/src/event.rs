//! Live event framing and decoding.

use serde::{Deserialize, Serialize};

use crate::{Record, RecordId, SyncError, SyncResult};

pub const EVENT_CREATED: &str = "object:created";
pub const EVENT_DELETED: &str = "object:deleted";

/// Frame as delivered by the event transport, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawEvent {
    pub fn created(record: &Record) -> Self {
        Self { event: EVENT_CREATED.into(), data: serde_json::to_value(record).unwrap_or_default() }
    }

    pub fn deleted(id: &RecordId) -> Self {
        Self { event: EVENT_DELETED.into(), data: serde_json::json!({ "id": id.as_str() }) }
    }
}

/// Validated incremental change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Insert(Record),
    Remove(RecordId),
}

impl LiveEvent {
    pub fn decode(raw: &RawEvent) -> SyncResult<Self> {
        match raw.event.as_str() {
            EVENT_CREATED => {
                let record: Record = serde_json::from_value(raw.data.clone())
                    .map_err(|e| SyncError::EventApplication(format!("{}: {}", EVENT_CREATED, e)))?;
                if record.id.as_str().is_empty() {
                    return Err(SyncError::EventApplication(format!("{}: empty id", EVENT_CREATED)));
                }
                Ok(LiveEvent::Insert(record))
            }
            EVENT_DELETED => {
                let id = match &raw.data {
                    serde_json::Value::String(s) => Some(s.as_str()),
                    serde_json::Value::Object(o) => o.get("id").or_else(|| o.get("_id")).and_then(|v| v.as_str()),
                    _ => None,
                };
                match id {
                    Some(id) if !id.is_empty() => Ok(LiveEvent::Remove(RecordId::new(id))),
                    _ => Err(SyncError::EventApplication(format!("{}: missing id", EVENT_DELETED))),
                }
            }
            other => Err(SyncError::EventApplication(format!("unknown event kind: {}", other))),
        }
    }

    pub fn id(&self) -> &RecordId {
        match self { LiveEvent::Insert(r) => &r.id, LiveEvent::Remove(id) => id }
    }
}
