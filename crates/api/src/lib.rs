//! Shelf REST façade.
//!
//! Frontends and the synchronizer depend on the traits here; `HttpApi` talks to the
//! objects server, `MockApi` simulates one in memory for tests.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use metrics::{counter, histogram};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use shelf_core::{CorrelationToken, Draft, Record, RecordId, SyncError, SyncResult};
use tokio::sync::watch;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Fetches the complete current collection. Never cached: every call hits the server.
#[async_trait::async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn load(&self) -> SyncResult<Vec<Record>>;
}

/// Full record surface used by the synchronizer and the CLI.
#[async_trait::async_trait]
pub trait ShelfApi: SnapshotLoader {
    async fn get(&self, id: &RecordId) -> SyncResult<Record>;

    /// Upload a new record. `token` is echoed back by the server as `clientToken`.
    async fn create(&self, draft: &Draft, token: &CorrelationToken) -> SyncResult<Record>;

    async fn delete(&self, id: &RecordId) -> SyncResult<()>;
}

// ----------------- HTTP implementation -----------------

/// Whether a rejected request was a read or a mutation; decides how a 4xx maps.
#[derive(Clone, Copy)]
enum Call {
    Read,
    Mutation,
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client: reqwest::Client::new(), base_url }
    }

    /// Base URL from `SHELF_API_URL`, defaulting to the local dev server.
    pub fn from_env() -> Self {
        Self::new(std::env::var("SHELF_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()))
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    fn url(&self, path: &str) -> String { format!("{}{}", self.base_url, path) }

    fn transport(e: reqwest::Error) -> SyncError { SyncError::Transport(e.to_string()) }

    /// Read the body as text and apply the status rules. `Ok(None)` means no content.
    async fn body(res: reqwest::Response, call: Call) -> SyncResult<Option<String>> {
        let status = res.status();
        let text = res.text().await.map_err(Self::transport)?;
        if !status.is_success() {
            let msg = if text.trim().is_empty() { format!("HTTP {}", status.as_u16()) } else { text };
            return Err(match call {
                Call::Mutation if status.is_client_error() => SyncError::Conflict(msg),
                _ => SyncError::Transport(msg),
            });
        }
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    fn decode<T: DeserializeOwned>(text: Option<String>) -> SyncResult<T> {
        let text = text.ok_or_else(|| SyncError::Decode("empty response body".into()))?;
        serde_json::from_str(&text).map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SnapshotLoader for HttpApi {
    async fn load(&self) -> SyncResult<Vec<Record>> {
        let t0 = Instant::now();
        info!(url = %self.base_url, "api: list start");
        let res = self.client.get(self.url("/objects")).send().await.map_err(Self::transport)?;
        let records: Vec<Record> = Self::decode(Self::body(res, Call::Read).await?)?;
        histogram!("shelf_api_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(count = records.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(records)
    }
}

#[async_trait::async_trait]
impl ShelfApi for HttpApi {
    async fn get(&self, id: &RecordId) -> SyncResult<Record> {
        let t0 = Instant::now();
        let res = self.client.get(self.url(&format!("/objects/{}", id))).send().await.map_err(Self::transport)?;
        let record = Self::decode(Self::body(res, Call::Read).await?)?;
        debug!(id = %id, took_ms = %t0.elapsed().as_millis(), "api: get ok");
        Ok(record)
    }

    async fn create(&self, draft: &Draft, token: &CorrelationToken) -> SyncResult<Record> {
        let t0 = Instant::now();
        let image = draft.image.as_ref().ok_or_else(|| SyncError::Validation("an image is required".into()))?;
        info!(title = %draft.title, file = %image.file_name, bytes = image.bytes.len(), token = %token, "api: create start");
        let part = reqwest::multipart::Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.mime_type)
            .map_err(|e| SyncError::Validation(format!("mime type {}: {}", image.mime_type, e)))?;
        let form = reqwest::multipart::Form::new()
            .text("title", draft.title.clone())
            .text("description", draft.description.clone())
            .text("clientToken", token.to_string())
            .part("image", part);
        let res = self.client.post(self.url("/objects")).multipart(form).send().await.map_err(Self::transport)?;
        let mut record: Record = Self::decode(Self::body(res, Call::Mutation).await?)?;
        if record.correlation.is_none() {
            record.correlation = Some(token.clone());
        }
        counter!("shelf_api_created_total", 1);
        info!(id = %record.id, took_ms = %t0.elapsed().as_millis(), "api: create ok");
        Ok(record)
    }

    async fn delete(&self, id: &RecordId) -> SyncResult<()> {
        let t0 = Instant::now();
        let res = self.client.delete(self.url(&format!("/objects/{}", id))).send().await.map_err(Self::transport)?;
        Self::body(res, Call::Mutation).await?;
        counter!("shelf_api_deleted_total", 1);
        info!(id = %id, took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(())
    }
}

// ----------------- Mock implementation -----------------

#[derive(Default)]
struct MockState {
    /// Server truth, newest first.
    records: Vec<Record>,
    next_id: u64,
    load_failures: VecDeque<SyncError>,
    create_failures: VecDeque<SyncError>,
    delete_failures: VecDeque<SyncError>,
    loads: usize,
}

/// In-memory objects server for tests. Calls can be held with [`MockApi::pause`]
/// to observe optimistic state while a request is in flight.
pub struct MockApi {
    state: Mutex<MockState>,
    paused: watch::Sender<bool>,
}

impl Default for MockApi {
    fn default() -> Self {
        let (paused, _) = watch::channel(false);
        Self { state: Mutex::new(MockState::default()), paused }
    }
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_records(records: Vec<Record>) -> Self {
        let me = Self::default();
        me.set_records(records);
        me
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_records(&self, records: Vec<Record>) { self.state().records = records; }
    pub fn records(&self) -> Vec<Record> { self.state().records.clone() }
    pub fn load_calls(&self) -> usize { self.state().loads }

    pub fn fail_next_load(&self, err: SyncError) { self.state().load_failures.push_back(err); }
    pub fn fail_next_create(&self, err: SyncError) { self.state().create_failures.push_back(err); }
    pub fn fail_next_delete(&self, err: SyncError) { self.state().delete_failures.push_back(err); }

    /// Hold every subsequent call until [`MockApi::resume`].
    pub fn pause(&self) { self.paused.send_replace(true); }
    pub fn resume(&self) { self.paused.send_replace(false); }

    async fn gate(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

#[async_trait::async_trait]
impl SnapshotLoader for MockApi {
    async fn load(&self) -> SyncResult<Vec<Record>> {
        self.gate().await;
        let mut st = self.state();
        st.loads += 1;
        if let Some(e) = st.load_failures.pop_front() {
            return Err(e);
        }
        Ok(st.records.clone())
    }
}

#[async_trait::async_trait]
impl ShelfApi for MockApi {
    async fn get(&self, id: &RecordId) -> SyncResult<Record> {
        self.gate().await;
        self.state()
            .records
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| SyncError::Transport("HTTP 404".into()))
    }

    async fn create(&self, draft: &Draft, token: &CorrelationToken) -> SyncResult<Record> {
        self.gate().await;
        let mut st = self.state();
        if let Some(e) = st.create_failures.pop_front() {
            return Err(e);
        }
        st.next_id += 1;
        let record = Record {
            id: RecordId::new(format!("obj-{}", st.next_id)),
            title: draft.title.clone(),
            description: draft.description.clone(),
            image_url: format!(
                "mock://images/{}",
                draft.image.as_ref().map(|i| i.file_name.as_str()).unwrap_or("image.jpg")
            ),
            created_at: chrono::Utc::now(),
            correlation: Some(token.clone()),
        };
        st.records.insert(0, record.clone());
        Ok(record)
    }

    async fn delete(&self, id: &RecordId) -> SyncResult<()> {
        self.gate().await;
        let mut st = self.state();
        if let Some(e) = st.delete_failures.pop_front() {
            return Err(e);
        }
        let before = st.records.len();
        st.records.retain(|r| &r.id != id);
        if st.records.len() == before {
            return Err(SyncError::Conflict(format!("{} already deleted", id)));
        }
        Ok(())
    }
}
