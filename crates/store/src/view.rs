//! View state machine.
//!
//! Holds the ordered, id-unique view and every outstanding optimistic edit. The
//! actor in `lib.rs` is its only writer; everything here is synchronous so the
//! reconciliation rules can be exercised without a runtime.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use shelf_core::{CorrelationToken, Entry, LiveEvent, Provisional, Record, RecordId, SyncError};
use tracing::debug;

/// Lifecycle signal exposed next to the view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Status {
    #[default]
    Uninitialized,
    Loading,
    Ready,
    Refreshing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    Create { token: CorrelationToken },
    /// `restore` is set when the record was in the view at the time of the delete.
    Delete { id: RecordId, restore: Option<Restore> },
}

/// A record taken out by an optimistic delete, with enough context to put it
/// back between the same confirmed neighbours. `index` is only used once both
/// neighbours have left the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restore {
    pub record: Record,
    pub index: usize,
    pub after: Option<RecordId>,
    pub before: Option<RecordId>,
}

/// Optimistic edit not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub kind: PendingKind,
    pub issued_at: DateTime<Utc>,
}

impl PendingOp {
    fn new(kind: PendingKind) -> Self { Self { kind, issued_at: Utc::now() } }
}

/// Immutable copy of the view handed to readers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewSnapshot {
    pub epoch: u64,
    pub status: Status,
    pub entries: Vec<Entry>,
    pub pending: usize,
    /// Most recent action's error; cleared by the next successful action.
    pub last_error: Option<SyncError>,
}

impl ViewSnapshot {
    pub fn records(&self) -> impl Iterator<Item = &Record> { self.entries.iter().filter_map(Entry::record) }

    pub fn ids(&self) -> Vec<&str> { self.records().map(|r| r.id.as_str()).collect() }
}

#[derive(Debug, Default)]
pub struct ViewState {
    status: Status,
    seeded: bool,
    loading: bool,
    entries: Vec<Entry>,
    pending: Vec<PendingOp>,
    /// Events held before the first snapshot, or seen while a snapshot is in flight.
    journal: Vec<LiveEvent>,
    /// Ids removed this session. Ids are never reused, so these never come back.
    tombstones: FxHashSet<RecordId>,
    last_error: Option<SyncError>,
    epoch: u64,
}

impl ViewState {
    pub fn new() -> Self { Self::default() }

    pub fn status(&self) -> &Status { &self.status }
    pub fn is_seeded(&self) -> bool { self.seeded }
    pub fn is_loading(&self) -> bool { self.loading }
    pub fn entries(&self) -> &[Entry] { &self.entries }
    pub fn pending(&self) -> &[PendingOp] { &self.pending }
    pub fn last_error(&self) -> Option<&SyncError> { self.last_error.as_ref() }
    pub fn epoch(&self) -> u64 { self.epoch }

    /// Events waiting for the first snapshot.
    pub fn buffered(&self) -> usize { if self.seeded { 0 } else { self.journal.len() } }

    pub fn freeze(&self) -> Arc<ViewSnapshot> {
        Arc::new(ViewSnapshot {
            epoch: self.epoch,
            status: self.status.clone(),
            entries: self.entries.clone(),
            pending: self.pending.len(),
            last_error: self.last_error.clone(),
        })
    }

    fn touch(&mut self) { self.epoch = self.epoch.saturating_add(1); }

    fn position(&self, id: &RecordId) -> Option<usize> { self.entries.iter().position(|e| e.id() == Some(id)) }

    fn provisional_position(&self, token: &CorrelationToken) -> Option<usize> {
        self.entries.iter().position(|e| e.token() == Some(token))
    }

    fn has_pending_delete(&self, id: &RecordId) -> bool {
        self.pending.iter().any(|op| matches!(&op.kind, PendingKind::Delete { id: d, .. } if d == id))
    }

    fn take_pending_create(&mut self, token: &CorrelationToken) -> bool {
        let idx = self.pending.iter().position(|op| matches!(&op.kind, PendingKind::Create { token: t } if t == token));
        idx.map(|i| self.pending.remove(i)).is_some()
    }

    fn take_pending_delete(&mut self, id: &RecordId) -> Option<PendingOp> {
        let idx = self.pending.iter().position(|op| matches!(&op.kind, PendingKind::Delete { id: d, .. } if d == id))?;
        Some(self.pending.remove(idx))
    }

    /// Remove the confirmed entry at `idx`, remembering its neighbours.
    fn detach(&mut self, idx: usize) -> Option<Restore> {
        let after = self.entries[..idx].iter().rev().find_map(Entry::id).cloned();
        let before = self.entries[idx + 1..].iter().find_map(Entry::id).cloned();
        match self.entries.remove(idx) {
            Entry::Confirmed(record) => Some(Restore { record, index: idx, after, before }),
            Entry::Provisional(_) => None,
        }
    }

    fn restore_position(&self, restore: &Restore) -> usize {
        if let Some(idx) = restore.after.as_ref().and_then(|id| self.position(id)) {
            return idx + 1;
        }
        if let Some(idx) = restore.before.as_ref().and_then(|id| self.position(id)) {
            return idx;
        }
        restore.index.min(self.entries.len())
    }

    /// Drop a provisional entry and its pending create. Returns whether one existed.
    fn settle_provisional(&mut self, token: &CorrelationToken) -> bool {
        let had_pending = self.take_pending_create(token);
        match self.provisional_position(token) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => had_pending,
        }
    }

    pub fn record_error(&mut self, err: SyncError) {
        self.last_error = Some(err);
        self.touch();
    }

    // ---- snapshot lifecycle ----

    /// Enter `Loading` (never seeded) or `Refreshing`. Returns false when a load is
    /// already in flight; the caller joins it instead.
    pub fn begin_load(&mut self) -> bool {
        if self.loading {
            return false;
        }
        self.loading = true;
        if self.seeded {
            self.journal.clear();
            self.status = Status::Refreshing;
        } else {
            self.status = Status::Loading;
        }
        self.touch();
        true
    }

    /// Replace the view with `snapshot`, merged with outstanding edits and with
    /// the journal replayed on top. Returns how many journaled events were replayed.
    pub fn finish_load(&mut self, snapshot: Vec<Record>) -> usize {
        self.loading = false;
        let journal = std::mem::take(&mut self.journal);

        // Creates the server already reflects are settled by the snapshot itself.
        let reflected: FxHashSet<CorrelationToken> = snapshot.iter().filter_map(|r| r.correlation.clone()).collect();
        self.pending.retain(|op| !matches!(&op.kind, PendingKind::Create { token } if reflected.contains(token)));
        let open: FxHashSet<CorrelationToken> = self
            .pending
            .iter()
            .filter_map(|op| match &op.kind {
                PendingKind::Create { token } => Some(token.clone()),
                PendingKind::Delete { .. } => None,
            })
            .collect();

        // Unsettled provisionals stay on top, in their current order.
        let mut entries: Vec<Entry> = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|e| e.token().is_some_and(|t| open.contains(t)))
            .collect();
        let mut seen = FxHashSet::default();
        for record in snapshot {
            if self.tombstones.contains(&record.id) {
                debug!(id = %record.id, "view: snapshot predates removal; skipping");
            } else if seen.insert(record.id.clone()) {
                entries.push(Entry::Confirmed(record));
            } else {
                debug!(id = %record.id, "view: duplicate id in snapshot; keeping first");
            }
        }
        self.entries = entries;

        let replayed = journal.len();
        for ev in journal {
            self.apply_now(ev);
        }

        // Pending deletes: re-apply over the fresh snapshot, or drop as satisfied.
        let pending = std::mem::take(&mut self.pending);
        for mut op in pending {
            if let PendingKind::Delete { id, restore } = &mut op.kind {
                match self.position(id) {
                    Some(idx) => *restore = self.detach(idx),
                    None => {
                        debug!(id = %id, "view: pending delete already satisfied by snapshot");
                        self.tombstones.insert(id.clone());
                        continue;
                    }
                }
            }
            self.pending.push(op);
        }

        self.seeded = true;
        self.status = Status::Ready;
        self.last_error = None;
        self.touch();
        replayed
    }

    /// Snapshot request failed: the current view stays as it is.
    pub fn fail_load(&mut self, err: SyncError) {
        self.loading = false;
        if self.seeded {
            self.journal.clear();
        }
        self.status = Status::Failed(err.to_string());
        self.last_error = Some(err);
        self.touch();
    }

    // ---- live events ----

    /// Apply one live event, or hold it until the first snapshot arrives.
    /// Returns whether the view changed.
    pub fn apply_event(&mut self, ev: LiveEvent) -> bool {
        if !self.seeded {
            self.journal.push(ev);
            debug!(buffered = self.journal.len(), "view: event held until first snapshot");
            return false;
        }
        if self.loading {
            self.journal.push(ev.clone());
        }
        self.apply_now(ev)
    }

    fn apply_now(&mut self, ev: LiveEvent) -> bool {
        match ev {
            LiveEvent::Insert(r) => self.apply_insert(r),
            LiveEvent::Remove(id) => self.apply_remove(&id),
        }
    }

    /// Prepend `record` unless its id is already known. A record carrying the
    /// token of a provisional entry takes that entry's place instead.
    pub fn apply_insert(&mut self, record: Record) -> bool {
        let blocked = self.position(&record.id).is_some()
            || self.tombstones.contains(&record.id)
            || self.has_pending_delete(&record.id);
        if blocked {
            if let Some(token) = &record.correlation {
                if self.settle_provisional(token) {
                    self.touch();
                }
            }
            counter!("shelf_sync_duplicates_total", 1);
            debug!(id = %record.id, "view: insert ignored");
            return false;
        }
        if let Some(token) = record.correlation.clone() {
            if let Some(idx) = self.provisional_position(&token) {
                self.take_pending_create(&token);
                self.entries[idx] = Entry::Confirmed(record);
                self.touch();
                return true;
            }
        }
        self.entries.insert(0, Entry::Confirmed(record));
        self.touch();
        true
    }

    /// Excise `id` and clear any edit pending on it. Unknown ids leave the view alone.
    pub fn apply_remove(&mut self, id: &RecordId) -> bool {
        let settled = self.take_pending_delete(id).is_some();
        self.tombstones.insert(id.clone());
        match self.position(id) {
            Some(idx) => {
                self.entries.remove(idx);
                self.touch();
                true
            }
            None => {
                if settled {
                    self.touch();
                }
                false
            }
        }
    }

    // ---- optimistic edits ----

    pub fn begin_create(&mut self, provisional: Provisional) {
        let token = provisional.token.clone();
        self.entries.insert(0, Entry::Provisional(provisional));
        self.pending.push(PendingOp::new(PendingKind::Create { token }));
        self.touch();
    }

    /// Server accepted the create. Returns false when a live event settled it first.
    pub fn confirm_create(&mut self, token: &CorrelationToken, record: Record) -> bool {
        self.last_error = None;
        self.touch();
        if !self.take_pending_create(token) {
            debug!(token = %token, id = %record.id, "view: create already settled");
            return false;
        }
        // An in-flight snapshot may predate the create.
        if self.loading || !self.seeded {
            self.journal.push(LiveEvent::Insert(record.clone()));
        }
        if let Some(idx) = self.provisional_position(token) {
            if self.position(&record.id).is_some() || self.tombstones.contains(&record.id) {
                self.entries.remove(idx);
            } else {
                self.entries[idx] = Entry::Confirmed(record);
            }
        }
        true
    }

    pub fn fail_create(&mut self, token: &CorrelationToken, err: SyncError) {
        if self.settle_provisional(token) {
            counter!("shelf_sync_rollbacks_total", 1);
        }
        self.record_error(err);
    }

    /// Remove `id` from the view now. Returns false if a delete for it is already pending.
    pub fn begin_delete(&mut self, id: &RecordId) -> bool {
        if self.has_pending_delete(id) {
            return false;
        }
        let restore = self.position(id).and_then(|idx| self.detach(idx));
        self.pending.push(PendingOp::new(PendingKind::Delete { id: id.clone(), restore }));
        self.touch();
        true
    }

    /// The tombstone keeps an in-flight snapshot from seeding the record back.
    pub fn confirm_delete(&mut self, id: &RecordId) {
        self.take_pending_delete(id);
        self.tombstones.insert(id.clone());
        self.last_error = None;
        self.touch();
    }

    /// Server rejected the delete: put the record back between its old neighbours.
    pub fn fail_delete(&mut self, id: &RecordId, err: SyncError) {
        if let Some(PendingKind::Delete { restore: Some(restore), .. }) = self.take_pending_delete(id).map(|op| op.kind) {
            let blocked = self.position(&restore.record.id).is_some() || self.tombstones.contains(&restore.record.id);
            if !blocked {
                let at = self.restore_position(&restore);
                self.entries.insert(at, Entry::Confirmed(restore.record));
                counter!("shelf_sync_rollbacks_total", 1);
            }
        }
        self.record_error(err);
    }
}
