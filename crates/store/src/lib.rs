//! Shelf store: the synchronizer.
//!
//! A single actor task owns the [`ViewState`]. Commands from [`SyncHandle`],
//! results of in-flight requests and live events from the hub all funnel into
//! its loop, so every mutation is serialized. Readers get immutable snapshots via
//! `ArcSwap` and an epoch counter on a `watch` channel.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, gauge, histogram};
use shelf_api::{ShelfApi, SnapshotLoader};
use shelf_core::{CorrelationToken, Draft, LiveEvent, Provisional, Record, RecordId, SyncError, SyncResult};
use shelf_hub::{EventHub, SourceMessage, Subscription};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub mod view;

pub use view::{PendingKind, PendingOp, Restore, Status, ViewSnapshot, ViewState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Capacity of the command queue between handles and the actor.
    pub queue_cap: usize,
    /// Start a refresh when the event source reports a reconnect.
    pub resync_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self { Self { queue_cap: 256, resync_on_reconnect: true } }
}

impl SyncConfig {
    /// `SHELF_QUEUE_CAP`, `SHELF_RESYNC_ON_RECONNECT`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let queue_cap = std::env::var("SHELF_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(d.queue_cap);
        let resync_on_reconnect = std::env::var("SHELF_RESYNC_ON_RECONNECT")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(d.resync_on_reconnect);
        Self { queue_cap, resync_on_reconnect }
    }
}

enum Command {
    Load(oneshot::Sender<SyncResult<()>>),
    Create(Draft, oneshot::Sender<SyncResult<Record>>),
    Delete(RecordId, oneshot::Sender<SyncResult<()>>),
    Shutdown,
}

/// Results of requests spawned by the actor, fed back into its loop.
enum Done {
    Loaded(SyncResult<Vec<Record>>, Instant),
    Created(CorrelationToken, SyncResult<Record>, oneshot::Sender<SyncResult<Record>>),
    Deleted(RecordId, SyncResult<()>, oneshot::Sender<SyncResult<()>>),
}

fn closed() -> SyncError { SyncError::Closed("synchronizer stopped".into()) }

/// Handle for readers and for the action entry points. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    snap: Arc<ArcSwap<ViewSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SyncHandle {
    pub fn current(&self) -> Arc<ViewSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// First load, or a non-destructive refresh once seeded. Joins a load already in flight.
    pub async fn load(&self) -> SyncResult<()> { self.request(Command::Load).await }

    pub async fn refresh(&self) -> SyncResult<()> { self.load().await }

    /// The provisional entry is visible before the request is sent.
    pub async fn create(&self, draft: Draft) -> SyncResult<Record> { self.request(|tx| Command::Create(draft, tx)).await }

    /// The record leaves the view before the request is sent.
    pub async fn delete(&self, id: RecordId) -> SyncResult<()> { self.request(|tx| Command::Delete(id, tx)).await }

    /// Stop the actor and unsubscribe from the hub. Results still in flight are discarded.
    pub async fn teardown(&self) { let _ = self.cmd_tx.send(Command::Shutdown).await; }

    pub fn is_closed(&self) -> bool { self.cmd_tx.is_closed() }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

/// Spawn the synchronizer. The hub subscription is registered before this returns,
/// so events published from now on are held until the first snapshot.
pub fn spawn_sync(api: Arc<dyn ShelfApi>, hub: &EventHub, cfg: SyncConfig) -> SyncHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(cfg.queue_cap.max(1));
    let (done_tx, done_rx) = mpsc::unbounded_channel::<Done>();
    let snap = Arc::new(ArcSwap::from_pointee(ViewSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let sub = hub.subscribe();

    let actor = Actor {
        api,
        cfg,
        state: ViewState::new(),
        snap: Arc::clone(&snap),
        epoch_tx,
        published: 0,
        alive: Arc::new(AtomicBool::new(true)),
        done_tx,
        load_waiters: Vec::new(),
    };
    tokio::spawn(actor.run(cmd_rx, done_rx, sub));

    SyncHandle { cmd_tx, snap, epoch_rx }
}

struct Actor {
    api: Arc<dyn ShelfApi>,
    cfg: SyncConfig,
    state: ViewState,
    snap: Arc<ArcSwap<ViewSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    published: u64,
    /// Cleared on teardown; spawned requests check it before reporting back.
    alive: Arc<AtomicBool>,
    done_tx: mpsc::UnboundedSender<Done>,
    load_waiters: Vec<oneshot::Sender<SyncResult<()>>>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<Done>,
        mut sub: Subscription,
    ) {
        let mut source_open = true;
        loop {
            tokio::select! {
                maybe = cmd_rx.recv() => match maybe {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(done) = done_rx.recv() => self.on_done(done),
                msg = sub.recv(), if source_open => match msg {
                    Some(msg) => self.on_source(msg),
                    None => {
                        warn!("sync: event source closed");
                        source_open = false;
                    }
                },
            }
            self.publish();
        }
        self.alive.store(false, Ordering::Release);
        sub.cancel();
        for waiter in self.load_waiters.drain(..) {
            let _ = waiter.send(Err(closed()));
        }
        info!("sync loop stopped");
    }

    fn publish(&mut self) {
        let epoch = self.state.epoch();
        if epoch == self.published {
            return;
        }
        self.published = epoch;
        let next = self.state.freeze();
        gauge!("shelf_view_len", next.entries.len() as f64);
        self.snap.store(next);
        self.epoch_tx.send_replace(epoch);
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Load(reply) => {
                self.load_waiters.push(reply);
                self.start_load();
            }
            Command::Create(draft, reply) => {
                if let Err(e) = draft.validate() {
                    self.state.record_error(e.clone());
                    self.publish();
                    let _ = reply.send(Err(e));
                    return;
                }
                let token = CorrelationToken::generate();
                debug!(token = %token, title = %draft.title, "sync: optimistic create");
                self.state.begin_create(Provisional::from_draft(token.clone(), &draft));
                self.publish();
                let api = Arc::clone(&self.api);
                let done = self.done_tx.clone();
                let alive = Arc::clone(&self.alive);
                tokio::spawn(async move {
                    let res = api.create(&draft, &token).await;
                    report(&alive, &done, Done::Created(token, res, reply));
                });
            }
            Command::Delete(id, reply) => {
                if !self.state.begin_delete(&id) {
                    let err = SyncError::Conflict(format!("delete of {} already in flight", id));
                    self.state.record_error(err.clone());
                    self.publish();
                    let _ = reply.send(Err(err));
                    return;
                }
                debug!(id = %id, "sync: optimistic delete");
                self.publish();
                let api = Arc::clone(&self.api);
                let done = self.done_tx.clone();
                let alive = Arc::clone(&self.alive);
                tokio::spawn(async move {
                    let res = api.delete(&id).await;
                    report(&alive, &done, Done::Deleted(id, res, reply));
                });
            }
            Command::Shutdown => {}
        }
    }

    fn start_load(&mut self) {
        if !self.state.begin_load() {
            debug!("sync: load already in flight; joining");
            return;
        }
        info!(refresh = self.state.is_seeded(), "sync: snapshot requested");
        let api = Arc::clone(&self.api);
        let done = self.done_tx.clone();
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            let t0 = Instant::now();
            let res = api.load().await;
            report(&alive, &done, Done::Loaded(res, t0));
        });
    }

    /// State is published before any reply goes out, so a caller that awaited an
    /// action always reads a view that already reflects it.
    fn on_done(&mut self, done: Done) {
        match done {
            Done::Loaded(res, t0) => {
                let outcome = match res {
                    Ok(records) => {
                        let count = records.len();
                        let replayed = self.state.finish_load(records);
                        histogram!("shelf_sync_load_ms", t0.elapsed().as_secs_f64() * 1000.0);
                        info!(count, replayed, pending = self.state.pending().len(), took_ms = %t0.elapsed().as_millis(), "sync: snapshot applied");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "sync: snapshot failed; keeping current view");
                        self.state.fail_load(e.clone());
                        Err(e)
                    }
                };
                self.publish();
                for waiter in self.load_waiters.drain(..) {
                    let _ = waiter.send(outcome.clone());
                }
            }
            Done::Created(token, res, reply) => {
                match &res {
                    Ok(record) => {
                        info!(id = %record.id, token = %token, "sync: create confirmed");
                        self.state.confirm_create(&token, record.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, token = %token, "sync: create rejected; rolling back");
                        self.state.fail_create(&token, e.clone());
                    }
                }
                self.publish();
                let _ = reply.send(res);
            }
            Done::Deleted(id, res, reply) => {
                match &res {
                    Ok(()) => {
                        info!(id = %id, "sync: delete confirmed");
                        self.state.confirm_delete(&id);
                    }
                    Err(e) => {
                        warn!(error = %e, id = %id, "sync: delete rejected; rolling back");
                        self.state.fail_delete(&id, e.clone());
                    }
                }
                self.publish();
                let _ = reply.send(res);
            }
        }
    }

    fn on_source(&mut self, msg: SourceMessage) {
        match msg {
            SourceMessage::Event(raw) => match LiveEvent::decode(&raw) {
                Ok(ev) => {
                    let id = ev.id().clone();
                    if self.state.apply_event(ev) {
                        counter!("shelf_sync_events_applied_total", 1);
                    } else {
                        debug!(id = %id, buffered = self.state.buffered(), "sync: event left view unchanged");
                    }
                }
                Err(e) => {
                    counter!("shelf_sync_events_dropped_total", 1);
                    warn!(error = %e, event = %raw.event, "sync: dropping malformed live event");
                }
            },
            SourceMessage::Reconnected => {
                info!(seeded = self.state.is_seeded(), "sync: event source reconnected");
                if self.cfg.resync_on_reconnect && self.state.is_seeded() {
                    self.start_load();
                }
            }
        }
    }
}

/// Hand a finished request back to the actor unless it has been torn down.
fn report(alive: &AtomicBool, done: &mpsc::UnboundedSender<Done>, result: Done) {
    if !alive.load(Ordering::Acquire) || done.send(result).is_err() {
        debug!("sync: discarding result for a torn-down view");
    }
}
