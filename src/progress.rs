//! Progress aggregation
//!
//! Transfer units and episode tasks report through a cheap, cloneable
//! [`ProgressSender`]. A single actor task owns the aggregate and publishes
//! [`ProgressSnapshot`]s over a `watch` channel, so readers never contend
//! with producers and producers never wait on readers.
//!
//! Two lanes feed the actor:
//! - byte updates go through a bounded channel with `try_send`; when the
//!   actor falls behind they are dropped, which is harmless because every
//!   update carries absolute counters and the next one supersedes it
//! - status transitions (stream completed/failed, episode state changes)
//!   go through an unbounded lane and are never lost

use crate::types::{EpisodeId, EpisodeState, Event, ProgressEvent, StreamKind, TransferStatus};
use crate::utils::format_bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Buffer size for the byte-update lane
pub(crate) const UPDATE_CHANNEL_BUFFER: usize = 256;

/// Minimum spacing between snapshot publications caused by byte updates
const PUBLISH_INTERVAL: Duration = Duration::from_millis(200);

/// Window the transfer speed is averaged over
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Per-stream view inside a snapshot
#[derive(Clone, Debug, Serialize)]
pub struct StreamProgress {
    /// Stream kind
    pub kind: StreamKind,
    /// Bytes on disk
    pub bytes_fetched: u64,
    /// Total size if known
    pub total_bytes: Option<u64>,
    /// Transfer status
    pub status: TransferStatus,
}

/// Per-episode view inside a snapshot
#[derive(Clone, Debug, Serialize)]
pub struct EpisodeProgress {
    /// Lifecycle state
    pub state: EpisodeState,
    /// Streams keyed by their index in the descriptor
    pub streams: BTreeMap<usize, StreamProgress>,
}

impl EpisodeProgress {
    fn new(state: EpisodeState) -> Self {
        Self {
            state,
            streams: BTreeMap::new(),
        }
    }
}

/// Aggregate progress of a run
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProgressSnapshot {
    /// Per-episode detail
    pub episodes: BTreeMap<EpisodeId, EpisodeProgress>,
    /// Bytes on disk across all streams
    pub bytes_fetched: u64,
    /// Sum of known stream sizes
    pub bytes_total: u64,
    /// Bytes received over the network since the reporter started
    pub bytes_transferred: u64,
    /// Network speed averaged over the last few seconds
    pub speed_bps: u64,
    /// Byte updates dropped because the reporter was behind
    pub dropped_updates: u64,
}

impl ProgressSnapshot {
    /// Number of episodes currently in `state`
    pub fn count(&self, state: EpisodeState) -> usize {
        self.episodes.values().filter(|e| e.state == state).count()
    }

    /// One-line human-readable summary
    pub fn summary_line(&self) -> String {
        format!(
            "{} running, {} queued, {} done, {} failed, {} skipped, {} cancelled | {} / {} @ {}/s",
            self.count(EpisodeState::Running),
            self.count(EpisodeState::Queued),
            self.count(EpisodeState::Succeeded),
            self.count(EpisodeState::Failed),
            self.count(EpisodeState::Skipped),
            self.count(EpisodeState::Cancelled),
            format_bytes(self.bytes_fetched),
            format_bytes(self.bytes_total),
            format_bytes(self.speed_bps),
        )
    }
}

enum StatusMessage {
    Stream(ProgressEvent),
    Episode { id: EpisodeId, state: EpisodeState },
    Flush(oneshot::Sender<()>),
}

/// Producer side of the reporter; cloning is cheap
#[derive(Clone)]
pub struct ProgressSender {
    updates: mpsc::Sender<ProgressEvent>,
    status: mpsc::UnboundedSender<StatusMessage>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSender {
    /// Report bytes for an in-flight stream; never waits, may be dropped
    pub fn update(&self, event: ProgressEvent) {
        if self.updates.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Report a stream status transition; never waits, never dropped
    pub fn stream_status(&self, event: ProgressEvent) {
        self.status.send(StatusMessage::Stream(event)).ok();
    }

    /// Report an episode state transition
    pub fn episode_state(&self, id: &EpisodeId, state: EpisodeState) {
        self.status
            .send(StatusMessage::Episode {
                id: id.clone(),
                state,
            })
            .ok();
    }

    /// A sender whose reports go nowhere (for callers that do not need progress)
    pub fn disconnected() -> Self {
        let (updates, _) = mpsc::channel(1);
        let (status, _) = mpsc::unbounded_channel();
        Self {
            updates,
            status,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Handle to a running reporter
pub struct ProgressReporter {
    sender: ProgressSender,
    snapshot_rx: watch::Receiver<ProgressSnapshot>,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    /// Spawn the aggregation actor
    ///
    /// Accepted progress events are re-broadcast on `event_tx` as
    /// [`Event::StreamProgress`]. Must be called from within a Tokio runtime.
    pub fn spawn(event_tx: broadcast::Sender<Event>) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_BUFFER);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ProgressSnapshot::default());
        let dropped = Arc::new(AtomicU64::new(0));

        let actor = Aggregator {
            snapshot: ProgressSnapshot::default(),
            last_seen: HashMap::new(),
            samples: VecDeque::new(),
            dropped: dropped.clone(),
            snapshot_tx,
            event_tx,
        };
        let task = tokio::spawn(actor.run(updates_rx, status_rx));

        Self {
            sender: ProgressSender {
                updates: updates_tx,
                status: status_tx,
                dropped,
            },
            snapshot_rx,
            task,
        }
    }

    /// A new producer handle
    pub fn sender(&self) -> ProgressSender {
        self.sender.clone()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that is notified on every publication
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until everything sent before this call is reflected in the snapshot
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.status.send(StatusMessage::Flush(tx)).is_ok() {
            rx.await.ok();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Aggregator {
    snapshot: ProgressSnapshot,
    /// Last bytes_fetched per stream, for network deltas
    last_seen: HashMap<(EpisodeId, usize), u64>,
    /// (time, cumulative bytes transferred) samples inside the speed window
    samples: VecDeque<(Instant, u64)>,
    dropped: Arc<AtomicU64>,
    snapshot_tx: watch::Sender<ProgressSnapshot>,
    event_tx: broadcast::Sender<Event>,
}

impl Aggregator {
    async fn run(
        mut self,
        mut updates_rx: mpsc::Receiver<ProgressEvent>,
        mut status_rx: mpsc::UnboundedReceiver<StatusMessage>,
    ) {
        let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut dirty = false;
        let mut updates_open = true;

        loop {
            tokio::select! {
                biased;
                msg = status_rx.recv() => {
                    let Some(msg) = msg else {
                        // Every sender is gone
                        break;
                    };
                    match msg {
                        StatusMessage::Stream(event) => self.apply(event),
                        StatusMessage::Episode { id, state } => self.set_episode_state(id, state),
                        StatusMessage::Flush(done) => {
                            while let Ok(event) = updates_rx.try_recv() {
                                self.apply_update(event);
                            }
                            self.publish();
                            done.send(()).ok();
                            continue;
                        }
                    }
                    self.publish();
                    dirty = false;
                }
                event = updates_rx.recv(), if updates_open => {
                    match event {
                        Some(event) => {
                            self.apply_update(event);
                            dirty = true;
                        }
                        None => updates_open = false,
                    }
                }
                _ = interval.tick() => {
                    if dirty {
                        self.publish();
                        dirty = false;
                    }
                }
            }
        }

        self.publish();
    }

    fn set_episode_state(&mut self, id: EpisodeId, state: EpisodeState) {
        self.snapshot
            .episodes
            .entry(id)
            .and_modify(|e| e.state = state)
            .or_insert_with(|| EpisodeProgress::new(state));
    }

    /// Apply a byte update unless a status transition already superseded it
    ///
    /// The two lanes are not ordered against each other, so an update can
    /// arrive after the stream completed or paused, or behind a newer one.
    fn apply_update(&mut self, event: ProgressEvent) {
        let key = (event.episode_id.clone(), event.stream_index);
        let status = self
            .snapshot
            .episodes
            .get(&event.episode_id)
            .and_then(|e| e.streams.get(&event.stream_index))
            .map(|s| s.status);
        let stale = match (status, self.last_seen.get(&key)) {
            (Some(status), Some(&seen)) => {
                status != TransferStatus::InProgress || event.bytes_fetched < seen
            }
            _ => false,
        };
        if !stale {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        let key = (event.episode_id.clone(), event.stream_index);
        match self.last_seen.insert(key, event.bytes_fetched) {
            // First sighting: bytes already on disk were not transferred now
            None => {}
            Some(previous) if event.bytes_fetched > previous => {
                self.snapshot.bytes_transferred += event.bytes_fetched - previous;
            }
            Some(_) => {}
        }

        let episode = self
            .snapshot
            .episodes
            .entry(event.episode_id.clone())
            .or_insert_with(|| EpisodeProgress::new(EpisodeState::Running));
        episode.streams.insert(
            event.stream_index,
            StreamProgress {
                kind: event.stream_kind,
                bytes_fetched: event.bytes_fetched,
                total_bytes: event.total_bytes,
                status: event.status,
            },
        );

        self.event_tx.send(Event::StreamProgress(event)).ok();
    }

    fn publish(&mut self) {
        let (fetched, total) = self
            .snapshot
            .episodes
            .values()
            .flat_map(|e| e.streams.values())
            .fold((0u64, 0u64), |(fetched, total), s| {
                (fetched + s.bytes_fetched, total + s.total_bytes.unwrap_or(0))
            });
        self.snapshot.bytes_fetched = fetched;
        self.snapshot.bytes_total = total;
        self.snapshot.dropped_updates = self.dropped.load(Ordering::Relaxed);

        let now = Instant::now();
        self.samples.push_back((now, self.snapshot.bytes_transferred));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > SPEED_WINDOW && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.snapshot.speed_bps = match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, b0)), Some(&(t1, b1))) if t1 > t0 => {
                ((b1 - b0) as f64 / t1.duration_since(t0).as_secs_f64()) as u64
            }
            _ => 0,
        };

        self.snapshot_tx.send_replace(self.snapshot.clone());
    }
}

/// Spawn a background task that logs the aggregate on an interval
///
/// Stops when `cancel` fires or the reporter goes away.
pub fn spawn_log_renderer(
    mut snapshots: watch::Receiver<ProgressSnapshot>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let line = snapshots.borrow_and_update().summary_line();
                    tracing::info!(target: "episode_dl::progress", "{}", line);
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
