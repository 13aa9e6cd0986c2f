//! Episode scheduler
//!
//! The [`Scheduler`] takes an ordered list of resolved episodes and runs
//! them with at most `max_concurrent_episodes` in flight. Each episode
//! becomes an [`EpisodeTask`] on a [`JoinSet`]; as one finishes the next
//! queued episode takes its slot.
//!
//! Episode failures are collected, never re-raised: one broken episode does
//! not stop the others. Cancelling the scheduler (or a run-fatal condition
//! such as a full disk) stops in-flight episodes cooperatively and resolves
//! every episode still in the queue as `Cancelled` without touching the
//! network.

use crate::config::Config;
use crate::episode::{Components, EpisodeTask, Notifier, StreamAssembler, TaskReport};
use crate::error::{Error, Result};
use crate::progress::{ProgressReporter, ProgressSnapshot};
use crate::types::{EpisodeDescriptor, EpisodeId, EpisodeResult, EpisodeState, Event};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Runs batches of episodes under the configured concurrency limits
pub struct Scheduler {
    config: Arc<Config>,
    components: Components,
    event_tx: broadcast::Sender<Event>,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler with the production components
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let components = Components::from_config(&config)?;
        Self::with_components(config, components)
    }

    /// Create a scheduler with custom fetcher, muxer or converter
    pub fn with_components(config: Config, components: Components) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let progress = ProgressReporter::spawn(event_tx.clone());
        Ok(Self {
            config: Arc::new(config),
            components,
            event_tx,
            progress,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Latest progress snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Receiver notified on every progress publication
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.watch()
    }

    /// Root token; cancelling it stops the current and every later run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel cooperatively
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.cancel.cancel();
    }

    /// Run `episodes` with the configured limits
    pub async fn run(&self, episodes: Vec<EpisodeDescriptor>) -> Result<RunReport> {
        let download = &self.config.download;
        self.run_with_limits(
            episodes,
            download.max_concurrent_episodes,
            download.max_concurrent_transfers_per_episode,
        )
        .await
    }

    /// Run `episodes` with explicit concurrency limits
    ///
    /// Returns an error only for invalid input (zero limits, duplicate
    /// episode ids); every episode-level outcome is in the report.
    pub async fn run_with_limits(
        &self,
        episodes: Vec<EpisodeDescriptor>,
        max_concurrent_episodes: usize,
        max_concurrent_transfers_per_episode: usize,
    ) -> Result<RunReport> {
        if max_concurrent_episodes == 0 {
            return Err(Error::config(
                "max_concurrent_episodes",
                "must allow at least one episode",
            ));
        }
        if max_concurrent_transfers_per_episode == 0 {
            return Err(Error::config(
                "max_concurrent_transfers_per_episode",
                "must allow at least one transfer",
            ));
        }
        check_unique(&episodes)?;

        let started_at = Utc::now();
        let mut config = (*self.config).clone();
        config.download.max_concurrent_transfers_per_episode = max_concurrent_transfers_per_episode;

        let notifier = Notifier::new(self.progress.sender(), self.event_tx.clone());
        let assembler = Arc::new(StreamAssembler::new(
            Arc::new(config),
            self.components.clone(),
            notifier.clone(),
        ));

        // A run-fatal abort cancels this run only, not the scheduler
        let run_cancel = self.cancel.child_token();

        let tasks: Vec<Arc<EpisodeTask>> = episodes
            .into_iter()
            .map(|d| Arc::new(EpisodeTask::new(Arc::new(d), &run_cancel)))
            .collect();
        let ids: Vec<EpisodeId> = tasks.iter().map(|t| t.id().clone()).collect();

        tracing::info!(
            episodes = tasks.len(),
            max_concurrent_episodes,
            max_concurrent_transfers_per_episode,
            "Starting run"
        );

        for task in &tasks {
            notifier
                .progress()
                .episode_state(task.id(), EpisodeState::Queued);
            notifier.emit(Event::EpisodeQueued {
                id: task.id().clone(),
            });
        }

        let limit = Arc::new(Semaphore::new(max_concurrent_episodes));
        let mut queue: VecDeque<(usize, Arc<EpisodeTask>)> =
            tasks.into_iter().enumerate().collect();
        let mut in_flight: JoinSet<TaskReport> = JoinSet::new();
        let mut slots: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut results: Vec<Option<EpisodeResult>> = ids.iter().map(|_| None).collect();
        let mut aborted: Option<String> = None;

        while !queue.is_empty() || !in_flight.is_empty() {
            tokio::select! {
                biased;
                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((task_id, report)) => {
                            if let Some(reason) = &report.fatal
                                && aborted.is_none()
                            {
                                tracing::error!(
                                    episode_id = %report.id,
                                    reason = %reason,
                                    "aborting run"
                                );
                                aborted = Some(reason.clone());
                                run_cancel.cancel();
                            }
                            if let Some(index) = slots.remove(&task_id) {
                                results[index] = Some(report.result);
                            }
                        }
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => {
                            tracing::error!(error = %e, "episode task aborted");
                            if let Some(index) = slots.remove(&e.id()) {
                                results[index] = Some(EpisodeResult::Cancelled);
                            }
                        }
                    }
                }
                _ = run_cancel.cancelled(), if !queue.is_empty() => {
                    for (index, task) in queue.drain(..) {
                        results[index] = Some(task.cancel_queued(&notifier).result);
                    }
                }
                permit = limit.clone().acquire_owned(), if !queue.is_empty() => {
                    let Ok(permit) = permit else {
                        break;
                    };
                    let Some((index, task)) = queue.pop_front() else {
                        continue;
                    };
                    let assembler = assembler.clone();
                    let run_cancel = run_cancel.clone();
                    let handle = in_flight.spawn(async move {
                        let report = task.run(&assembler).await;
                        // Stop the queue before the slot frees up
                        if report.fatal.is_some() {
                            run_cancel.cancel();
                        }
                        drop(permit);
                        report
                    });
                    slots.insert(handle.id(), index);
                }
            }
        }

        self.progress.flush().await;

        let report = RunReport {
            results: ids
                .into_iter()
                .zip(results)
                .map(|(id, result)| (id, result.unwrap_or(EpisodeResult::Cancelled)))
                .collect(),
            aborted,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            succeeded = report.count(EpisodeState::Succeeded),
            failed = report.count(EpisodeState::Failed),
            skipped = report.count(EpisodeState::Skipped),
            cancelled = report.count(EpisodeState::Cancelled),
            "Run finished"
        );
        Ok(report)
    }
}

/// Ids, and the temp directories derived from them, must be unique
fn check_unique(episodes: &[EpisodeDescriptor]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut slugs = HashMap::new();
    for episode in episodes {
        if !ids.insert(&episode.id) {
            return Err(Error::InvalidInput(format!(
                "duplicate episode id {}",
                episode.id
            )));
        }
        if let Some(other) = slugs.insert(episode.id.slug(), &episode.id) {
            return Err(Error::InvalidInput(format!(
                "episode ids {} and {} map to the same temp directory",
                other, episode.id
            )));
        }
    }
    Ok(())
}

/// Outcome of one [`Scheduler::run`]
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    /// Results in input order
    pub results: Vec<(EpisodeId, EpisodeResult)>,
    /// Reason the run was aborted early, if it was
    pub aborted: Option<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the last episode finished
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Number of episodes that ended in `state`
    pub fn count(&self, state: EpisodeState) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| r.state() == state)
            .count()
    }

    /// Result of one episode
    pub fn result(&self, id: &EpisodeId) -> Option<&EpisodeResult> {
        self.results
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, r)| r)
    }

    /// Failed episodes with their reasons
    pub fn failures(&self) -> impl Iterator<Item = (&EpisodeId, &str)> {
        self.results.iter().filter_map(|(id, r)| match r {
            EpisodeResult::Failed { reason, .. } => Some((id, reason.as_str())),
            _ => None,
        })
    }

    /// Wall-clock duration of the run
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Process exit code for a CLI
    ///
    /// 2 if the run was aborted, 1 if any episode failed, 130 if the run was
    /// interrupted, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.count(EpisodeState::Failed) > 0 {
            1
        } else if self.count(EpisodeState::Cancelled) > 0 {
            130
        } else {
            0
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.duration().num_milliseconds() as f64 / 1000.0;
        write!(
            f,
            "{} succeeded, {} failed, {} skipped, {} cancelled in {:.1}s",
            self.count(EpisodeState::Succeeded),
            self.count(EpisodeState::Failed),
            self.count(EpisodeState::Skipped),
            self.count(EpisodeState::Cancelled),
            secs
        )?;
        if let Some(reason) = &self.aborted {
            write!(f, "\naborted: {reason}")?;
        }
        for (id, reason) in self.failures() {
            write!(f, "\n  {id}: {reason}")?;
        }
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{ConcatMuxer, PassthroughConverter};
    use crate::error::ErrorKind;
    use crate::transfer::{FetchRequest, StreamFetcher};
    use crate::types::{ArtifactDisposition, StreamKind, StreamSpec, TransferOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sleeps per stream; URLs containing "missing" 404
    struct SlowFetcher {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowFetcher {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StreamFetcher for SlowFetcher {
        async fn fetch(&self, request: FetchRequest<'_>) -> crate::Result<TransferOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let slept = tokio::select! {
                _ = tokio::time::sleep(self.delay) => true,
                _ = request.cancel.cancelled() => false,
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            if !slept {
                return Err(Error::Cancelled);
            }
            let url = &request.spec.urls[0];
            if url.contains("missing") {
                return Err(Error::from_status(404, url));
            }
            if url.contains("full") {
                return Err(Error::disk(
                    request.destination,
                    std::io::Error::from(std::io::ErrorKind::StorageFull),
                ));
            }
            tokio::fs::create_dir_all(request.destination.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(request.destination, b"x").await.unwrap();
            Ok(TransferOutcome {
                path: request.destination.to_path_buf(),
                total_bytes: 1,
                bytes_transferred: 1,
                resumed_from: 0,
                attempts: 1,
            })
        }
    }

    fn scheduler(dir: &TempDir, fetcher: Arc<SlowFetcher>) -> Scheduler {
        let mut config = Config::default();
        config.download.temp_dir = dir.path().join("temp");
        config.disk_space.enabled = false;
        Scheduler::with_components(
            config,
            Components {
                fetcher,
                muxer: Arc::new(ConcatMuxer),
                converter: Arc::new(PassthroughConverter),
            },
        )
        .unwrap()
    }

    fn episode(dir: &TempDir, id: &str, url: &str) -> EpisodeDescriptor {
        EpisodeDescriptor::new(id, dir.path().join("out").join(id))
            .with_stream(StreamSpec::new(StreamKind::Video, url))
    }

    #[tokio::test]
    async fn results_keep_input_order_and_isolate_failures() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SlowFetcher::new(Duration::from_millis(10)));
        let episodes = vec![
            episode(&dir, "a", "http://cdn/a"),
            episode(&dir, "b", "http://cdn/missing"),
            episode(&dir, "c", "http://cdn/c"),
        ];

        let report = scheduler.run(episodes).await.unwrap();

        let ids: Vec<_> = report.results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(report.count(EpisodeState::Succeeded), 2);
        assert!(matches!(
            report.result(&"b".into()),
            Some(EpisodeResult::Failed {
                kind: ErrorKind::NotFound,
                artifacts: ArtifactDisposition::Cleaned,
                ..
            })
        ));
        assert_eq!(report.exit_code(), 1);
        assert!(report.to_string().contains("2 succeeded, 1 failed"));
    }

    #[tokio::test]
    async fn episode_concurrency_is_bounded() {
        let dir = TempDir::new().unwrap();
        let fetcher = SlowFetcher::new(Duration::from_millis(30));
        let scheduler = scheduler(&dir, fetcher.clone());
        let episodes = (0..6)
            .map(|i| episode(&dir, &format!("ep{i}"), &format!("http://cdn/{i}")))
            .collect();

        let report = scheduler.run_with_limits(episodes, 2, 1).await.unwrap();

        assert_eq!(report.count(EpisodeState::Succeeded), 6);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn cancel_resolves_queued_episodes_without_transfers() {
        let dir = TempDir::new().unwrap();
        let fetcher = SlowFetcher::new(Duration::from_secs(30));
        let scheduler = scheduler(&dir, fetcher.clone());
        let token = scheduler.cancellation_token();
        let episodes = (0..4)
            .map(|i| episode(&dir, &format!("ep{i}"), &format!("http://cdn/{i}")))
            .collect();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let report = scheduler.run_with_limits(episodes, 1, 1).await.unwrap();

        assert_eq!(report.count(EpisodeState::Cancelled), 4);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.exit_code(), 130);
    }

    #[tokio::test]
    async fn full_disk_aborts_the_run_and_cancels_queued_episodes() {
        let dir = TempDir::new().unwrap();
        let fetcher = SlowFetcher::new(Duration::ZERO);
        let scheduler = scheduler(&dir, fetcher.clone());
        let mut episodes = vec![episode(&dir, "ep0", "http://cdn/full")];
        episodes.extend(
            (1..4).map(|i| episode(&dir, &format!("ep{i}"), &format!("http://cdn/{i}"))),
        );

        let report = scheduler.run_with_limits(episodes, 1, 1).await.unwrap();

        assert!(report.aborted.is_some(), "{report}");
        assert_eq!(report.exit_code(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            report.result(&"ep0".into()),
            Some(EpisodeResult::Failed {
                kind: ErrorKind::Disk,
                ..
            })
        ));
        assert_eq!(report.count(EpisodeState::Cancelled), 3);

        // The scheduler itself stays usable for the next run
        let report = scheduler
            .run(vec![episode(&dir, "after", "http://cdn/after")])
            .await
            .unwrap();
        assert_eq!(report.count(EpisodeState::Succeeded), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SlowFetcher::new(Duration::ZERO));
        let err = scheduler
            .run(vec![
                episode(&dir, "a", "http://cdn/a"),
                episode(&dir, "a", "http://cdn/b"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = scheduler
            .run(vec![
                episode(&dir, "a/b", "http://cdn/a"),
                episode(&dir, "a_b", "http://cdn/b"),
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same temp directory"));

        let err = scheduler
            .run(vec![
                episode(&dir, "", "http://cdn/a"),
                episode(&dir, "_", "http://cdn/b"),
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("same temp directory"));
    }

    #[tokio::test]
    async fn zero_limits_are_rejected() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SlowFetcher::new(Duration::ZERO));
        assert!(scheduler.run_with_limits(Vec::new(), 0, 1).await.is_err());
        assert!(scheduler.run_with_limits(Vec::new(), 1, 0).await.is_err());
    }

    #[tokio::test]
    async fn events_cover_the_lifecycle() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, SlowFetcher::new(Duration::ZERO));
        let mut events = scheduler.subscribe();

        scheduler
            .run(vec![episode(&dir, "a", "http://cdn/a")])
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                Event::EpisodeQueued { .. } => seen.push("queued"),
                Event::EpisodeStarted { .. } => seen.push("started"),
                Event::Assembling { .. } => seen.push("assembling"),
                Event::EpisodeFinished { .. } => seen.push("finished"),
                Event::StreamProgress(_) => {}
            }
        }
        assert_eq!(seen, ["queued", "started", "assembling", "finished"]);
        assert_eq!(
            scheduler.snapshot().count(EpisodeState::Succeeded),
            1
        );
    }
}
