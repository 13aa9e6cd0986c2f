//! Episode lifecycle

use super::{Notifier, StreamAssembler};
use crate::types::{
    ArtifactDisposition, EpisodeDescriptor, EpisodeId, EpisodeResult, EpisodeState, Event,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Terminal record of one task
#[derive(Debug)]
pub struct TaskReport {
    /// Episode
    pub id: EpisodeId,
    /// Result, produced exactly once
    pub result: EpisodeResult,
    /// Set when the episode hit a condition that must abort the whole run
    pub fatal: Option<String>,
}

/// One episode moving through `Queued -> Running -> terminal`
///
/// The task owns a child of the run's cancellation token, so cancelling the
/// run stops it while cancelling the task leaves its siblings alone.
pub struct EpisodeTask {
    descriptor: Arc<EpisodeDescriptor>,
    state: watch::Sender<EpisodeState>,
    cancel: CancellationToken,
}

impl EpisodeTask {
    /// Create a queued task under `parent`
    pub fn new(descriptor: Arc<EpisodeDescriptor>, parent: &CancellationToken) -> Self {
        let (state, _) = watch::channel(EpisodeState::Queued);
        Self {
            descriptor,
            state,
            cancel: parent.child_token(),
        }
    }

    /// Episode id
    pub fn id(&self) -> &EpisodeId {
        &self.descriptor.id
    }

    /// Input descriptor
    pub fn descriptor(&self) -> &EpisodeDescriptor {
        &self.descriptor
    }

    /// Current lifecycle state
    pub fn state(&self) -> EpisodeState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn watch(&self) -> watch::Receiver<EpisodeState> {
        self.state.subscribe()
    }

    /// Token stopping this episode only
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of this episode
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Apply a transition; illegal ones are logged and ignored
    fn transition(&self, next: EpisodeState) -> bool {
        let mut from = None;
        let applied = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                from = Some(*current);
                false
            }
        });
        if let Some(from) = from {
            tracing::error!(
                episode_id = %self.id(),
                from = %from,
                to = %next,
                "illegal episode state transition"
            );
        }
        applied
    }

    /// Run the episode to a terminal state
    pub async fn run(&self, assembler: &StreamAssembler) -> TaskReport {
        let notifier = assembler.notifier();
        if self.cancel.is_cancelled() {
            return self.cancel_queued(notifier);
        }

        self.transition(EpisodeState::Running);
        notifier
            .progress()
            .episode_state(self.id(), EpisodeState::Running);
        notifier.emit(Event::EpisodeStarted {
            id: self.id().clone(),
        });
        tracing::info!(
            episode_id = %self.id(),
            streams = self.descriptor.streams.len(),
            "Starting episode"
        );

        let (result, fatal) = match assembler.try_assemble(&self.descriptor, &self.cancel).await {
            Ok(result) => (result, None),
            Err(e) if e.is_run_fatal() => {
                tracing::error!(episode_id = %self.id(), error = %e, "run-fatal error");
                let fatal = e.to_string();
                (
                    EpisodeResult::from_error(&e, ArtifactDisposition::Retained),
                    Some(fatal),
                )
            }
            Err(e) => (
                EpisodeResult::from_error(&e, ArtifactDisposition::Retained),
                None,
            ),
        };

        self.finish(notifier, result, fatal)
    }

    /// Resolve a task that never left the queue
    pub fn cancel_queued(&self, notifier: &Notifier) -> TaskReport {
        tracing::info!(episode_id = %self.id(), "Episode cancelled before start");
        self.finish(notifier, EpisodeResult::Cancelled, None)
    }

    fn finish(
        &self,
        notifier: &Notifier,
        result: EpisodeResult,
        fatal: Option<String>,
    ) -> TaskReport {
        let state = result.state();
        self.transition(state);
        notifier.progress().episode_state(self.id(), state);

        let detail = result.describe();
        match &result {
            EpisodeResult::Failed { .. } => {
                tracing::warn!(episode_id = %self.id(), %state, %detail, "Episode finished")
            }
            _ => tracing::info!(episode_id = %self.id(), %state, %detail, "Episode finished"),
        }
        notifier.emit(Event::EpisodeFinished {
            id: self.id().clone(),
            state,
            detail,
        });

        TaskReport {
            id: self.id().clone(),
            result,
            fatal,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{ConcatMuxer, PassthroughConverter};
    use crate::config::Config;
    use crate::episode::Components;
    use crate::error::{Error, Result};
    use crate::transfer::{FetchRequest, StreamFetcher};
    use crate::types::{StreamKind, StreamSpec, TransferOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct CountingFetcher {
        calls: AtomicUsize,
        error: Option<fn() -> Error>,
    }

    #[async_trait]
    impl StreamFetcher for CountingFetcher {
        async fn fetch(&self, request: FetchRequest<'_>) -> Result<TransferOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.error {
                return Err(error());
            }
            tokio::fs::create_dir_all(request.destination.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(request.destination, b"data").await.unwrap();
            Ok(TransferOutcome {
                path: request.destination.to_path_buf(),
                total_bytes: 4,
                bytes_transferred: 4,
                resumed_from: 0,
                attempts: 1,
            })
        }
    }

    fn setup(
        dir: &TempDir,
        error: Option<fn() -> Error>,
    ) -> (StreamAssembler, Arc<CountingFetcher>, broadcast::Receiver<Event>) {
        let mut config = Config::default();
        config.download.temp_dir = dir.path().join("temp");
        config.disk_space.enabled = false;
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            error,
        });
        let (events, rx) = broadcast::channel(64);
        let notifier = Notifier::new(crate::progress::ProgressSender::disconnected(), events);
        let assembler = StreamAssembler::new(
            Arc::new(config),
            Components {
                fetcher: fetcher.clone(),
                muxer: Arc::new(ConcatMuxer),
                converter: Arc::new(PassthroughConverter),
            },
            notifier,
        );
        (assembler, fetcher, rx)
    }

    fn descriptor(dir: &TempDir) -> Arc<EpisodeDescriptor> {
        Arc::new(
            EpisodeDescriptor::new("ep", dir.path().join("ep"))
                .with_stream(StreamSpec::new(StreamKind::Video, "http://cdn/v")),
        )
    }

    #[tokio::test]
    async fn successful_run_walks_the_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (assembler, _, mut events) = setup(&dir, None);
        let task = EpisodeTask::new(descriptor(&dir), &CancellationToken::new());
        let mut states = task.watch();
        assert_eq!(task.state(), EpisodeState::Queued);

        let report = task.run(&assembler).await;

        assert_eq!(report.result.state(), EpisodeState::Succeeded);
        assert!(report.fatal.is_none());
        assert_eq!(task.state(), EpisodeState::Succeeded);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), EpisodeState::Succeeded);

        assert!(matches!(
            events.recv().await.unwrap(),
            Event::EpisodeStarted { .. }
        ));
        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let Event::EpisodeFinished { state, .. } = event {
                finished = Some(state);
            }
        }
        assert_eq!(finished, Some(EpisodeState::Succeeded));
    }

    #[tokio::test]
    async fn cancelled_parent_means_no_transfers() {
        let dir = TempDir::new().unwrap();
        let (assembler, fetcher, _events) = setup(&dir, None);
        let parent = CancellationToken::new();
        let task = EpisodeTask::new(descriptor(&dir), &parent);
        parent.cancel();

        let report = task.run(&assembler).await;

        assert!(matches!(report.result, EpisodeResult::Cancelled));
        assert_eq!(task.state(), EpisodeState::Cancelled);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn storage_full_is_reported_as_fatal() {
        let dir = TempDir::new().unwrap();
        let (assembler, _, _events) = setup(
            &dir,
            Some(|| {
                Error::disk(
                    "/tmp/x",
                    std::io::Error::from(std::io::ErrorKind::StorageFull),
                )
            }),
        );
        let task = EpisodeTask::new(descriptor(&dir), &CancellationToken::new());

        let report = task.run(&assembler).await;

        assert_eq!(report.result.state(), EpisodeState::Failed);
        assert!(report.fatal.is_some());
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let dir = TempDir::new().unwrap();
        let (assembler, _, _events) = setup(&dir, None);
        let task = EpisodeTask::new(descriptor(&dir), &CancellationToken::new());
        task.run(&assembler).await;

        assert!(!task.transition(EpisodeState::Running));
        assert!(!task.transition(EpisodeState::Cancelled));
        assert_eq!(task.state(), EpisodeState::Succeeded);
    }

    #[test]
    fn cancelling_one_task_leaves_siblings() {
        let parent = CancellationToken::new();
        let a = EpisodeTask::new(Arc::new(EpisodeDescriptor::new("a", "/a")), &parent);
        let b = EpisodeTask::new(Arc::new(EpisodeDescriptor::new("b", "/b")), &parent);
        a.cancel();
        assert!(a.cancellation_token().is_cancelled());
        assert!(!b.cancellation_token().is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
