//! Per-episode pipeline
//!
//! [`StreamAssembler`] turns one [`EpisodeDescriptor`] into one
//! [`EpisodeResult`]: it fetches the streams with bounded parallelism, runs
//! the single assembly action and writes sidecars. [`EpisodeTask`] wraps an
//! assembler run with the episode's lifecycle state and cancellation token.
//!
//! [`EpisodeDescriptor`]: crate::types::EpisodeDescriptor
//! [`EpisodeResult`]: crate::types::EpisodeResult

mod assembler;
mod task;

pub use assembler::{Components, StreamAssembler};
pub use task::{EpisodeTask, TaskReport};

use crate::progress::ProgressSender;
use crate::types::Event;
use tokio::sync::broadcast;

/// Outlets for progress updates and run events
#[derive(Clone)]
pub struct Notifier {
    progress: ProgressSender,
    events: broadcast::Sender<Event>,
}

impl Notifier {
    /// Report to `progress` and broadcast on `events`
    pub fn new(progress: ProgressSender, events: broadcast::Sender<Event>) -> Self {
        Self { progress, events }
    }

    /// A notifier nobody listens to
    pub fn disconnected() -> Self {
        let (events, _) = broadcast::channel(1);
        Self {
            progress: ProgressSender::disconnected(),
            events,
        }
    }

    /// Progress sink for transfer units
    pub fn progress(&self) -> &ProgressSender {
        &self.progress
    }

    /// Broadcast an event; having no subscribers is fine
    pub fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }
}
