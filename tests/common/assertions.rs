//! Assertions over run results and files

use episode_dl::{EpisodeResult, Event, RunReport};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Output path of a successful episode, panicking with the result otherwise
pub fn success_output(report: &RunReport, id: &str) -> PathBuf {
    match report.result(&id.into()) {
        Some(EpisodeResult::Success { output, .. }) => output.clone(),
        other => panic!("episode {id} did not succeed: {other:?}"),
    }
}

/// Assert `path` holds exactly `expected`
pub async fn assert_file_eq(path: &Path, expected: &[u8]) {
    let actual = tokio::fs::read(path)
        .await
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
    assert_eq!(
        actual.len(),
        expected.len(),
        "size of {}",
        path.display()
    );
    assert!(actual == expected, "content of {} differs", path.display());
}

/// Drain every event already buffered on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
