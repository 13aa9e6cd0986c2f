//! Configs, stream content and pluggable components for pipeline tests

use async_trait::async_trait;
use episode_dl::assembly::{ConcatMuxer, PassthroughConverter};
use episode_dl::transfer::FetchRequest;
use episode_dl::types::TransferOutcome;
use episode_dl::{
    Components, Config, EpisodeDescriptor, HttpFetcher, Result, StreamFetcher, StreamKind,
    StreamSpec,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Config rooted in `dir` with fast retries and no disk precheck
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.temp_dir = dir.join("temp");
    config.disk_space.enabled = false;
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    config.transfer.per_attempt_timeout = Duration::from_secs(5);
    config.transfer.chunk_size = 1024;
    config
}

/// HTTP fetcher with the identity muxer, so outputs are inspectable bytes
pub fn identity_components(config: &Config) -> Components {
    components_with(Arc::new(HttpFetcher::new(config).unwrap()))
}

/// Identity muxer and passthrough danmaku around a custom fetcher
pub fn components_with(fetcher: Arc<dyn StreamFetcher>) -> Components {
    Components {
        fetcher,
        muxer: Arc::new(ConcatMuxer),
        converter: Arc::new(PassthroughConverter),
    }
}

/// Deterministic pseudo-random bytes
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Video + audio episode writing to `<dir>/out/<id>`
pub fn av_episode(dir: &Path, id: &str, video_url: &str, audio_url: &str) -> EpisodeDescriptor {
    EpisodeDescriptor::new(id, dir.join("out").join(id))
        .with_stream(StreamSpec::new(StreamKind::Video, video_url))
        .with_stream(StreamSpec::new(StreamKind::Audio, audio_url))
}

/// Wraps a fetcher and records how many transfers overlap
pub struct TrackingFetcher {
    inner: Arc<dyn StreamFetcher>,
    active: AtomicUsize,
    peak: AtomicUsize,
    per_episode: Mutex<HashMap<String, (usize, usize)>>,
}

impl TrackingFetcher {
    /// Track `inner`
    pub fn new(inner: Arc<dyn StreamFetcher>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            per_episode: Mutex::new(HashMap::new()),
        })
    }

    /// Most transfers in flight at once across the run
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Most transfers in flight at once within any single episode
    pub fn peak_per_episode(&self) -> usize {
        self.per_episode
            .lock()
            .unwrap()
            .values()
            .map(|(_, peak)| *peak)
            .max()
            .unwrap_or(0)
    }

    fn enter(&self, episode: &str) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut map = self.per_episode.lock().unwrap();
        let entry = map.entry(episode.to_string()).or_default();
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
    }

    fn leave(&self, episode: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(entry) = self.per_episode.lock().unwrap().get_mut(episode) {
            entry.0 -= 1;
        }
    }
}

#[async_trait]
impl StreamFetcher for TrackingFetcher {
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<TransferOutcome> {
        let episode = request.episode_id.to_string();
        self.enter(&episode);
        let result = self.inner.fetch(request).await;
        self.leave(&episode);
        result
    }
}
