//! Configuration types for episode-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Scheduling and on-disk layout of downloads
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory for in-progress stream files (default: "./temp")
    ///
    /// Each episode gets its own sub-directory; files inside double as
    /// resume markers.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Maximum episodes running at once (default: 3)
    #[serde(default = "default_max_concurrent_episodes")]
    pub max_concurrent_episodes: usize,

    /// Maximum stream transfers running at once within one episode (default: 2)
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers_per_episode: usize,

    /// Maximum simultaneous connections to a single host across the whole run
    /// (None = only the two pools above bound connections)
    #[serde(default)]
    pub max_connections_per_host: Option<usize>,

    /// Return `Skipped` when the final output already exists (default: true)
    ///
    /// When false, an existing output is removed and the episode is fetched again.
    #[serde(default = "default_true")]
    pub skip_if_exists: bool,

    /// Keep intermediate stream files after a successful assembly (default: false)
    #[serde(default)]
    pub keep_intermediates: bool,

    /// Delete partial stream files when an episode is cancelled (default: false)
    ///
    /// Left alone they let the next run resume where this one stopped.
    #[serde(default)]
    pub discard_partial_on_cancel: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            max_concurrent_episodes: default_max_concurrent_episodes(),
            max_concurrent_transfers_per_episode: default_max_concurrent_transfers(),
            max_connections_per_host: None,
            skip_if_exists: true,
            keep_intermediates: false,
            discard_partial_on_cancel: false,
        }
    }
}

/// HTTP transfer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Timeout for one attempt's connect + response headers, and for every
    /// individual chunk read (default: 30 seconds)
    #[serde(default = "default_per_attempt_timeout", with = "duration_millis")]
    pub per_attempt_timeout: Duration,

    /// Size of the read buffer flushed to disk per progress update (default: 64 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Referer header; video CDNs commonly reject requests without one
    #[serde(default)]
    pub referer: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            per_attempt_timeout: default_per_attempt_timeout(),
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
            referer: None,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stream, including the first one (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// What to do with a partially written output when assembly fails or is cancelled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialOutputPolicy {
    /// Remove the partial output (default)
    #[default]
    Delete,
    /// Leave it in place for manual inspection
    Keep,
}

/// Container format for the assembled output
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Pick from the selected streams' codecs
    #[default]
    Infer,
    /// Always use this extension (without the dot, e.g. "mkv")
    Fixed(String),
}

/// Assembly (mux and danmaku conversion) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Path to the ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Whether to search PATH for ffmpeg if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Upper bound on a single mux or conversion run (default: 10 minutes)
    #[serde(default = "default_assembly_timeout", with = "duration_millis")]
    pub timeout: Duration,

    /// Handling of partial outputs on failure or cancellation
    #[serde(default)]
    pub partial_output: PartialOutputPolicy,

    /// Codec the video track is saved with (default: "copy")
    #[serde(default = "default_copy_codec")]
    pub video_codec: String,

    /// Codec the audio track is saved with (default: "copy")
    #[serde(default = "default_copy_codec")]
    pub audio_codec: String,

    /// Container for episodes with a video track
    #[serde(default)]
    pub output_format: OutputFormat,

    /// Container for audio-only episodes
    #[serde(default)]
    pub output_format_audio_only: OutputFormat,

    /// Extension of converted danmaku sidecars (default: "ass")
    #[serde(default = "default_danmaku_extension")]
    pub danmaku_extension: String,

    /// External danmaku converter: program, then arguments with `{input}`,
    /// `{output}`, `{width}` and `{height}` placeholders
    /// (None = keep the raw XML)
    #[serde(default)]
    pub danmaku_command: Option<Vec<String>>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            search_path: true,
            timeout: default_assembly_timeout(),
            partial_output: PartialOutputPolicy::default(),
            video_codec: default_copy_codec(),
            audio_codec: default_copy_codec(),
            output_format: OutputFormat::Infer,
            output_format_audio_only: OutputFormat::Infer,
            danmaku_extension: default_danmaku_extension(),
            danmaku_command: None,
        }
    }
}

/// Disk space checking configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    /// Enable disk space checking (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum free space to maintain (default: 256 MiB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    /// Multiplier for the declared stream sizes (default: 2.0, streams plus muxed copy)
    #[serde(default = "default_size_multiplier")]
    pub size_multiplier: f64,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_space: default_min_free_space(),
            size_multiplier: default_size_multiplier(),
        }
    }
}

/// Main configuration for the pipeline
///
/// Fields are organized into sub-configs:
/// - [`download`](DownloadConfig): concurrency, temp layout, skip policy
/// - [`transfer`](TransferConfig): timeouts and request headers
/// - [`retry`](RetryConfig): per-stream retry budget and backoff
/// - [`assembly`](AssemblyConfig): muxer and converter behaviour
/// - [`disk_space`](DiskSpaceConfig): free-space precheck
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// HTTP transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Assembly settings
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Disk space precheck
    #[serde(default)]
    pub disk_space: DiskSpaceConfig,
}

impl Config {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_episodes == 0 {
            return Err(Error::config(
                "max_concurrent_episodes",
                "must allow at least one episode",
            ));
        }
        if self.download.max_concurrent_transfers_per_episode == 0 {
            return Err(Error::config(
                "max_concurrent_transfers_per_episode",
                "must allow at least one transfer",
            ));
        }
        if self.download.max_connections_per_host == Some(0) {
            return Err(Error::config(
                "max_connections_per_host",
                "must be unset or at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "max_attempts",
                "must allow at least one attempt",
            ));
        }
        if self.transfer.per_attempt_timeout.is_zero() {
            return Err(Error::config("per_attempt_timeout", "must be non-zero"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(Error::config("chunk_size", "must be non-zero"));
        }
        if self
            .assembly
            .danmaku_command
            .as_ref()
            .is_some_and(|command| command.is_empty())
        {
            return Err(Error::config("danmaku_command", "must name a program"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("backoff_multiplier", "must be >= 1.0"));
        }
        Ok(())
    }
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_max_concurrent_episodes() -> usize {
    3
}

fn default_max_concurrent_transfers() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_per_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_user_agent() -> String {
    concat!("episode-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_assembly_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_copy_codec() -> String {
    "copy".to_string()
}

fn default_danmaku_extension() -> String {
    "ass".to_string()
}

fn default_min_free_space() -> u64 {
    256 * 1024 * 1024
}

fn default_size_multiplier() -> f64 {
    2.0
}

// Durations travel as integer milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.download.max_concurrent_episodes, 3);
        assert_eq!(config.download.max_concurrent_transfers_per_episode, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.transfer.per_attempt_timeout, Duration::from_secs(30));
        assert!(config.download.skip_if_exists);
        assert_eq!(config.assembly.partial_output, PartialOutputPolicy::Delete);
    }

    #[test]
    fn timeouts_deserialize_from_milliseconds() {
        let json = r#"{
            "transfer": { "per_attempt_timeout": 1500 },
            "retry": { "max_attempts": 2, "initial_delay": 10 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.transfer.per_attempt_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn output_format_accepts_fixed_extension() {
        let json = r#"{ "assembly": { "output_format": { "fixed": "mkv" } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.assembly.output_format,
            OutputFormat::Fixed("mkv".into())
        );
    }

    #[test]
    fn zero_limits_are_rejected_with_key() {
        let mut config = Config::default();
        config.download.max_concurrent_episodes = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("max_concurrent_episodes"))
            }
            other => panic!("expected config error, got {other:?}"),
        }

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.download.max_connections_per_host = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.assembly.danmaku_command = Some(Vec::new());
        assert!(config.validate().is_err());
    }
}
