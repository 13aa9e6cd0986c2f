//! Core types for episode-dl
//!
//! Inputs ([`EpisodeDescriptor`], [`StreamSpec`]) are built by the site
//! resolver and never mutated afterwards. Outputs ([`EpisodeResult`]) are
//! produced exactly once per episode.

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Unique identifier for an episode within one run
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub String);

impl EpisodeId {
    /// Create a new EpisodeId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form used for the per-episode temp directory
    ///
    /// Always a single normal path component: ids that are empty or made of
    /// dots only are prefixed with `_`.
    pub fn slug(&self) -> String {
        let slug: String = self
            .0
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        if slug.chars().all(|c| c == '.') {
            format!("_{slug}")
        } else {
            slug
        }
    }
}

impl From<&str> for EpisodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EpisodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a fetchable stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Video track
    Video,
    /// Audio track
    Audio,
    /// Raw danmaku (comment) data, consumed by the converter
    Danmaku,
    /// Subtitle track, kept as a sidecar
    Subtitle,
}

impl StreamKind {
    /// Whether this stream goes into the muxed output
    pub fn is_media(self) -> bool {
        matches!(self, StreamKind::Video | StreamKind::Audio)
    }

    /// Media tracks are required; comments and subtitles are best-effort
    pub fn required_by_default(self) -> bool {
        self.is_media()
    }

    /// Raw danmaku is only an input to the converter
    pub fn temporary_by_default(self) -> bool {
        matches!(self, StreamKind::Danmaku)
    }

    fn as_str(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Danmaku => "danmaku",
            StreamKind::Subtitle => "subtitle",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected digest of a completed stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Checksum {
    /// Lower-case hex SHA-256 of the whole file
    Sha256(String),
    /// Lower-case hex MD5 of the whole file
    Md5(String),
    /// Server ETag the final response must carry (quotes and `W/` ignored)
    ETag(String),
}

/// Pixel size of the video track, used to lay out converted danmaku
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        // Danmaku is laid out for 1080p when no video track is downloaded
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// One fetchable resource of an episode
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamSpec {
    /// What this stream is
    pub kind: StreamKind,
    /// Primary URL followed by mirrors, tried in order on failure
    pub urls: Vec<String>,
    /// Declared size in bytes, if the resolver knows it
    #[serde(default)]
    pub expected_size: Option<u64>,
    /// Digest to verify once complete
    #[serde(default)]
    pub checksum: Option<Checksum>,
    /// Codec name as reported by the site (e.g. "hevc", "avc", "fLaC")
    #[serde(default)]
    pub codec: Option<String>,
    /// Video resolution, if this is a video stream
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Language tag for subtitle streams
    #[serde(default)]
    pub language: Option<String>,
    /// Failure of a required stream fails the episode
    pub required: bool,
    /// Temporary streams are deleted once consumed or on failure
    pub temporary: bool,
}

impl StreamSpec {
    /// Create a stream spec with kind-appropriate defaults
    pub fn new(kind: StreamKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            urls: vec![url.into()],
            expected_size: None,
            checksum: None,
            codec: None,
            resolution: None,
            language: None,
            required: kind.required_by_default(),
            temporary: kind.temporary_by_default(),
        }
    }

    /// Append backup URLs
    pub fn with_mirrors<I, S>(mut self, mirrors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls.extend(mirrors.into_iter().map(Into::into));
        self
    }

    /// Set the declared size
    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Set the digest to verify
    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    /// Set the codec name
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    /// Set the video resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution { width, height });
        self
    }

    /// Set the subtitle language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Override whether failure of this stream fails the episode
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Override whether this stream is deleted after use
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// URL to use on the given zero-based attempt
    pub fn url_for_attempt(&self, attempt: u32) -> Option<&str> {
        if self.urls.is_empty() {
            return None;
        }
        self.urls
            .get(attempt as usize % self.urls.len())
            .map(String::as_str)
    }
}

/// Descriptive metadata written to the `.nfo` sidecar
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    /// Episode title
    pub title: String,
    /// Long description
    #[serde(default)]
    pub plot: Option<String>,
    /// Release date as reported by the site (e.g. "2024-05-01")
    #[serde(default)]
    pub premiered: Option<String>,
    /// Uploader / channel names
    #[serde(default)]
    pub actors: Vec<String>,
    /// Tags / genres
    #[serde(default)]
    pub tags: Vec<String>,
    /// Page the episode was resolved from
    #[serde(default)]
    pub source_url: Option<String>,
}

/// One downloadable episode, as resolved by the site client
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeDescriptor {
    /// Identifier, unique within one run
    pub id: EpisodeId,
    /// Output path without extension (result of path templating)
    pub output_stem: PathBuf,
    /// Streams to fetch, in declaration order
    pub streams: Vec<StreamSpec>,
    /// Per-episode override of `download.skip_if_exists`
    #[serde(default)]
    pub skip_if_exists: Option<bool>,
    /// Metadata for the `.nfo` sidecar
    #[serde(default)]
    pub metadata: Option<EpisodeMetadata>,
}

impl EpisodeDescriptor {
    /// Create a descriptor with no streams
    pub fn new(id: impl Into<EpisodeId>, output_stem: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            output_stem: output_stem.into(),
            streams: Vec::new(),
            skip_if_exists: None,
            metadata: None,
        }
    }

    /// Add a stream
    pub fn with_stream(mut self, stream: StreamSpec) -> Self {
        self.streams.push(stream);
        self
    }

    /// Set the skip-if-exists override
    pub fn with_skip_if_exists(mut self, skip: bool) -> Self {
        self.skip_if_exists = Some(skip);
        self
    }

    /// Attach `.nfo` metadata
    pub fn with_metadata(mut self, metadata: EpisodeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sum of declared stream sizes (unknown sizes count as zero)
    pub fn declared_size(&self) -> u64 {
        self.streams.iter().filter_map(|s| s.expected_size).sum()
    }

    /// First stream of the given kind, with its index
    pub fn first_of(&self, kind: StreamKind) -> Option<(usize, &StreamSpec)> {
        self.streams.iter().enumerate().find(|(_, s)| s.kind == kind)
    }

    /// Deterministic temp directory of this episode
    pub fn temp_dir(&self, temp_root: &Path) -> PathBuf {
        temp_root.join(self.id.slug())
    }

    /// Deterministic temp file of one stream; doubles as its resume marker
    pub fn stream_temp_path(&self, temp_root: &Path, index: usize) -> PathBuf {
        let kind = self
            .streams
            .get(index)
            .map(|s| s.kind)
            .unwrap_or(StreamKind::Video);
        self.temp_dir(temp_root)
            .join(format!("{}_{}.part", index, kind))
    }
}

/// Status of one stream transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Not started
    Pending,
    /// Bytes are flowing
    InProgress,
    /// Stopped (cancelled or failed transiently) with a resumable partial file
    PausedResumable,
    /// All bytes on disk and verified
    Completed,
    /// Irrecoverably failed
    Failed,
}

/// Mutable per-stream record, owned by its transfer unit
///
/// Others only ever see clones of it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferState {
    /// Bytes currently on disk
    pub bytes_fetched: u64,
    /// Total size, once probed
    pub total_bytes: Option<u64>,
    /// Current status
    pub status: TransferStatus,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// Attempts started so far
    pub attempts: u32,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            bytes_fetched: 0,
            total_bytes: None,
            status: TransferStatus::Pending,
            last_error: None,
            attempts: 0,
        }
    }
}

/// Result of a completed transfer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferOutcome {
    /// File holding the stream
    pub path: PathBuf,
    /// Final file size
    pub total_bytes: u64,
    /// Bytes received over the network by this call
    pub bytes_transferred: u64,
    /// Offset the transfer resumed from (0 for a cold start)
    pub resumed_from: u64,
    /// Attempts used
    pub attempts: u32,
}

/// Lifecycle state of an episode task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeState {
    /// Waiting for a slot
    Queued,
    /// Transfers or assembly in progress
    Running,
    /// Output assembled
    Succeeded,
    /// Irrecoverably failed
    Failed,
    /// Nothing to do
    Skipped,
    /// Stopped by cancellation
    Cancelled,
}

impl EpisodeState {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        !matches!(self, EpisodeState::Queued | EpisodeState::Running)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: EpisodeState) -> bool {
        match self {
            EpisodeState::Queued => {
                matches!(next, EpisodeState::Running | EpisodeState::Cancelled)
            }
            EpisodeState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for EpisodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EpisodeState::Queued => "queued",
            EpisodeState::Running => "running",
            EpisodeState::Succeeded => "succeeded",
            EpisodeState::Failed => "failed",
            EpisodeState::Skipped => "skipped",
            EpisodeState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What happened to partial artifacts of a failed episode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactDisposition {
    /// Stream files left on disk so a later run can resume
    Retained,
    /// Everything removed
    Cleaned,
}

/// Why an episode was skipped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Output already present and skip-if-exists is set
    OutputExists {
        /// The existing file
        path: PathBuf,
    },
    /// Descriptor lists no streams and no metadata
    NothingToDownload,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::OutputExists { path } => write!(f, "{} already exists", path.display()),
            SkipReason::NothingToDownload => f.write_str("nothing to download"),
        }
    }
}

/// Terminal record of an episode, produced exactly once
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EpisodeResult {
    /// All required streams completed and assembly succeeded
    Success {
        /// The assembled output
        output: PathBuf,
        /// Danmaku, subtitle and metadata files written next to it
        sidecars: Vec<PathBuf>,
        /// Optional streams that failed
        warnings: Vec<String>,
    },
    /// Nothing was done
    Skipped {
        /// Why
        reason: SkipReason,
    },
    /// Irrecoverable failure
    Failed {
        /// Taxonomy bucket
        kind: ErrorKind,
        /// Human-readable reason
        reason: String,
        /// Whether partial files were kept for resume
        artifacts: ArtifactDisposition,
    },
    /// Stopped by cancellation; partial files are kept
    Cancelled,
}

impl EpisodeResult {
    /// Terminal state matching this result
    pub fn state(&self) -> EpisodeState {
        match self {
            EpisodeResult::Success { .. } => EpisodeState::Succeeded,
            EpisodeResult::Skipped { .. } => EpisodeState::Skipped,
            EpisodeResult::Failed { .. } => EpisodeState::Failed,
            EpisodeResult::Cancelled => EpisodeState::Cancelled,
        }
    }

    /// Result for an episode that stopped with `error`
    ///
    /// Cancellation maps to [`EpisodeResult::Cancelled`], everything else to
    /// [`EpisodeResult::Failed`].
    pub fn from_error(error: &Error, artifacts: ArtifactDisposition) -> Self {
        match error.kind() {
            ErrorKind::Cancelled => EpisodeResult::Cancelled,
            kind => EpisodeResult::Failed {
                kind,
                reason: error.to_string(),
                artifacts,
            },
        }
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self {
            EpisodeResult::Success { output, .. } => format!("saved to {}", output.display()),
            EpisodeResult::Skipped { reason } => format!("skipped: {reason}"),
            EpisodeResult::Failed { kind, reason, .. } => format!("{kind}: {reason}"),
            EpisodeResult::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Progress update from a transfer unit
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Owning episode
    pub episode_id: EpisodeId,
    /// Stream kind
    pub stream_kind: StreamKind,
    /// Index of the stream in its descriptor
    pub stream_index: usize,
    /// Bytes on disk
    pub bytes_fetched: u64,
    /// Total size if known
    pub total_bytes: Option<u64>,
    /// Transfer status
    pub status: TransferStatus,
}

/// Event emitted during a run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Episode accepted into the queue
    EpisodeQueued {
        /// Episode ID
        id: EpisodeId,
    },
    /// Episode left the queue and is running
    EpisodeStarted {
        /// Episode ID
        id: EpisodeId,
    },
    /// Stream progress
    StreamProgress(ProgressEvent),
    /// All streams present, assembly started
    Assembling {
        /// Episode ID
        id: EpisodeId,
        /// Output being written
        output: PathBuf,
    },
    /// Episode reached a terminal state
    EpisodeFinished {
        /// Episode ID
        id: EpisodeId,
        /// Terminal state
        state: EpisodeState,
        /// Human-readable description of the result
        detail: String,
    },
}
