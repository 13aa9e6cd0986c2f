//! Stream transfer
//!
//! A transfer unit moves the bytes of one [`StreamSpec`] into one file on
//! disk. The file path is deterministic, so whatever is on disk from an
//! earlier attempt or an earlier run is the resume point: every attempt
//! probes the server, decides (via [`decide_resume`]) whether the local
//! bytes can be trusted, and appends from there.
//!
//! Transient failures are retried with backoff, rotating through the
//! stream's mirror URLs. Cancellation stops the byte stream at the next
//! chunk and leaves the partial file in place.

mod host_limiter;
mod probe;
mod resume;
mod verify;

pub use host_limiter::HostLimiter;
pub use probe::{ContentRange, RemoteInfo, parse_content_range, probe};
pub use resume::{ResumeDecision, decide_resume};
pub use verify::{md5_file, normalize_etag, sha256_file, verify};

use crate::config::{Config, RetryConfig, TransferConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::progress::ProgressSender;
use crate::retry::with_retry;
use crate::types::{
    EpisodeId, ProgressEvent, StreamSpec, TransferOutcome, TransferState, TransferStatus,
};
use crate::utils::{file_len, remove_file_if_exists};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, IF_RANGE, RANGE, REFERER};
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Everything a transfer needs to know about one stream
#[derive(Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Owning episode, for progress events
    pub episode_id: &'a EpisodeId,
    /// Index of the stream in its descriptor
    pub stream_index: usize,
    /// The stream
    pub spec: &'a StreamSpec,
    /// Deterministic temp path of the stream
    pub destination: &'a Path,
    /// Continue from bytes already on disk; when false they are discarded
    pub resume: bool,
    /// Episode-scoped cancellation
    pub cancel: &'a CancellationToken,
    /// Progress sink
    pub progress: &'a ProgressSender,
}

/// Fetches one stream to disk
///
/// [`HttpFetcher`] is the production implementation; tests substitute
/// their own to exercise scheduling without a network.
#[async_trait]
pub trait StreamFetcher: Send + Sync {
    /// Bring `request.destination` to the complete, verified content of the stream
    ///
    /// On [`Error::Cancelled`] or a transient failure the partial file is
    /// left in place for a later resume.
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<TransferOutcome>;
}

/// HTTP implementation of [`StreamFetcher`]
pub struct HttpFetcher {
    client: reqwest::Client,
    transfer: TransferConfig,
    retry: RetryConfig,
    hosts: HostLimiter,
}

impl HttpFetcher {
    /// Build a fetcher with its own connection pool
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = &config.transfer.referer {
            let value = HeaderValue::from_str(referer)
                .map_err(|_| Error::config("referer", "not a valid header value"))?;
            headers.insert(REFERER, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(config.transfer.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.transfer.per_attempt_timeout)
            .build()?;

        Ok(Self {
            client,
            transfer: config.transfer.clone(),
            retry: config.retry.clone(),
            hosts: HostLimiter::new(config.download.max_connections_per_host),
        })
    }
}

#[async_trait]
impl StreamFetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<TransferOutcome> {
        if request.spec.urls.is_empty() {
            return Err(Error::InvalidInput(format!(
                "stream {} ({}) of episode {} has no URL",
                request.stream_index, request.spec.kind, request.episode_id
            )));
        }
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::disk(parent, e))?;
        }
        if !request.resume && remove_file_if_exists(request.destination).await? {
            tracing::debug!(
                path = %request.destination.display(),
                "discarded previous partial file"
            );
        }

        let unit = TransferUnit::new(self, request);
        let unit = &unit;
        let result = with_retry(&self.retry, request.cancel, move |attempt| {
            unit.attempt(attempt)
        })
        .await;
        unit.finish(&result);
        result
    }
}

/// State of one `fetch` call
struct TransferUnit<'a> {
    fetcher: &'a HttpFetcher,
    request: FetchRequest<'a>,
    state: Mutex<TransferState>,
    resumed_from: Mutex<Option<u64>>,
    transferred: AtomicU64,
}

impl<'a> TransferUnit<'a> {
    fn new(fetcher: &'a HttpFetcher, request: FetchRequest<'a>) -> Self {
        Self {
            fetcher,
            request,
            state: Mutex::new(TransferState::default()),
            resumed_from: Mutex::new(None),
            transferred: AtomicU64::new(0),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TransferState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    fn event(&self) -> ProgressEvent {
        self.with_state(|s| ProgressEvent {
            episode_id: self.request.episode_id.clone(),
            stream_kind: self.request.spec.kind,
            stream_index: self.request.stream_index,
            bytes_fetched: s.bytes_fetched,
            total_bytes: s.total_bytes,
            status: s.status,
        })
    }

    fn set_status(&self, status: TransferStatus) {
        self.with_state(|s| s.status = status);
        self.request.progress.stream_status(self.event());
    }

    fn note_resume_point(&self, offset: u64) {
        let mut resumed = self
            .resumed_from
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        resumed.get_or_insert(offset);
    }

    /// Race `fut` against cancellation
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.request.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    async fn attempt(&self, attempt: u32) -> Result<TransferOutcome> {
        let result = self.try_attempt(attempt).await;
        if let Err(e) = &result {
            self.with_state(|s| {
                s.last_error = Some(e.to_string());
                s.status = TransferStatus::PausedResumable;
            });
        }
        result
    }

    async fn try_attempt(&self, attempt: u32) -> Result<TransferOutcome> {
        let request = &self.request;
        if request.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let url = request
            .spec
            .url_for_attempt(attempt)
            .ok_or_else(|| Error::InvalidInput("stream has no URL".into()))?;

        // Report what is already on disk so resumed bytes never count as transferred
        let dest = request.destination;
        let on_disk = file_len(dest).await?;
        self.with_state(|s| {
            s.attempts += 1;
            s.bytes_fetched = on_disk;
        });
        self.set_status(TransferStatus::InProgress);

        let _permit = self
            .cancellable(async { Ok::<_, Error>(self.fetcher.hosts.acquire(url).await) })
            .await?;

        let timeout = self.fetcher.transfer.per_attempt_timeout;
        let remote = self
            .cancellable(probe(&self.fetcher.client, url, timeout))
            .await?;

        let local_len = file_len(dest).await?;
        let decision = decide_resume(local_len, &remote);

        tracing::debug!(
            episode = %request.episode_id,
            stream = request.stream_index,
            attempt,
            url,
            local_len,
            ?decision,
            "starting transfer attempt"
        );

        match decision {
            ResumeDecision::AlreadyComplete => {
                if local_len == 0 {
                    // Empty resource
                    tokio::fs::File::create(dest)
                        .await
                        .map_err(|e| Error::disk(dest, e))?;
                }
                self.note_resume_point(local_len);
                self.with_state(|s| {
                    s.bytes_fetched = local_len;
                    s.total_bytes = Some(local_len);
                });
                return self.complete(remote.etag.as_deref()).await;
            }
            ResumeDecision::Restart => {
                tracing::info!(
                    episode = %request.episode_id,
                    stream = request.stream_index,
                    local_len,
                    remote_total = ?remote.total,
                    "local bytes cannot be validated, restarting stream"
                );
            }
            ResumeDecision::Fresh | ResumeDecision::Resume { .. } => {}
        }

        let offset = decision.offset();
        self.note_resume_point(offset);

        let mut builder = self.fetcher.client.get(url);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
            // A changed resource then comes back whole (200) instead of appended
            if let Some(validator) = remote
                .etag
                .as_deref()
                .filter(|etag| !etag.starts_with("W/"))
                .and_then(|etag| HeaderValue::from_str(etag).ok())
            {
                builder = builder.header(IF_RANGE, validator);
            }
        }
        let response = self
            .cancellable(async {
                tokio::time::timeout(timeout, builder.send())
                    .await
                    .map_err(|_| Error::Timeout {
                        url: url.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })?
                    .map_err(Error::from)
            })
            .await?;

        let headers = response.headers();
        let range = probe::content_range(headers);
        let served_etag = probe::etag(headers).or(remote.etag.clone());
        let append = match response.status() {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let served = range.and_then(|r| r.start).unwrap_or(0);
                if served != offset {
                    remove_file_if_exists(dest).await?;
                    return Err(Error::RangeMismatch {
                        url: url.to_string(),
                        requested: offset,
                        served,
                    });
                }
                true
            }
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                if offset > 0 {
                    tracing::warn!(url, offset, "server ignored range request, restarting");
                }
                false
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                remove_file_if_exists(dest).await?;
                return Err(Error::RangeMismatch {
                    url: url.to_string(),
                    requested: offset,
                    served: 0,
                });
            }
            status => return Err(Error::from_status(status.as_u16(), url)),
        };

        let total = if append {
            range.and_then(|r| r.total).or(remote.total)
        } else {
            response.content_length().or(remote.total)
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(dest).await.map_err(|e| Error::disk(dest, e))?;
        let mut writer = BufWriter::with_capacity(self.fetcher.transfer.chunk_size, file);

        let mut written = if append { offset } else { 0 };
        self.with_state(|s| {
            s.bytes_fetched = written;
            s.total_bytes = total;
        });
        // Baseline of this attempt; must not be lost
        request.progress.stream_status(self.event());

        let copied = self.copy_body(response, &mut writer, &mut written, url).await;
        let flushed = writer.flush().await.map_err(|e| Error::disk(dest, e));
        copied?;
        flushed?;
        writer
            .get_ref()
            .sync_data()
            .await
            .map_err(|e| Error::disk(dest, e))?;

        match total {
            Some(total) if written < total => {
                return Err(Error::IncompleteBody {
                    url: url.to_string(),
                    expected: total,
                    received: written,
                });
            }
            Some(total) if written > total => {
                remove_file_if_exists(dest).await?;
                return Err(Error::Integrity {
                    path: dest.to_path_buf(),
                    expected: format!("{total} bytes"),
                    actual: format!("{written} bytes"),
                });
            }
            Some(_) => {}
            None => {
                if let Some(expected) = request.spec.expected_size
                    && expected != written
                {
                    tracing::warn!(
                        url,
                        expected,
                        written,
                        "stream size differs from declared size"
                    );
                }
                self.with_state(|s| s.total_bytes = Some(written));
            }
        }

        self.complete(served_etag.as_deref()).await
    }

    /// Stream the response body into `writer`, one chunk at a time
    async fn copy_body(
        &self,
        response: reqwest::Response,
        writer: &mut BufWriter<tokio::fs::File>,
        written: &mut u64,
        url: &str,
    ) -> Result<()> {
        let request = &self.request;
        let timeout = self.fetcher.transfer.per_attempt_timeout;
        let mut body = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => return Err(Error::Cancelled),
                next = tokio::time::timeout(timeout, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(Error::Timeout {
                        url: url.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| Error::disk(request.destination, e))?;
            *written += chunk.len() as u64;
            self.transferred
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            self.with_state(|s| s.bytes_fetched = *written);
            request.progress.update(self.event());
        }
    }

    async fn complete(&self, served_etag: Option<&str>) -> Result<TransferOutcome> {
        let request = &self.request;
        if let Some(checksum) = &request.spec.checksum {
            verify(request.destination, checksum, served_etag).await?;
        }

        self.set_status(TransferStatus::Completed);
        let (total_bytes, attempts) = self.with_state(|s| (s.bytes_fetched, s.attempts));
        let resumed_from = self
            .resumed_from
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .unwrap_or(0);

        tracing::info!(
            episode = %request.episode_id,
            stream = request.stream_index,
            kind = %request.spec.kind,
            total_bytes,
            resumed_from,
            attempts,
            "stream complete"
        );

        Ok(TransferOutcome {
            path: request.destination.to_path_buf(),
            total_bytes,
            bytes_transferred: self.transferred.load(Ordering::Relaxed),
            resumed_from,
            attempts,
        })
    }

    fn finish(&self, result: &Result<TransferOutcome>) {
        let Err(e) = result else {
            return;
        };
        let status = match e.kind() {
            ErrorKind::Cancelled => TransferStatus::PausedResumable,
            _ => TransferStatus::Failed,
        };
        self.set_status(status);
        tracing::warn!(
            episode = %self.request.episode_id,
            stream = self.request.stream_index,
            kind = %self.request.spec.kind,
            error = %e,
            "stream transfer stopped"
        );
    }
}
