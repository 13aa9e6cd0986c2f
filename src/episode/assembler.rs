//! Stream Assembler

use super::Notifier;
use crate::assembly::{
    CommandConverter, DanmakuConverter, FfmpegMuxer, MuxInput, MuxJob, Muxer, PartialOutput,
    PassthroughConverter, UnavailableMuxer, output_extension, subtitle_path,
    with_extension_appended, write_nfo, write_subtitle,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transfer::{FetchRequest, HttpFetcher, StreamFetcher};
use crate::types::{
    ArtifactDisposition, EpisodeDescriptor, EpisodeResult, Event, SkipReason, StreamKind,
    StreamSpec, TransferOutcome,
};
use crate::utils::{check_disk_space, remove_dir_if_empty, remove_file_if_exists};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Pluggable collaborators of the pipeline
#[derive(Clone)]
pub struct Components {
    /// Moves stream bytes to disk
    pub fetcher: Arc<dyn StreamFetcher>,
    /// Combines media streams
    pub muxer: Arc<dyn Muxer>,
    /// Converts raw danmaku
    pub converter: Arc<dyn DanmakuConverter>,
}

impl Components {
    /// Production components: HTTP fetcher, ffmpeg muxer, and the configured
    /// danmaku command (raw XML passthrough when none is set)
    ///
    /// A missing ffmpeg is not an error here; episodes that need muxing
    /// fail individually instead.
    pub fn from_config(config: &Config) -> Result<Self> {
        let muxer: Arc<dyn Muxer> = match FfmpegMuxer::from_config(&config.assembly) {
            Ok(muxer) => Arc::new(muxer),
            Err(e) => {
                tracing::warn!(error = %e, "ffmpeg unavailable, episodes with media will fail");
                Arc::new(UnavailableMuxer)
            }
        };
        let command = config.assembly.danmaku_command.as_deref();
        let converter: Arc<dyn DanmakuConverter> = match command {
            Some([program, args @ ..]) => Arc::new(
                CommandConverter::new(program, args.iter().cloned()).with_config(&config.assembly),
            ),
            _ => Arc::new(PassthroughConverter),
        };
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(config)?),
            muxer,
            converter,
        })
    }
}

/// The single assembly action of an episode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Primary {
    /// Mux the media streams
    Mux,
    /// Convert the danmaku stream at this index
    Danmaku(usize),
    /// Only sidecars (subtitles, metadata); the first one is the output
    Sidecars,
}

#[derive(Debug)]
struct Plan {
    primary: Primary,
    output: Option<PathBuf>,
}

impl Plan {
    fn new(episode: &EpisodeDescriptor, config: &Config, danmaku_ext: &str) -> Self {
        let stem = &episode.output_stem;
        let video = episode.first_of(StreamKind::Video).map(|(_, s)| s);
        let audio = episode.first_of(StreamKind::Audio).map(|(_, s)| s);

        if video.is_some() || audio.is_some() {
            let ext = output_extension(&config.assembly, video, audio);
            return Self {
                primary: Primary::Mux,
                output: Some(with_extension_appended(stem, &ext)),
            };
        }
        if let Some((index, _)) = episode.first_of(StreamKind::Danmaku) {
            return Self {
                primary: Primary::Danmaku(index),
                output: Some(with_extension_appended(stem, danmaku_ext)),
            };
        }
        let output = match episode.first_of(StreamKind::Subtitle) {
            Some((_, sub)) => Some(subtitle_path(stem, sub.language.as_deref())),
            None => episode
                .metadata
                .as_ref()
                .map(|_| with_extension_appended(stem, "nfo")),
        };
        Self {
            primary: Primary::Sidecars,
            output,
        }
    }
}

/// Drives the transfers and the assembly of one episode
pub struct StreamAssembler {
    config: Arc<Config>,
    components: Components,
    notifier: Notifier,
}

impl StreamAssembler {
    /// Create an assembler
    pub fn new(config: Arc<Config>, components: Components, notifier: Notifier) -> Self {
        Self {
            config,
            components,
            notifier,
        }
    }

    /// Progress and event outlets
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Produce the terminal result of `episode`
    pub async fn assemble(
        &self,
        episode: &EpisodeDescriptor,
        cancel: &CancellationToken,
    ) -> EpisodeResult {
        match self.try_assemble(episode, cancel).await {
            Ok(result) => result,
            Err(e) => EpisodeResult::from_error(&e, ArtifactDisposition::Retained),
        }
    }

    /// Like [`assemble`](Self::assemble), but errors that must abort the
    /// whole run (see [`Error::is_run_fatal`]) are returned instead of
    /// being folded into a result
    pub async fn try_assemble(
        &self,
        episode: &EpisodeDescriptor,
        cancel: &CancellationToken,
    ) -> Result<EpisodeResult> {
        let config = &self.config;
        let plan = Plan::new(episode, config, self.components.converter.extension());
        let Some(planned_output) = plan.output.clone() else {
            return Ok(EpisodeResult::Skipped {
                reason: SkipReason::NothingToDownload,
            });
        };

        let skip_if_exists = episode
            .skip_if_exists
            .unwrap_or(config.download.skip_if_exists);
        if tokio::fs::try_exists(&planned_output).await.unwrap_or(false) {
            if skip_if_exists {
                tracing::info!(
                    episode_id = %episode.id,
                    path = %planned_output.display(),
                    "output exists, skipping"
                );
                return Ok(EpisodeResult::Skipped {
                    reason: SkipReason::OutputExists {
                        path: planned_output,
                    },
                });
            }
            tracing::info!(
                episode_id = %episode.id,
                path = %planned_output.display(),
                "overwriting existing output"
            );
            remove_file_if_exists(&planned_output).await?;
        }

        let temp_root = &config.download.temp_dir;
        let temp_dir = episode.temp_dir(temp_root);
        if !episode.streams.is_empty() {
            if let Err(e) =
                check_disk_space(&config.disk_space, temp_root, episode.declared_size())
            {
                tracing::error!(episode_id = %episode.id, error = %e, "disk space precheck failed");
                return Ok(EpisodeResult::from_error(&e, ArtifactDisposition::Retained));
            }
            tokio::fs::create_dir_all(&temp_dir)
                .await
                .map_err(|e| Error::disk(&temp_dir, e))?;
        }

        let outcomes = self.fetch_all(episode, cancel).await;
        if cancel.is_cancelled() {
            return Ok(self.cancelled(episode).await);
        }

        let mut completed: BTreeMap<usize, TransferOutcome> = BTreeMap::new();
        let mut required_error: Option<Error> = None;
        let mut optional_error: Option<Error> = None;
        let mut warnings = Vec::new();

        for (index, result) in outcomes.into_iter().enumerate() {
            let spec = &episode.streams[index];
            match result {
                Ok(outcome) => {
                    completed.insert(index, outcome);
                }
                Err(e) if e.is_run_fatal() => {
                    self.discard_temporaries(episode).await;
                    return Err(e);
                }
                Err(e) if spec.required => {
                    // Sibling cancellations are a consequence, keep the cause
                    if required_error
                        .as_ref()
                        .is_none_or(|prev| matches!(prev, Error::Cancelled))
                    {
                        required_error = Some(e);
                    }
                }
                Err(Error::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(
                        episode_id = %episode.id,
                        stream = index,
                        kind = %spec.kind,
                        error = %e,
                        "optional stream failed"
                    );
                    warnings.push(format!("{} stream {} failed: {}", spec.kind, index, e));
                    optional_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = required_error {
            let artifacts = self.discard_temporaries(episode).await;
            return Ok(EpisodeResult::from_error(&e, artifacts));
        }

        self.notifier.emit(Event::Assembling {
            id: episode.id.clone(),
            output: planned_output.clone(),
        });

        let mut output = None;
        if plan.primary == Primary::Mux {
            match self.mux(episode, &completed, &planned_output, cancel).await {
                Ok(path) => output = Some(path),
                Err(e) => {
                    tracing::error!(episode_id = %episode.id, error = %e, "assembly failed");
                    let artifacts = self.discard_temporaries(episode).await;
                    return Ok(EpisodeResult::from_error(&e, artifacts));
                }
            }
        }

        let mut sidecars = Vec::new();
        for (index, spec) in episode.streams.iter().enumerate() {
            let Some(outcome) = completed.get(&index) else {
                continue;
            };
            match spec.kind {
                StreamKind::Danmaku => {
                    let is_primary = plan.primary == Primary::Danmaku(index);
                    let target = if is_primary {
                        planned_output.clone()
                    } else {
                        self.danmaku_path(episode, index)
                    };
                    match self
                        .convert_danmaku(episode, spec, outcome, &target, cancel)
                        .await
                    {
                        Ok(path) if is_primary => output = Some(path),
                        Ok(path) => sidecars.push(path),
                        Err(Error::Cancelled) => return Ok(self.cancelled(episode).await),
                        Err(e) if is_primary => {
                            tracing::error!(episode_id = %episode.id, error = %e, "danmaku conversion failed");
                            let artifacts = self.discard_temporaries(episode).await;
                            return Ok(EpisodeResult::from_error(&e, artifacts));
                        }
                        Err(e) => {
                            tracing::warn!(episode_id = %episode.id, error = %e, "danmaku conversion failed");
                            warnings.push(format!("danmaku stream {index} not converted: {e}"));
                        }
                    }
                }
                StreamKind::Subtitle => {
                    match write_subtitle(
                        &outcome.path,
                        &episode.output_stem,
                        spec.language.as_deref(),
                    )
                    .await
                    {
                        Ok(path) => sidecars.push(path),
                        Err(e) => {
                            tracing::warn!(episode_id = %episode.id, error = %e, "subtitle not written");
                            warnings.push(format!("subtitle stream {index} not written: {e}"));
                            optional_error.get_or_insert(e);
                        }
                    }
                }
                StreamKind::Video | StreamKind::Audio => {}
            }
        }

        if let Some(metadata) = &episode.metadata {
            match write_nfo(&episode.output_stem, metadata).await {
                Ok(path) => sidecars.push(path),
                Err(e) => {
                    tracing::warn!(episode_id = %episode.id, error = %e, "metadata not written");
                    warnings.push(format!("metadata not written: {e}"));
                    optional_error.get_or_insert(e);
                }
            }
        }

        let output = match output {
            Some(path) => path,
            None if !sidecars.is_empty() => sidecars.remove(0),
            None => {
                let e = optional_error.unwrap_or_else(|| {
                    Error::InvalidInput(format!("episode {} produced no output", episode.id))
                });
                let artifacts = self.discard_temporaries(episode).await;
                return Ok(EpisodeResult::from_error(&e, artifacts));
            }
        };

        if !config.download.keep_intermediates {
            for outcome in completed.values() {
                if let Err(e) = remove_file_if_exists(&outcome.path).await {
                    tracing::warn!(error = %e, "failed to remove intermediate stream file");
                }
            }
            if let Err(e) = remove_dir_if_empty(&temp_dir).await {
                tracing::warn!(error = %e, "failed to remove episode temp dir");
            }
        }

        tracing::info!(
            episode_id = %episode.id,
            output = %output.display(),
            sidecars = sidecars.len(),
            warnings = warnings.len(),
            "Episode assembled"
        );
        Ok(EpisodeResult::Success {
            output,
            sidecars,
            warnings,
        })
    }

    /// Fetch every stream, at most `max_concurrent_transfers_per_episode` at once
    ///
    /// A failed required stream stops its siblings early; they keep their
    /// partial files.
    async fn fetch_all(
        &self,
        episode: &EpisodeDescriptor,
        cancel: &CancellationToken,
    ) -> Vec<Result<TransferOutcome>> {
        let limit = Semaphore::new(self.config.download.max_concurrent_transfers_per_episode);
        let transfers_cancel = cancel.child_token();

        let mut pending: FuturesUnordered<_> = episode
            .streams
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let limit = &limit;
                let transfers_cancel = &transfers_cancel;
                async move {
                    let result = self
                        .fetch_one(episode, index, spec, limit, transfers_cancel)
                        .await;
                    (index, result)
                }
            })
            .collect();

        let mut results: Vec<Option<Result<TransferOutcome>>> =
            episode.streams.iter().map(|_| None).collect();

        while let Some((index, result)) = pending.next().await {
            if let Err(e) = &result {
                let required = episode.streams[index].required;
                if e.is_run_fatal() || (required && !matches!(e, Error::Cancelled)) {
                    transfers_cancel.cancel();
                }
            }
            results[index] = Some(result);
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(Error::Cancelled)))
            .collect()
    }

    async fn fetch_one(
        &self,
        episode: &EpisodeDescriptor,
        index: usize,
        spec: &StreamSpec,
        limit: &Semaphore,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = limit.acquire() => permit.map_err(|_| Error::Cancelled)?,
        };

        let stream_cancel = cancel.child_token();
        let destination = episode.stream_temp_path(&self.config.download.temp_dir, index);
        self.components
            .fetcher
            .fetch(FetchRequest {
                episode_id: &episode.id,
                stream_index: index,
                spec,
                destination: &destination,
                resume: true,
                cancel: &stream_cancel,
                progress: self.notifier.progress(),
            })
            .await
    }

    async fn mux(
        &self,
        episode: &EpisodeDescriptor,
        completed: &BTreeMap<usize, TransferOutcome>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let inputs = episode
            .streams
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.kind.is_media())
            .filter_map(|(index, spec)| {
                completed.get(&index).map(|outcome| MuxInput {
                    path: outcome.path.clone(),
                    kind: spec.kind,
                    codec: spec.codec.clone(),
                })
            })
            .collect();
        let job = MuxJob {
            inputs,
            output: output.to_path_buf(),
        };

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::disk(parent, e))?;
        }

        tracing::info!(
            episode_id = %episode.id,
            muxer = self.components.muxer.name(),
            output = %output.display(),
            "Assembling episode"
        );
        let guard = PartialOutput::new(output, self.config.assembly.partial_output);
        self.components.muxer.mux(&job, cancel).await?;
        Ok(guard.disarm())
    }

    /// Sidecar path of a danmaku stream that is not the primary output
    fn danmaku_path(&self, episode: &EpisodeDescriptor, index: usize) -> PathBuf {
        let ext = self.components.converter.extension();
        let nth = episode
            .streams
            .iter()
            .take(index)
            .filter(|s| s.kind == StreamKind::Danmaku)
            .count();
        if nth == 0 {
            with_extension_appended(&episode.output_stem, ext)
        } else {
            with_extension_appended(&episode.output_stem, &format!("{nth}.{ext}"))
        }
    }

    async fn convert_danmaku(
        &self,
        episode: &EpisodeDescriptor,
        spec: &StreamSpec,
        outcome: &TransferOutcome,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let resolution = episode
            .first_of(StreamKind::Video)
            .and_then(|(_, v)| v.resolution)
            .unwrap_or_default();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::disk(parent, e))?;
        }

        let guard = PartialOutput::new(target, self.config.assembly.partial_output);
        let result = self
            .components
            .converter
            .convert(&outcome.path, target, resolution, cancel)
            .await;

        // Raw danmaku is consumed whether or not conversion worked
        if spec.temporary
            && !matches!(result, Err(Error::Cancelled))
            && let Err(e) = remove_file_if_exists(&outcome.path).await
        {
            tracing::warn!(error = %e, "failed to remove raw danmaku");
        }

        result?;
        Ok(guard.disarm())
    }

    /// Result for a cancelled episode, dropping its partial files if configured
    async fn cancelled(&self, episode: &EpisodeDescriptor) -> EpisodeResult {
        if self.config.download.discard_partial_on_cancel {
            let temp_root = &self.config.download.temp_dir;
            for index in 0..episode.streams.len() {
                let path = episode.stream_temp_path(temp_root, index);
                if let Err(e) = remove_file_if_exists(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove partial stream");
                }
            }
            if let Err(e) = remove_dir_if_empty(&episode.temp_dir(temp_root)).await {
                tracing::warn!(error = %e, "failed to remove episode temp dir");
            }
        }
        EpisodeResult::Cancelled
    }

    /// Delete temporary stream files; report whether anything is left
    async fn discard_temporaries(&self, episode: &EpisodeDescriptor) -> ArtifactDisposition {
        let temp_root = &self.config.download.temp_dir;
        for (index, spec) in episode.streams.iter().enumerate() {
            if !spec.temporary {
                continue;
            }
            let path = episode.stream_temp_path(temp_root, index);
            if let Err(e) = remove_file_if_exists(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary stream");
            }
        }

        let temp_dir = episode.temp_dir(temp_root);
        if remove_dir_if_empty(&temp_dir).await.is_ok()
            && !tokio::fs::try_exists(&temp_dir).await.unwrap_or(true)
        {
            ArtifactDisposition::Cleaned
        } else {
            ArtifactDisposition::Retained
        }
    }
}
