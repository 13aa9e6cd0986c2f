//! ffmpeg-based muxer

use super::process::run_tool;
use super::{MuxJob, Muxer};
use crate::config::AssemblyConfig;
use crate::error::{AssemblyError, Error, Result};
use crate::types::StreamKind;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Muxes video and audio tracks with an external `ffmpeg` binary
///
/// # Examples
///
/// ```no_run
/// use episode_dl::assembly::FfmpegMuxer;
/// use episode_dl::config::AssemblyConfig;
///
/// // Explicit path from config, or auto-discovery from PATH
/// let muxer = FfmpegMuxer::from_config(&AssemblyConfig::default())
///     .expect("ffmpeg not found");
/// ```
#[derive(Clone, Debug)]
pub struct FfmpegMuxer {
    binary_path: PathBuf,
    video_codec: String,
    audio_codec: String,
    timeout: Duration,
    threads: usize,
}

impl FfmpegMuxer {
    /// Create a muxer with an explicit binary path and default settings
    pub fn new(binary_path: PathBuf) -> Self {
        let defaults = AssemblyConfig::default();
        Self {
            binary_path,
            video_codec: defaults.video_codec,
            audio_codec: defaults.audio_codec,
            timeout: defaults.timeout,
            threads: default_threads(),
        }
    }

    /// Attempt to find ffmpeg in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffmpeg").ok().map(Self::new)
    }

    /// Build from config: explicit `ffmpeg_path` first, then PATH when allowed
    pub fn from_config(config: &AssemblyConfig) -> Result<Self> {
        let binary_path = match &config.ffmpeg_path {
            Some(path) => path.clone(),
            None if config.search_path => which::which("ffmpeg").map_err(|_| {
                Error::NotSupported(
                    "muxing requires ffmpeg. Configure ffmpeg_path or ensure ffmpeg is in PATH."
                        .into(),
                )
            })?,
            None => {
                return Err(Error::config(
                    "ffmpeg_path",
                    "no ffmpeg path configured and PATH search is disabled",
                ));
            }
        };

        Ok(Self {
            binary_path,
            video_codec: config.video_codec.clone(),
            audio_codec: config.audio_codec.clone(),
            timeout: config.timeout,
            threads: default_threads(),
        })
    }

    /// Path of the binary that will be run
    pub fn binary_path(&self) -> &std::path::Path {
        &self.binary_path
    }

    /// Command-line arguments for `job`
    pub fn build_args(&self, job: &MuxJob) -> Vec<OsString> {
        let video = job.input(StreamKind::Video);
        let audio = job.input(StreamKind::Audio);

        let lowercase = |codec: Option<&str>| codec.map(str::to_ascii_lowercase);
        let source_video_codec = video.and_then(|v| lowercase(v.codec.as_deref()));
        let source_audio_codec = audio.and_then(|a| lowercase(a.codec.as_deref()));

        // Apple players only accept HEVC tagged as hvc1
        let hvc1 = self.video_codec == "hevc"
            || (self.video_codec == "copy" && source_video_codec.as_deref() == Some("hevc"));

        let video_codec = if source_video_codec.as_deref() == Some(self.video_codec.as_str()) {
            "copy"
        } else {
            self.video_codec.as_str()
        };
        let audio_codec = if source_audio_codec.as_deref() == Some(self.audio_codec.as_str()) {
            "copy"
        } else {
            self.audio_codec.as_str()
        };

        let mut args: Vec<OsString> = Vec::new();
        for input in &job.inputs {
            args.push("-i".into());
            args.push(input.path.clone().into_os_string());
        }
        // ffmpeg keeps one track per kind unless every input is mapped
        let has_extra_tracks =
            job.inputs.len() > usize::from(video.is_some()) + usize::from(audio.is_some());
        if has_extra_tracks {
            for index in 0..job.inputs.len() {
                args.push("-map".into());
                args.push(index.to_string().into());
            }
        }
        if video.is_some() {
            args.push("-vcodec".into());
            args.push(video_codec.into());
        }
        if audio.is_some() {
            args.push("-acodec".into());
            args.push(audio_codec.into());
        }
        args.push("-strict".into());
        args.push("unofficial".into());
        if hvc1 && video.is_some() {
            args.push("-tag:v".into());
            args.push("hvc1".into());
        }
        args.push("-threads".into());
        args.push(self.threads.to_string().into());
        args.push("-y".into());
        args.push(job.output.clone().into_os_string());
        args
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, job: &MuxJob, cancel: &CancellationToken) -> Result<()> {
        if job.input(StreamKind::Video).is_none() && job.input(StreamKind::Audio).is_none() {
            return Err(AssemblyError::NoInputs {
                path: job.output.clone(),
            }
            .into());
        }

        let mut command = Command::new(&self.binary_path);
        command.args(self.build_args(job));
        run_tool("ffmpeg", command, self.timeout, cancel).await?;

        if !tokio::fs::try_exists(&job.output).await.unwrap_or(false) {
            return Err(AssemblyError::MissingOutput {
                tool: "ffmpeg".into(),
                path: job.output.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}
