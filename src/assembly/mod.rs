//! Post-download assembly
//!
//! Once every stream of an episode is on disk, exactly one assembly action
//! runs: the media tracks are muxed into the final container, or, for an
//! episode with only comment data, the danmaku is converted. Sidecar files
//! (converted danmaku, subtitles, `.nfo` metadata) are written next to the
//! output afterwards.
//!
//! ## Architecture
//!
//! Both external steps sit behind traits so the pipeline never depends on a
//! particular binary:
//!
//! - [`Muxer`]: [`FfmpegMuxer`] runs ffmpeg, [`ConcatMuxer`] concatenates
//!   the inputs byte for byte (identity assembly, used when no muxing is
//!   wanted and in tests), [`UnavailableMuxer`] stands in when ffmpeg is
//!   missing
//! - [`DanmakuConverter`]: [`CommandConverter`] runs an external program,
//!   [`PassthroughConverter`] keeps the raw XML
//!
//! The external tools are treated as black boxes. A failed or cancelled run
//! may leave a partial output behind; [`PartialOutput`] removes it on every
//! exit path unless the configured [`PartialOutputPolicy`] says otherwise.
//!
//! [`PartialOutputPolicy`]: crate::config::PartialOutputPolicy

mod concat;
mod danmaku;
mod ffmpeg;
mod format;
mod guard;
mod process;
mod sidecar;
mod unavailable;

pub use concat::ConcatMuxer;
pub use danmaku::{CommandConverter, PassthroughConverter};
pub use ffmpeg::FfmpegMuxer;
pub use format::{is_flac, output_extension, with_extension_appended};
pub use guard::PartialOutput;
pub use sidecar::{move_file, subtitle_path, write_nfo, write_subtitle};
pub use unavailable::UnavailableMuxer;

use crate::error::Result;
use crate::types::{Resolution, StreamKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// One completed stream handed to the muxer
#[derive(Clone, Debug)]
pub struct MuxInput {
    /// Stream file on disk
    pub path: PathBuf,
    /// Video or audio
    pub kind: StreamKind,
    /// Codec reported by the site, if known
    pub codec: Option<String>,
}

/// Everything a muxer needs for one episode
#[derive(Clone, Debug)]
pub struct MuxJob {
    /// Inputs in declaration order
    pub inputs: Vec<MuxInput>,
    /// Final output path, extension included
    pub output: PathBuf,
}

impl MuxJob {
    /// First input of the given kind
    pub fn input(&self, kind: StreamKind) -> Option<&MuxInput> {
        self.inputs.iter().find(|i| i.kind == kind)
    }
}

/// Combines completed media streams into the final output
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Write `job.output` from `job.inputs`
    ///
    /// On error or cancellation the output may be partially written; the
    /// caller owns its cleanup.
    async fn mux(&self, job: &MuxJob, cancel: &CancellationToken) -> Result<()>;

    /// Name for logs
    fn name(&self) -> &'static str;
}

/// Turns raw danmaku data into an overlay format
#[async_trait]
pub trait DanmakuConverter: Send + Sync {
    /// Convert `input` and write `output`
    ///
    /// `resolution` is the video size the overlay is laid out for.
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Extension of the files this converter writes (without the dot)
    fn extension(&self) -> &str;

    /// Name for logs
    fn name(&self) -> &'static str;
}
