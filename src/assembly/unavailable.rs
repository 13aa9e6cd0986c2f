//! Muxer used when no ffmpeg is available

use super::{MuxJob, Muxer};
use crate::error::{AssemblyError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Muxer that always fails
///
/// Lets a run without ffmpeg still complete audio-only, danmaku-only and
/// subtitle-only episodes; episodes that need muxing fail with an
/// assembly error instead of the whole run refusing to start.
///
/// ```
/// use episode_dl::assembly::{MuxJob, Muxer, UnavailableMuxer};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let job = MuxJob { inputs: Vec::new(), output: "ep.mp4".into() };
/// let result = UnavailableMuxer.mux(&job, &CancellationToken::new()).await;
/// assert!(result.is_err());
/// # }
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableMuxer;

#[async_trait]
impl Muxer for UnavailableMuxer {
    async fn mux(&self, _job: &MuxJob, _cancel: &CancellationToken) -> Result<()> {
        Err(AssemblyError::Spawn {
            tool: "ffmpeg".into(),
            reason: "ffmpeg not found. Configure ffmpeg_path or ensure ffmpeg is in PATH.".into(),
        }
        .into())
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
