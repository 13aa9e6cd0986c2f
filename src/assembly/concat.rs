//! Identity assembly

use super::{MuxJob, Muxer};
use crate::error::{AssemblyError, Error, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Writes the inputs back to back into the output, unchanged
///
/// Suitable for streams that are already complete containers (a single
/// progressive file split only for transfer) and for exercising the
/// pipeline without ffmpeg.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConcatMuxer;

#[async_trait]
impl Muxer for ConcatMuxer {
    async fn mux(&self, job: &MuxJob, cancel: &CancellationToken) -> Result<()> {
        if job.inputs.is_empty() {
            return Err(AssemblyError::NoInputs {
                path: job.output.clone(),
            }
            .into());
        }

        let mut output = tokio::fs::File::create(&job.output)
            .await
            .map_err(|e| Error::disk(&job.output, e))?;

        for input in &job.inputs {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let mut source = tokio::fs::File::open(&input.path)
                .await
                .map_err(|e| Error::disk(&input.path, e))?;
            tokio::io::copy(&mut source, &mut output)
                .await
                .map_err(|e| Error::disk(&job.output, e))?;
        }

        output
            .flush()
            .await
            .map_err(|e| Error::disk(&job.output, e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "concat"
    }
}
