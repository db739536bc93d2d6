use std::time::Duration;

use thiserror::Error;

use crate::process::{ProcessError, ProcessHandle, StopOutcome};

use super::{FrameGeometry, RawFrame};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Incomplete frame data: {got}/{want} bytes")]
    IncompleteFrame { got: usize, want: usize },
    #[error("No frame data received")]
    NoData,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Cuts the decoder's unframed stdout into fixed-size frames.
pub struct FrameSource {
    handle: ProcessHandle,
    geometry: FrameGeometry,
}

impl FrameSource {
    pub fn new(handle: ProcessHandle, geometry: FrameGeometry) -> Self {
        Self { handle, geometry }
    }

    /// A short read means the decoder died or lost sync; the partial frame is discarded.
    pub async fn read_frame(&mut self) -> Result<RawFrame, FrameError> {
        let want = self.geometry.frame_byte_size();
        let mut data = vec![0u8; want];
        let got = self.handle.read_stdout(&mut data).await?;

        if got == 0 {
            return Err(FrameError::NoData);
        }
        data.truncate(got);

        RawFrame::new(data, self.geometry).map_err(|partial| FrameError::IncompleteFrame {
            got: partial.len(),
            want,
        })
    }

    pub fn last_error(&self) -> Option<String> {
        self.handle.last_error()
    }

    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ProcessError> {
        self.handle.stop(grace).await
    }
}
