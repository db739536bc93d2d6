use std::time::Duration;

use thiserror::Error;

use crate::process::{ProcessError, ProcessHandle, StopOutcome};

use super::FrameGeometry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("refusing to stream {got} bytes, frame is {want}")]
    FrameSize { got: usize, want: usize },
    #[error(transparent)]
    Write(#[from] ProcessError),
}

/// Pushes raw frames into the encoder's stdin.
pub struct StreamSink {
    handle: ProcessHandle,
    geometry: FrameGeometry,
}

impl StreamSink {
    pub fn new(handle: ProcessHandle, geometry: FrameGeometry) -> Self {
        Self { handle, geometry }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let want = self.geometry.frame_byte_size();
        if data.len() != want {
            return Err(SinkError::FrameSize {
                got: data.len(),
                want,
            });
        }
        self.handle.write_stdin(data).await?;
        Ok(())
    }

    pub fn is_running(&mut self) -> bool {
        self.handle.is_running()
    }

    pub fn last_error(&self) -> Option<String> {
        self.handle.last_error()
    }

    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ProcessError> {
        self.handle.stop(grace).await
    }
}
