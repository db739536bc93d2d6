pub mod ffmpeg;
mod handle;

use crate::pipeline::SourceDescriptor;

pub use ffmpeg::FfmpegLauncher;
pub use handle::{ProcessDescriptor, ProcessError, ProcessHandle, ProcessRole, StopOutcome};

/// Builds the command lines for a session's child processes.
pub trait ProcessLauncher: Send {
    fn decoder(&self, source: &SourceDescriptor) -> ProcessDescriptor;
    fn encoder(&self) -> ProcessDescriptor;
}
