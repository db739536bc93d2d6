mod controller;

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::analytics::Decision;

pub use controller::{PipelineController, PipelineError, TickOutcome};

/// Where a session's frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    File(PathBuf),
    Camera { device: String },
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::File(path) => write!(f, "file:{}", path.display()),
            SourceDescriptor::Camera { device } => write!(f, "camera:{}", device),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Faulted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: RunState,
    pub source: Option<String>,
    pub frames: u64,
    pub score: f64,
    pub last_decision: Option<Decision>,
    pub actuator_level: Option<bool>,
    pub message: String,
    pub decoder_error: Option<String>,
    pub encoder_error: Option<String>,
}

type Reply = oneshot::Sender<Result<(), PipelineError>>;

pub(crate) enum Command {
    Start(SourceDescriptor, Reply),
    Stop(Reply),
    Reset(Reply),
    Shutdown(Reply),
}

/// Cloneable front end to a [`PipelineController`] running on its own task.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PipelineStatus>,
}

impl PipelineHandle {
    pub fn spawn(controller: PipelineController) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let status = controller.subscribe();
        let task = tokio::spawn(controller.run(rx));
        (
            Self {
                commands: tx,
                status,
            },
            task,
        )
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    pub async fn start(&self, source: SourceDescriptor) -> Result<(), PipelineError> {
        self.request(|reply| Command::Start(source, reply)).await
    }

    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.request(Command::Stop).await
    }

    pub async fn reset(&self) -> Result<(), PipelineError> {
        self.request(Command::Reset).await
    }

    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.request(Command::Shutdown).await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), PipelineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| PipelineError::Closed)?;
        response.await.map_err(|_| PipelineError::Closed)?
    }
}
