use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::actuator::{ActuatorController, ActuatorError};
use crate::analytics::{
    Decision, DetectionAccumulator, Inference, InferenceAdapter, InferenceError,
};
use crate::config::{Config, ConfigError};
use crate::frame::{FrameError, FrameGeometry, FrameSource, RawFrame, StreamSink};
use crate::process::{ProcessError, ProcessHandle, ProcessLauncher};

use super::{Command, PipelineStatus, RunState, SourceDescriptor};

const STATUS_EVERY_FRAMES: u64 = 10;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start {role}: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: ProcessError,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("inference task failed: {0}")]
    InferenceTask(#[from] JoinError),
    #[error("inference adapter was lost in a failed inference task")]
    AdapterLost,
    #[error("inference returned {got} bytes for a {want} byte frame")]
    AnnotatedFrameSize { got: usize, want: usize },
    #[error("actuator failed: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("pipeline is faulted, reset required")]
    Faulted,
    #[error("pipeline controller has shut down")]
    Closed,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// No session is running.
    Idle,
    Processed { decision: Option<Decision> },
    /// The decoder stream ended or lost sync; the session is back to idle.
    SessionEnded(FrameError),
}

/// Owns one decoder session at a time plus the persistent restream encoder,
/// and runs the read → infer → write → accumulate → actuate tick.
pub struct PipelineController {
    geometry: FrameGeometry,
    tick_period: Duration,
    decoder_grace: Duration,
    encoder_grace: Duration,
    encoder_respawn: Duration,
    launcher: Box<dyn ProcessLauncher>,
    adapter: Option<Box<dyn InferenceAdapter>>,
    actuator: ActuatorController,
    accumulator: DetectionAccumulator,
    state: RunState,
    session: Option<SourceDescriptor>,
    source: Option<FrameSource>,
    sink: Option<StreamSink>,
    encoder_spawned_at: Option<Instant>,
    ticker: Option<Interval>,
    frames: u64,
    last_decision: Option<Decision>,
    message: String,
    decoder_error: Option<String>,
    encoder_error: Option<String>,
    status: watch::Sender<PipelineStatus>,
}

impl PipelineController {
    pub fn new(
        config: &Config,
        launcher: Box<dyn ProcessLauncher>,
        adapter: Box<dyn InferenceAdapter>,
        actuator: ActuatorController,
    ) -> Result<Self, PipelineError> {
        let geometry = config.geometry()?;
        let message = "Be ready".to_string();
        let (status, _) = watch::channel(PipelineStatus {
            state: RunState::Idle,
            source: None,
            frames: 0,
            score: 0.0,
            last_decision: None,
            actuator_level: None,
            message: message.clone(),
            decoder_error: None,
            encoder_error: None,
        });

        Ok(Self {
            geometry,
            tick_period: config.pipeline.tick_period(),
            decoder_grace: config.decoder.stop_grace(),
            encoder_grace: config.stream.stop_grace(),
            encoder_respawn: config.stream.respawn_interval(),
            launcher,
            adapter: Some(adapter),
            actuator,
            accumulator: DetectionAccumulator::new(config.accumulator.clone()),
            state: RunState::Idle,
            session: None,
            source: None,
            sink: None,
            encoder_spawned_at: None,
            ticker: None,
            frames: 0,
            last_decision: None,
            message,
            decoder_error: None,
            encoder_error: None,
            status,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }

    /// Starts a session, stopping the current one first when switching sources.
    pub async fn start(&mut self, source: SourceDescriptor) -> Result<(), PipelineError> {
        match self.state {
            RunState::Faulted => return Err(PipelineError::Faulted),
            RunState::Running | RunState::Starting => self.stop().await?,
            RunState::Idle | RunState::Stopping => {}
        }

        tracing::info!(session = %source, geometry = %self.geometry, "starting session");
        self.set_state(RunState::Starting);

        if let Err(e) = self.ensure_encoder().await {
            return Err(self.abort_start("encoder", e));
        }

        let decoder = match ProcessHandle::start(&self.launcher.decoder(&source)) {
            Ok(handle) => handle,
            Err(e) => return Err(self.abort_start("decoder", e)),
        };

        self.source = Some(FrameSource::new(decoder, self.geometry));
        self.decoder_error = None;
        self.accumulator.reset();
        self.frames = 0;
        self.last_decision = None;

        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);

        self.session = Some(source);
        self.message = "on-air...".to_string();
        self.set_state(RunState::Running);
        Ok(())
    }

    /// No-op unless a session is running.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        if !matches!(self.state, RunState::Running | RunState::Starting) {
            return Ok(());
        }
        self.message = "stopped".to_string();
        self.end_session().await?;
        Ok(())
    }

    /// Leaves `Faulted`; a no-op in every other state.
    pub fn reset(&mut self) {
        if self.state != RunState::Faulted {
            return;
        }
        tracing::info!("pipeline reset");
        self.message = "reset".to_string();
        self.set_state(RunState::Idle);
    }

    /// Stops the session and the persistent encoder.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        let session = self.stop().await;
        if let Some(mut sink) = self.sink.take() {
            sink.stop(self.encoder_grace).await?;
        }
        self.publish();
        session
    }

    pub async fn tick(&mut self) -> Result<TickOutcome, PipelineError> {
        if self.state != RunState::Running {
            return Ok(TickOutcome::Idle);
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(TickOutcome::Idle);
        };

        let frame = match source.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    session = ?self.session,
                    frames = self.frames,
                    error = %e,
                    decoder_error = ?source.last_error(),
                    "frame source failed, stopping session"
                );
                self.message = e.to_string();
                if let Err(stop_err) = self.end_session().await {
                    tracing::warn!(error = %stop_err, "decoder did not stop cleanly");
                }
                return Ok(TickOutcome::SessionEnded(e));
            }
        };

        let inference = match self.infer(frame).await {
            Ok(inference) => inference,
            Err(e) => return Err(self.fault(e).await),
        };

        let want = self.geometry.frame_byte_size();
        if inference.annotated.len() != want {
            let err = PipelineError::AnnotatedFrameSize {
                got: inference.annotated.len(),
                want,
            };
            return Err(self.fault(err).await);
        }

        self.restream(&inference.annotated).await;

        let decision = self.accumulator.update(&inference.detections);
        if let Some(decision) = decision {
            self.last_decision = Some(decision);
            if let Err(e) = self.actuator.apply(decision) {
                return Err(self.fault(e.into()).await);
            }
        }

        self.frames += 1;
        if self.frames % STATUS_EVERY_FRAMES == 0 {
            self.message = format!("Playing ... Frame: {}", self.frames);
        }
        tracing::trace!(
            frames = self.frames,
            detections = inference.detections.len(),
            "tick"
        );
        self.publish();

        Ok(TickOutcome::Processed { decision })
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(source, reply)) => {
                        let _ = reply.send(self.start(source).await);
                    }
                    Some(Command::Stop(reply)) => {
                        let _ = reply.send(self.stop().await);
                    }
                    Some(Command::Reset(reply)) => {
                        self.reset();
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(self.shutdown().await);
                        break;
                    }
                    None => {
                        if let Err(e) = self.shutdown().await {
                            tracing::warn!(error = %e, "shutdown failed");
                        }
                        break;
                    }
                },
                _ = next_tick(&mut self.ticker) => match self.tick().await {
                    Ok(TickOutcome::SessionEnded(e)) => {
                        tracing::info!(error = %e, "decoder stream ended");
                    }
                    Ok(TickOutcome::Processed { decision: Some(decision) }) => {
                        tracing::trace!(decision = ?decision, "decision applied");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "pipeline faulted"),
                }
            }
        }
        tracing::info!("pipeline controller stopped");
    }

    /// Runs the adapter on the blocking pool. The tick awaits it, so ticks never overlap.
    async fn infer(&mut self, frame: RawFrame) -> Result<Inference, PipelineError> {
        let mut adapter = self.adapter.take().ok_or(PipelineError::AdapterLost)?;
        let (adapter, result) = tokio::task::spawn_blocking(move || {
            let result = adapter.infer(&frame);
            (adapter, result)
        })
        .await?;
        self.adapter = Some(adapter);
        Ok(result?)
    }

    async fn ensure_encoder(&mut self) -> Result<(), ProcessError> {
        if let Some(mut sink) = self.sink.take() {
            if sink.is_running() {
                self.sink = Some(sink);
                return Ok(());
            }
            tracing::warn!(encoder_error = ?sink.last_error(), "encoder exited, respawning");
            sink.stop(self.encoder_grace).await?;
        }

        self.encoder_spawned_at = Some(Instant::now());
        let handle = ProcessHandle::start(&self.launcher.encoder())?;
        self.sink = Some(StreamSink::new(handle, self.geometry));
        self.encoder_error = None;
        Ok(())
    }

    fn abort_start(&mut self, role: &'static str, source: ProcessError) -> PipelineError {
        tracing::error!(role, error = %source, "failed to start session");
        self.ticker = None;
        self.session = None;
        self.message = format!("failed to start {}: {}", role, source);
        self.set_state(RunState::Idle);
        PipelineError::Spawn { role, source }
    }

    /// A failed write stops and drops the encoder. Later ticks respawn it, at most
    /// once per respawn interval; frames in between are not restreamed.
    async fn restream(&mut self, data: &[u8]) {
        if self.sink.is_none() {
            if !self.encoder_respawn_due() {
                return;
            }
            match self.ensure_encoder().await {
                Ok(()) => tracing::info!("encoder respawned"),
                Err(e) => {
                    tracing::warn!(error = %e, "encoder respawn failed");
                    self.encoder_error = Some(e.to_string());
                    return;
                }
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let Err(e) = sink.write_frame(data).await else {
            return;
        };

        self.encoder_error = sink.last_error();
        tracing::warn!(
            error = %e,
            encoder_error = ?self.encoder_error,
            "restream write failed, dropping encoder"
        );
        self.message = format!("stream error: {}", e);

        if let Some(mut sink) = self.sink.take() {
            if let Err(stop_err) = sink.stop(self.encoder_grace).await {
                tracing::warn!(error = %stop_err, "encoder did not stop cleanly");
            }
        }
    }

    fn encoder_respawn_due(&self) -> bool {
        self.encoder_spawned_at
            .map_or(true, |at| at.elapsed() >= self.encoder_respawn)
    }

    /// Running → Stopping → Idle. The tick is disarmed before the decoder is torn down.
    async fn end_session(&mut self) -> Result<(), ProcessError> {
        self.set_state(RunState::Stopping);
        self.ticker = None;

        let result = self.release_decoder().await;

        if let Some(session) = self.session.take() {
            tracing::info!(session = %session, frames = self.frames, "session stopped");
        }
        self.set_state(RunState::Idle);
        result
    }

    async fn release_decoder(&mut self) -> Result<(), ProcessError> {
        let Some(mut source) = self.source.take() else {
            return Ok(());
        };
        let result = source.stop(self.decoder_grace).await.map(|_| ());
        self.decoder_error = source.last_error().or(self.decoder_error.take());
        result
    }

    async fn fault(&mut self, err: PipelineError) -> PipelineError {
        tracing::error!(session = ?self.session, error = %err, "unrecoverable pipeline error");
        self.ticker = None;
        if let Err(stop_err) = self.release_decoder().await {
            tracing::warn!(error = %stop_err, "decoder did not stop cleanly");
        }
        self.session = None;
        self.message = err.to_string();
        self.set_state(RunState::Faulted);
        err
    }

    fn set_state(&mut self, state: RunState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "pipeline state");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let decoder_error = self
            .source
            .as_ref()
            .and_then(FrameSource::last_error)
            .or_else(|| self.decoder_error.clone());
        let encoder_error = self
            .sink
            .as_ref()
            .and_then(StreamSink::last_error)
            .or_else(|| self.encoder_error.clone());

        self.status.send_replace(PipelineStatus {
            state: self.state,
            source: self.session.as_ref().map(ToString::to_string),
            frames: self.frames,
            score: self.accumulator.state().score,
            last_decision: self.last_decision,
            actuator_level: self.actuator.level(),
            message: self.message.clone(),
            decoder_error,
            encoder_error,
        });
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::RecordingLine;
    use crate::analytics::Detection;
    use crate::pipeline::PipelineHandle;
    use crate::process::{ProcessDescriptor, ProcessRole};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::ThreadId;
    use tokio::task::JoinHandle;

    const FRAME: usize = 10 * 10 * 3;

    struct ScriptLauncher {
        decoder: String,
        encoder: String,
    }

    impl ScriptLauncher {
        fn frames(count: usize, tail: usize) -> Self {
            Self {
                decoder: format!("head -c {} /dev/zero", count * FRAME + tail),
                encoder: "cat >/dev/null".to_string(),
            }
        }

        /// Closes stdout after the frames, then ignores SIGTERM until killed.
        fn frames_then_linger(count: usize, tail: usize) -> Self {
            Self {
                decoder: format!(
                    "head -c {} /dev/zero; exec >&-; trap '' TERM; exec sleep 30",
                    count * FRAME + tail
                ),
                encoder: "cat >/dev/null".to_string(),
            }
        }

        fn descriptor(name: &str, script: &str, role: ProcessRole) -> ProcessDescriptor {
            ProcessDescriptor {
                name: name.to_string(),
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                role,
                fps: 10,
                geometry: FrameGeometry::new(10, 10).unwrap(),
            }
        }
    }

    impl ProcessLauncher for ScriptLauncher {
        fn decoder(&self, source: &SourceDescriptor) -> ProcessDescriptor {
            let mut descriptor = Self::descriptor("decoder", &self.decoder, ProcessRole::Decoder);
            if let SourceDescriptor::File(path) = source {
                if path.starts_with("/nonexistent") {
                    descriptor.program = path.display().to_string();
                }
            }
            descriptor
        }

        fn encoder(&self) -> ProcessDescriptor {
            Self::descriptor("encoder", &self.encoder, ProcessRole::Encoder)
        }
    }

    /// Echoes the frame back and reports the same detections every frame.
    #[derive(Clone, Default)]
    struct FixedAdapter {
        detections: Vec<Detection>,
        truncate_output: bool,
        panics: bool,
        delay: Duration,
        calls: Arc<Mutex<usize>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        threads: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl InferenceAdapter for FixedAdapter {
        fn infer(&mut self, frame: &RawFrame) -> Result<Inference, InferenceError> {
            if self.panics {
                panic!("model crashed");
            }
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            *self.calls.lock().unwrap() += 1;
            self.threads.lock().unwrap().push(std::thread::current().id());
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }

            let mut annotated = frame.as_bytes().to_vec();
            if self.truncate_output {
                annotated.pop();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Inference {
                annotated,
                detections: self.detections.clone(),
            })
        }
    }

    /// Collects every distinct run state published until the controller goes away.
    fn record_states(mut status: watch::Receiver<PipelineStatus>) -> JoinHandle<Vec<RunState>> {
        tokio::spawn(async move {
            let mut states = vec![status.borrow_and_update().state];
            while status.changed().await.is_ok() {
                let state = status.borrow_and_update().state;
                if states.last() != Some(&state) {
                    states.push(state);
                }
            }
            states
        })
    }

    fn config() -> Config {
        Config::parse(
            r#"
[geometry]
width = 10
height = 10

[pipeline]
tick_ms = 1

[decoder]
stop_grace_ms = 500

[stream]
stop_grace_ms = 500
respawn_interval_ms = 0
"#,
        )
        .unwrap()
    }

    fn controller(
        launcher: ScriptLauncher,
        adapter: FixedAdapter,
        line: RecordingLine,
    ) -> PipelineController {
        PipelineController::new(
            &config(),
            Box::new(launcher),
            Box::new(adapter),
            ActuatorController::new(Box::new(line)),
        )
        .unwrap()
    }

    fn file_source() -> SourceDescriptor {
        SourceDescriptor::File(PathBuf::from("clip.mp4"))
    }

    fn target(confidence: f32) -> Detection {
        Detection {
            class_id: 0,
            confidence,
        }
    }

    async fn run_ticks(controller: &mut PipelineController, n: usize) -> Vec<Option<Decision>> {
        let mut decisions = Vec::new();
        for i in 0..n {
            match controller.tick().await.unwrap() {
                TickOutcome::Processed { decision } => decisions.push(decision),
                other => panic!("tick {i}: unexpected {other:?}"),
            }
        }
        decisions
    }

    #[tokio::test]
    async fn empty_frames_end_safe() {
        let line = RecordingLine::default();
        let mut controller = controller(
            ScriptLauncher::frames(50, 0),
            FixedAdapter::default(),
            line.clone(),
        );
        controller.start(file_source()).await.unwrap();
        assert_eq!(controller.state(), RunState::Running);

        let decisions = run_ticks(&mut controller, 50).await;
        assert_eq!(decisions[49], Some(Decision::Safe));
        assert_eq!(*line.writes.lock().unwrap(), vec![true]);

        let status = controller.subscribe().borrow().clone();
        assert_eq!(status.frames, 50);
        assert_eq!(status.score, 0.0);
        assert_eq!(status.actuator_level, Some(true));
        assert_eq!(status.message, "Playing ... Frame: 50");

        assert!(matches!(
            controller.tick().await.unwrap(),
            TickOutcome::SessionEnded(FrameError::NoData)
        ));
        assert_eq!(controller.state(), RunState::Idle);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn confident_detections_trigger() {
        let line = RecordingLine::default();
        let adapter = FixedAdapter {
            detections: vec![target(0.9)],
            ..FixedAdapter::default()
        };
        let mut controller = controller(ScriptLauncher::frames(50, 0), adapter, line.clone());
        controller.start(file_source()).await.unwrap();

        let decisions = run_ticks(&mut controller, 50).await;
        assert_eq!(decisions[49], Some(Decision::Triggered));
        assert_eq!(*line.writes.lock().unwrap(), vec![false]);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn truncated_frame_stops_session_without_actuating() {
        let line = RecordingLine::default();
        let mut controller = controller(
            ScriptLauncher::frames_then_linger(29, FRAME * 2 / 5),
            FixedAdapter::default(),
            line.clone(),
        );
        let states = record_states(controller.subscribe());
        controller.start(file_source()).await.unwrap();

        run_ticks(&mut controller, 29).await;
        match controller.tick().await.unwrap() {
            TickOutcome::SessionEnded(FrameError::IncompleteFrame { got, want }) => {
                assert_eq!(got, 120);
                assert_eq!(want, FRAME);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(controller.state(), RunState::Idle);
        assert!(controller.ticker.is_none());
        assert!(controller.source.is_none());
        assert!(line.writes.lock().unwrap().is_empty());
        let status = controller.subscribe().borrow().clone();
        assert_eq!(status.message, "Incomplete frame data: 120/300 bytes");
        assert!(status.source.is_none());

        assert!(matches!(controller.tick().await.unwrap(), TickOutcome::Idle));
        controller.shutdown().await.unwrap();
        drop(controller);

        let states = states.await.unwrap();
        assert!(
            states.ends_with(&[RunState::Running, RunState::Stopping, RunState::Idle]),
            "states: {states:?}"
        );
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let mut controller = controller(
            ScriptLauncher::frames(1, 0),
            FixedAdapter::default(),
            RecordingLine::default(),
        );
        let before = controller.subscribe().borrow().clone();

        controller.stop().await.unwrap();
        controller.stop().await.unwrap();

        let after = controller.subscribe().borrow().clone();
        assert_eq!(controller.state(), RunState::Idle);
        assert_eq!(before.message, after.message);
        assert_eq!(after.state, RunState::Idle);
    }

    #[tokio::test]
    async fn stop_ends_running_session() {
        let launcher = ScriptLauncher {
            decoder: "exec sleep 30".to_string(),
            encoder: "cat >/dev/null".to_string(),
        };
        let mut controller = controller(launcher, FixedAdapter::default(), RecordingLine::default());
        controller.start(file_source()).await.unwrap();

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), RunState::Idle);
        assert!(controller.ticker.is_none());
        assert_eq!(controller.subscribe().borrow().message, "stopped");
        assert!(matches!(controller.tick().await.unwrap(), TickOutcome::Idle));
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn switching_source_restarts_session() {
        let mut controller = controller(
            ScriptLauncher::frames(5, 0),
            FixedAdapter::default(),
            RecordingLine::default(),
        );
        controller.start(file_source()).await.unwrap();
        run_ticks(&mut controller, 3).await;

        let camera = SourceDescriptor::Camera {
            device: "/dev/video0".to_string(),
        };
        controller.start(camera).await.unwrap();
        assert_eq!(controller.state(), RunState::Running);

        let status = controller.subscribe().borrow().clone();
        assert_eq!(status.source.as_deref(), Some("camera:/dev/video0"));
        assert_eq!(status.frames, 0);

        // The new decoder starts from its own first frame.
        run_ticks(&mut controller, 5).await;
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn decoder_spawn_failure_returns_to_idle() {
        let mut controller = controller(
            ScriptLauncher::frames(1, 0),
            FixedAdapter::default(),
            RecordingLine::default(),
        );
        let source = SourceDescriptor::File(PathBuf::from("/nonexistent/ffmpeg"));
        let err = controller.start(source).await.unwrap_err();

        assert!(matches!(err, PipelineError::Spawn { role: "decoder", .. }));
        assert_eq!(controller.state(), RunState::Idle);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wrong_size_annotation_faults_until_reset() {
        let line = RecordingLine::default();
        let adapter = FixedAdapter {
            truncate_output: true,
            ..FixedAdapter::default()
        };
        let mut controller = controller(ScriptLauncher::frames(5, 0), adapter, line.clone());
        controller.start(file_source()).await.unwrap();

        let err = controller.tick().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AnnotatedFrameSize { got, want } if got == FRAME - 1 && want == FRAME
        ));
        assert_eq!(controller.state(), RunState::Faulted);

        assert!(matches!(
            controller.start(file_source()).await,
            Err(PipelineError::Faulted)
        ));

        controller.reset();
        assert_eq!(controller.state(), RunState::Idle);
        assert!(line.writes.lock().unwrap().is_empty());
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn actuator_failure_faults() {
        let line = RecordingLine {
            fail: true,
            ..RecordingLine::default()
        };
        let mut controller = controller(
            ScriptLauncher::frames(50, 0),
            FixedAdapter::default(),
            line,
        );
        controller.start(file_source()).await.unwrap();

        run_ticks(&mut controller, 49).await;
        let err = controller.tick().await.unwrap_err();
        assert!(matches!(err, PipelineError::Actuator(_)));
        assert_eq!(controller.state(), RunState::Faulted);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dead_encoder_does_not_stop_session() {
        let launcher = ScriptLauncher {
            decoder: format!("head -c {} /dev/zero", 50 * FRAME),
            encoder: "exit 0".to_string(),
        };
        let line = RecordingLine::default();
        let mut controller = controller(launcher, FixedAdapter::default(), line.clone());
        controller.start(file_source()).await.unwrap();

        let decisions = run_ticks(&mut controller, 50).await;
        assert_eq!(decisions[49], Some(Decision::Safe));
        assert_eq!(controller.state(), RunState::Running);
        assert_eq!(*line.writes.lock().unwrap(), vec![true]);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn encoder_respawns_after_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let launcher = ScriptLauncher {
            decoder: format!("head -c {} /dev/zero", 10 * FRAME),
            encoder: format!(
                "if [ -e '{0}' ]; then exec cat >/dev/null; else touch '{0}'; exit 0; fi",
                marker.display()
            ),
        };
        let mut controller = controller(launcher, FixedAdapter::default(), RecordingLine::default());
        controller.start(file_source()).await.unwrap();

        // The first encoder exits without reading anything.
        for _ in 0..200 {
            if !controller.sink.as_mut().unwrap().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        run_ticks(&mut controller, 1).await;
        assert!(controller.sink.is_none());
        assert!(controller
            .subscribe()
            .borrow()
            .message
            .starts_with("stream error"));

        run_ticks(&mut controller, 1).await;
        assert!(marker.exists());
        assert!(controller.sink.as_mut().unwrap().is_running());

        run_ticks(&mut controller, 8).await;
        assert!(controller.sink.as_mut().unwrap().is_running());
        assert_eq!(controller.state(), RunState::Running);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn encoder_respawn_is_rate_limited() {
        let launcher = ScriptLauncher {
            decoder: format!("head -c {} /dev/zero", 10 * FRAME),
            encoder: "exit 0".to_string(),
        };
        let mut controller = controller(launcher, FixedAdapter::default(), RecordingLine::default());
        controller.encoder_respawn = Duration::from_secs(60);
        controller.start(file_source()).await.unwrap();

        for _ in 0..200 {
            if !controller.sink.as_mut().unwrap().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        run_ticks(&mut controller, 10).await;
        assert!(controller.sink.is_none());
        assert_eq!(controller.state(), RunState::Running);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn inference_runs_off_the_controller_thread() {
        let adapter = FixedAdapter::default();
        let threads = Arc::clone(&adapter.threads);
        let mut controller = controller(ScriptLauncher::frames(3, 0), adapter, RecordingLine::default());
        controller.start(file_source()).await.unwrap();

        run_ticks(&mut controller, 3).await;
        let here = std::thread::current().id();
        let threads = threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|id| *id != here));
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_adapter_faults() {
        let adapter = FixedAdapter {
            panics: true,
            ..FixedAdapter::default()
        };
        let line = RecordingLine::default();
        let mut controller = controller(ScriptLauncher::frames(5, 0), adapter, line.clone());
        controller.start(file_source()).await.unwrap();

        let err = controller.tick().await.unwrap_err();
        assert!(matches!(err, PipelineError::InferenceTask(_)));
        assert_eq!(controller.state(), RunState::Faulted);

        controller.reset();
        controller.start(file_source()).await.unwrap();
        let err = controller.tick().await.unwrap_err();
        assert!(matches!(err, PipelineError::AdapterLost));
        assert_eq!(controller.state(), RunState::Faulted);
        assert!(line.writes.lock().unwrap().is_empty());
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn slow_inference_never_overlaps_ticks() {
        let adapter = FixedAdapter {
            delay: Duration::from_millis(15),
            ..FixedAdapter::default()
        };
        let calls = Arc::clone(&adapter.calls);
        let max_active = Arc::clone(&adapter.max_active);
        let controller = controller(ScriptLauncher::frames(12, 0), adapter, RecordingLine::default());
        let (handle, task) = PipelineHandle::spawn(controller);

        let mut status = handle.subscribe();
        let observer = tokio::spawn(async move {
            let mut frames = Vec::new();
            while status.changed().await.is_ok() {
                let (state, count) = {
                    let s = status.borrow_and_update();
                    (s.state, s.frames)
                };
                frames.push(count);
                if state == RunState::Idle && count == 12 {
                    break;
                }
            }
            frames
        });

        handle.start(file_source()).await.unwrap();
        let frames = tokio::time::timeout(Duration::from_secs(20), observer)
            .await
            .unwrap()
            .unwrap();

        assert!(frames.windows(2).all(|w| w[0] <= w[1]), "frames: {frames:?}");
        assert_eq!(frames.last(), Some(&12));
        assert_eq!(*calls.lock().unwrap(), 12);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn handle_drives_ticks_until_stream_ends() {
        let adapter = FixedAdapter {
            detections: vec![target(0.9)],
            ..FixedAdapter::default()
        };
        let calls = Arc::clone(&adapter.calls);
        let line = RecordingLine::default();
        let controller = controller(ScriptLauncher::frames(100, 0), adapter, line.clone());
        let (handle, task) = PipelineHandle::spawn(controller);

        handle.start(file_source()).await.unwrap();
        let mut status = handle.subscribe();
        let ended = tokio::time::timeout(
            Duration::from_secs(20),
            status.wait_for(|s| s.state == RunState::Idle && s.frames == 100),
        )
        .await
        .is_ok();
        assert!(ended, "status: {:?}", handle.status());

        assert_eq!(*calls.lock().unwrap(), 100);
        assert_eq!(*line.writes.lock().unwrap(), vec![false, false]);
        assert_eq!(handle.status().last_decision, Some(Decision::Triggered));
        assert_eq!(handle.status().message, "No frame data received");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.stop().await, Err(PipelineError::Closed)));
    }
}
