//! The pipeline controller.
//!
//! [`Pipeline`] is a handle to a single actor task that owns every piece of
//! mutable pipeline state: the current run, the peer sessions and the
//! counters reported by `status`. Commands arrive over an mpsc channel and are
//! answered through oneshot senders. Run tasks report back over a second
//! channel, tagged with the generation of the run that spawned them; events
//! from any other generation are dropped.
//!
//! ```text
//! Idle --start--> Starting --discovered--> Running
//!   ^                |                        |
//!   |   timeout/exit/io error          stop/exit/io error
//!   +------------- Stopping <-----------------+
//! ```

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    convert::convert,
    encoder::H264Encoder,
    error::PipelineError,
    event::{RunEvent, RunEventKind, RunEventReceiver, RunEventSender},
    fanout::{Fanout, FanoutStream},
    framer::{FixedFramer, MarkerFramer},
    layout::PixelLayout,
    peer::{
        PeerEvent, PeerEventReceiver, PeerEventSender, PeerSessionManager, SessionId, negotiate,
    },
    probe::{Discovery, ProbeEvent},
    source::{SourceDescriptor, SourceInfo, list_sources},
    supervisor::{EncoderCommand, Supervisor},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub capture_bin: PathBuf,
    pub list_bin: PathBuf,
    /// `None` disables the motion-JPEG path.
    pub encoder: Option<EncoderCommand>,
    /// Used when the capture process does not report a frame rate.
    pub default_fps: f64,
    pub discovery_timeout: Duration,
    pub stop_grace: Duration,
    pub switch_settle: Duration,
    pub h264_bitrate: u32,
    pub ice_urls: Vec<String>,
    pub jpeg_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_bin: PathBuf::from("./ndi_recv"),
            list_bin: PathBuf::from("./ndi_list"),
            encoder: Some(EncoderCommand::new("ffmpeg", 80)),
            default_fps: 30.0,
            discovery_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            switch_settle: Duration::from_millis(1000),
            h264_bitrate: 2_500_000,
            ice_urls: vec![],
            jpeg_buffer: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Running { layout: PixelLayout },
    Stopping,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running { .. } => "running",
            PipelineState::Stopping => "stopping",
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Starting | PipelineState::Running { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    AlreadyRunning,
    Started,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    AlreadyStopped,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchOutcome {
    Switching,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub running: bool,
    pub state: &'static str,
    pub source_name: Option<String>,
    pub resolution: Option<String>,
    pub pixel_format: Option<String>,
    pub fps: f64,
    pub latency_ms: f64,
    pub active_consumer_count: usize,
    pub jpeg_clients: usize,
    pub jpeg_enabled: bool,
    pub peers: usize,
    pub generation: u64,
    pub teardowns: u64,
    pub last_error: Option<ErrorInfo>,
}

enum PipelineCommand {
    Start {
        source: Option<String>,
        result: oneshot::Sender<Result<StartOutcome, PipelineError>>,
    },
    Stop {
        result: oneshot::Sender<StopOutcome>,
    },
    SwitchSource {
        source: String,
        result: oneshot::Sender<Result<SwitchOutcome, PipelineError>>,
    },
    Status {
        result: oneshot::Sender<PipelineStatus>,
    },
    Offer {
        sdp: String,
        result: oneshot::Sender<Result<String, PipelineError>>,
    },
    Shutdown {
        result: oneshot::Sender<()>,
    },
}

pub struct Pipeline {
    cancel: CancellationToken,
    tx: mpsc::Sender<PipelineCommand>,
    config: Arc<PipelineConfig>,
    jpeg: Fanout<Bytes>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(64);
        let jpeg = Fanout::new(config.jpeg_buffer);

        let (peer_tx, peer_rx) = mpsc::channel(64);
        let peers = PeerSessionManager::new(config.ice_urls.clone(), peer_tx.clone())?;
        let state = PipelineActor::new(Arc::clone(&config), peers, peer_tx, jpeg.clone());

        let cancel_clone = cancel.clone();
        tokio::spawn(async move { PipelineActor::inner_loop(state, cancel_clone, rx, peer_rx).await });
        Ok(Self {
            cancel,
            tx,
            config,
            jpeg,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PipelineCommand,
    ) -> Result<T, PipelineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| PipelineError::Closed)?;
        rx.await.map_err(|_| PipelineError::Closed)
    }

    /// Starts a run for `source`, or for the last selected source.
    pub async fn start(&self, source: Option<String>) -> Result<StartOutcome, PipelineError> {
        self.request(|result| PipelineCommand::Start { source, result })
            .await?
    }

    pub async fn stop(&self) -> Result<StopOutcome, PipelineError> {
        self.request(|result| PipelineCommand::Stop { result }).await
    }

    /// Tears down the current run and starts `source` after the settle delay.
    pub async fn switch_source(&self, source: &str) -> Result<SwitchOutcome, PipelineError> {
        let source = source.to_string();
        self.request(|result| PipelineCommand::SwitchSource { source, result })
            .await?
    }

    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        self.request(|result| PipelineCommand::Status { result })
            .await
    }

    /// Answers a viewer's SDP offer. Fails with `NotRunning` while idle.
    pub async fn offer(&self, sdp: String) -> Result<String, PipelineError> {
        self.request(|result| PipelineCommand::Offer { sdp, result })
            .await?
    }

    pub fn subscribe_jpeg(&self) -> FanoutStream<Bytes> {
        self.jpeg.stream()
    }

    pub fn jpeg_enabled(&self) -> bool {
        self.config.encoder.is_some()
    }

    pub async fn list_sources(&self) -> anyhow::Result<Vec<SourceInfo>> {
        list_sources(&self.config.list_bin, self.config.discovery_timeout).await
    }

    /// Tears down any run and stops the actor.
    pub async fn shutdown(&self) {
        if self
            .request(|result| PipelineCommand::Shutdown { result })
            .await
            .is_err()
        {
            log::debug!("pipeline already shut down");
        }
        self.cancel.cancel();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything that belongs to one generation.
struct RunState {
    supervisor: Supervisor,
    source: SourceDescriptor,
    layout: Option<PixelLayout>,
    frame_duration: Duration,
    framer: Option<FixedFramer>,
    jpeg_framer: MarkerFramer,
    h264: Option<H264Encoder>,
}

struct PendingSwitch {
    at: tokio::time::Instant,
    source: SourceDescriptor,
}

/// Frames per second over a sliding one-second window.
#[derive(Default)]
struct FrameMeter {
    window_start: Option<Instant>,
    count: usize,
    fps: f64,
    last_frame: Option<Instant>,
}

impl FrameMeter {
    fn record(&mut self, frames: usize) {
        if frames == 0 {
            return;
        }
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.count += frames;
        self.last_frame = Some(now);
        let elapsed = now.duration_since(start);
        if elapsed >= FPS_WINDOW {
            self.fps = self.count as f64 / elapsed.as_secs_f64();
            self.window_start = Some(now);
            self.count = 0;
        }
    }

    fn fps(&self) -> f64 {
        match self.last_frame {
            Some(last) if last.elapsed() < FPS_WINDOW * 2 => self.fps,
            _ => 0.0,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct PipelineActor {
    config: Arc<PipelineConfig>,
    state: PipelineState,
    generation: u64,
    teardowns: u64,
    source: Option<SourceDescriptor>,
    run: Option<RunState>,
    pending_switch: Option<PendingSwitch>,
    run_tx: RunEventSender,
    run_rx: RunEventReceiver,
    peers: PeerSessionManager,
    peer_tx: PeerEventSender,
    jpeg: Fanout<Bytes>,
    meter: FrameMeter,
    latency: Duration,
    last_error: Option<ErrorInfo>,
    /// Offer callers waiting for their session's handshake to finish.
    pending_offers: HashMap<SessionId, oneshot::Sender<Result<String, PipelineError>>>,
}

impl PipelineActor {
    fn new(
        config: Arc<PipelineConfig>,
        peers: PeerSessionManager,
        peer_tx: PeerEventSender,
        jpeg: Fanout<Bytes>,
    ) -> Self {
        let (run_tx, run_rx) = mpsc::channel(64);
        Self {
            config,
            state: PipelineState::Idle,
            generation: 0,
            teardowns: 0,
            source: None,
            run: None,
            pending_switch: None,
            run_tx,
            run_rx,
            peers,
            peer_tx,
            jpeg,
            meter: FrameMeter::default(),
            latency: Duration::ZERO,
            last_error: None,
            pending_offers: HashMap::new(),
        }
    }

    async fn inner_loop(
        mut state: PipelineActor,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<PipelineCommand>,
        mut peer_rx: PeerEventReceiver,
    ) {
        loop {
            let settle_at = state.pending_switch.as_ref().map(|p| p.at);
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(PipelineCommand::Shutdown { result }) => {
                        state.pending_switch = None;
                        state.teardown().await;
                        let _ = result.send(());
                        break;
                    }
                    Some(cmd) => {
                        if let Err(e) = state.inner_command_handler(cmd).await {
                            log::error!("pipeline command error: {:#}", e);
                        }
                    }
                    None => break,
                },
                Some(event) = state.run_rx.recv() => state.handle_run_event(event).await,
                Some(event) = peer_rx.recv() => state.handle_peer_event(event),
                _ = sleep_until_opt(settle_at) => state.finish_switch(),
            }
        }
        state.teardown().await;
        log::info!("pipeline actor stopped");
    }

    async fn inner_command_handler(&mut self, cmd: PipelineCommand) -> anyhow::Result<()> {
        match cmd {
            PipelineCommand::Start { source, result } => {
                let outcome = self.start(source);
                result
                    .send(outcome)
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            PipelineCommand::Stop { result } => {
                let outcome = self.stop().await;
                result
                    .send(outcome)
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            PipelineCommand::SwitchSource { source, result } => {
                let outcome = self.switch_source(&source).await;
                result
                    .send(outcome)
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            PipelineCommand::Status { result } => {
                result
                    .send(self.status())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            PipelineCommand::Offer { sdp, result } => self.offer(sdp, result).await,
            PipelineCommand::Shutdown { result } => {
                let _ = result.send(());
            }
        }
        Ok(())
    }

    fn start(&mut self, source: Option<String>) -> Result<StartOutcome, PipelineError> {
        if self.state.is_active() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        let source = match source {
            Some(name) => SourceDescriptor::parse(&name)?,
            None => self
                .pending_switch
                .as_ref()
                .map(|p| p.source.clone())
                .or_else(|| self.source.clone())
                .ok_or(PipelineError::InvalidSource("no source selected".into()))?,
        };
        // An explicit start supersedes a pending switch.
        self.pending_switch = None;
        self.launch(source)?;
        Ok(StartOutcome::Started)
    }

    /// The generation only advances once the capture process is running.
    fn launch(&mut self, source: SourceDescriptor) -> Result<(), PipelineError> {
        self.source = Some(source.clone());
        let generation = self.generation + 1;
        let supervisor = Supervisor::start(
            generation,
            &self.config.capture_bin,
            &source,
            self.config.discovery_timeout,
            self.config.stop_grace,
            self.run_tx.clone(),
        )
        .map_err(|e| {
            let error = PipelineError::Subprocess(format!("{:#}", e));
            self.record_error(&error);
            error
        })?;
        self.generation = generation;

        log::info!(
            "pipeline[{}] starting for {:?}",
            self.generation,
            source.normalized
        );
        self.run = Some(RunState {
            supervisor,
            source,
            layout: None,
            frame_duration: fps_duration(self.config.default_fps),
            framer: None,
            jpeg_framer: MarkerFramer::new(),
            h264: None,
        });
        self.state = PipelineState::Starting;
        Ok(())
    }

    async fn stop(&mut self) -> StopOutcome {
        let had_pending = self.pending_switch.take().is_some();
        if self.teardown().await || had_pending {
            StopOutcome::Stopped
        } else {
            StopOutcome::AlreadyStopped
        }
    }

    async fn switch_source(&mut self, name: &str) -> Result<SwitchOutcome, PipelineError> {
        let source = SourceDescriptor::parse(name)?;
        log::info!("pipeline: switching to {:?}", source.normalized);
        self.teardown().await;
        self.source = Some(source.clone());
        self.pending_switch = Some(PendingSwitch {
            at: tokio::time::Instant::now() + self.config.switch_settle,
            source,
        });
        Ok(SwitchOutcome::Switching)
    }

    fn finish_switch(&mut self) {
        let Some(pending) = self.pending_switch.take() else {
            return;
        };
        if self.state.is_active() {
            return;
        }
        if let Err(e) = self.launch(pending.source) {
            log::error!("pipeline: switch failed: {}", e);
        }
    }

    /// Single cleanup path for every way a run ends. Returns false when there
    /// was nothing to tear down.
    async fn teardown(&mut self) -> bool {
        let Some(run) = self.run.take() else {
            self.state = PipelineState::Idle;
            return false;
        };
        self.state = PipelineState::Stopping;
        self.peers.close_all();

        let RunState { supervisor, .. } = run;
        supervisor.stop().await;

        self.meter.reset();
        self.latency = Duration::ZERO;
        self.teardowns += 1;
        self.state = PipelineState::Idle;
        log::info!(
            "pipeline[{}] idle ({} teardowns)",
            self.generation,
            self.teardowns
        );
        true
    }

    async fn fail(&mut self, error: PipelineError) {
        log::error!("pipeline[{}] run failed: {}", self.generation, error);
        self.record_error(&error);
        self.teardown().await;
    }

    fn record_error(&mut self, error: &PipelineError) {
        self.last_error = Some(ErrorInfo {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    async fn handle_run_event(&mut self, event: RunEvent) {
        if event.generation != self.generation || !self.state.is_active() {
            log::trace!(
                "dropping event from generation {} (current {})",
                event.generation,
                self.generation
            );
            return;
        }
        match event.kind {
            RunEventKind::Probe(ProbeEvent::Discovered(discovery)) => {
                self.on_discovered(discovery).await
            }
            RunEventKind::Probe(ProbeEvent::Connected(line)) => {
                log::info!("pipeline[{}] source connected: {}", self.generation, line)
            }
            RunEventKind::Probe(_) => {}
            RunEventKind::ProbeTimedOut => {
                if self.state == PipelineState::Starting {
                    self.fail(PipelineError::DiscoveryTimeout(self.config.discovery_timeout))
                        .await;
                }
            }
            RunEventKind::RawChunk(chunk) => self.on_raw_chunk(chunk).await,
            RunEventKind::JpegChunk(chunk) => self.on_jpeg_chunk(chunk),
            RunEventKind::Exited { role, code } => {
                let code = code.map_or("signal".to_string(), |c| c.to_string());
                self.fail(PipelineError::Subprocess(format!(
                    "{} exited unexpectedly ({})",
                    role, code
                )))
                .await;
            }
            RunEventKind::IoError { role, error } => {
                self.fail(PipelineError::Subprocess(format!("{}: {}", role, error)))
                    .await;
            }
        }
    }

    async fn on_discovered(&mut self, discovery: Discovery) {
        if self.state != PipelineState::Starting {
            return;
        }
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let layout = discovery.layout;
        let fps = discovery.fps.unwrap_or(self.config.default_fps);
        if let Err(e) = run
            .supervisor
            .wire(&layout, fps, self.config.encoder.as_ref())
        {
            self.fail(PipelineError::Subprocess(format!("{:#}", e))).await;
            return;
        }
        run.layout = Some(layout);
        run.frame_duration = fps_duration(fps);
        run.framer = Some(FixedFramer::new(layout.frame_size()));
        self.state = PipelineState::Running { layout };
        log::info!(
            "pipeline[{}] running: {} @ {:.2} fps",
            self.generation,
            layout,
            fps
        );
    }

    async fn on_raw_chunk(&mut self, chunk: Bytes) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let (Some(layout), Some(framer)) = (run.layout, run.framer.as_mut()) else {
            return;
        };

        if !self.peers.is_active() {
            // Nobody is watching the peer path; keep alignment only.
            self.meter.record(framer.skip(&chunk));
            run.h264 = None;
            return;
        }

        let frames: Vec<Bytes> = framer.push(&chunk).collect();
        self.meter.record(frames.len());
        for frame in frames {
            let started = Instant::now();
            let planar = match convert(&frame, &layout) {
                Ok(planar) => planar,
                Err(e) => {
                    log::warn!("pipeline[{}] dropping frame: {:#}", self.generation, e);
                    continue;
                }
            };

            if run.h264.is_none() {
                match H264Encoder::new(
                    layout.width,
                    layout.height,
                    1.0 / run.frame_duration.as_secs_f64(),
                    self.config.h264_bitrate,
                ) {
                    Ok(encoder) => run.h264 = Some(encoder),
                    Err(e) => {
                        log::error!("pipeline[{}] h264 encoder: {:#}", self.generation, e);
                        return;
                    }
                }
            }
            let Some(encoder) = run.h264.as_mut() else {
                return;
            };
            let access_unit = match encoder.encode(&planar) {
                Ok(au) => au,
                Err(e) => {
                    log::warn!("pipeline[{}] dropping frame: {:#}", self.generation, e);
                    continue;
                }
            };
            if access_unit.is_empty() {
                continue;
            }
            if let Err(e) = self
                .peers
                .write_frame(access_unit, run.frame_duration)
                .await
            {
                log::warn!("pipeline[{}] track write: {:#}", self.generation, e);
            }
            self.latency = started.elapsed();
        }
    }

    fn on_jpeg_chunk(&mut self, chunk: Bytes) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        for jpeg in run.jpeg_framer.push(&chunk) {
            self.jpeg.publish(jpeg);
        }
    }

    async fn offer(&mut self, sdp: String, result: oneshot::Sender<Result<String, PipelineError>>) {
        if !self.state.is_active() {
            let _ = result.send(Err(PipelineError::NotRunning));
            return;
        }
        let (id, pc) = match self.peers.open_session().await {
            Ok(session) => session,
            Err(e) => {
                let _ = result.send(Err(e));
                return;
            }
        };

        // Answered from `handle_peer_event` once the handshake is done.
        self.pending_offers.insert(id, result);
        let events = self.peer_tx.clone();
        tokio::spawn(async move {
            let event = match tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&pc, sdp)).await {
                Ok(Ok(answer)) => PeerEvent::HandshakeComplete {
                    id,
                    answer: answer.sdp,
                },
                Ok(Err(e)) => PeerEvent::HandshakeFailed {
                    id,
                    error: format!("{:#}", e),
                },
                Err(_) => PeerEvent::HandshakeFailed {
                    id,
                    error: format!("timed out after {:?}", HANDSHAKE_TIMEOUT),
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let reply = match &event {
            PeerEvent::HandshakeComplete { id, answer } => {
                self.pending_offers.remove(id).map(|result| {
                    // The session may have been closed by a stop or restart meanwhile.
                    let outcome = match self.peers.session_state(*id) {
                        Some(_) => Ok(answer.clone()),
                        None => Err(PipelineError::Handshake("session closed".into())),
                    };
                    (result, outcome)
                })
            }
            PeerEvent::HandshakeFailed { id, error } => self
                .pending_offers
                .remove(id)
                .map(|result| (result, Err(PipelineError::Handshake(error.clone())))),
            PeerEvent::ConnectionState { .. } => None,
        };
        if let Some((result, outcome)) = reply {
            let _ = result.send(outcome);
        }

        if self.peers.handle_event(event) {
            // Start the new viewer on a keyframe.
            if let Some(encoder) = self.run.as_mut().and_then(|r| r.h264.as_mut()) {
                encoder.force_keyframe();
            }
        }
    }

    fn status(&self) -> PipelineStatus {
        let layout = self.run.as_ref().and_then(|r| r.layout);
        let jpeg_clients = self.jpeg.consumer_count();
        let peers = self.peers.active_count();
        PipelineStatus {
            running: self.state.is_active(),
            state: self.state.name(),
            source_name: self
                .run
                .as_ref()
                .map(|r| &r.source)
                .or(self.source.as_ref())
                .map(|s| s.normalized.clone()),
            resolution: layout.map(|l| l.resolution()),
            pixel_format: layout.map(|l| l.format.to_string()),
            fps: self.meter.fps(),
            latency_ms: self.latency.as_secs_f64() * 1000.0,
            active_consumer_count: jpeg_clients + peers,
            jpeg_clients,
            jpeg_enabled: self.config.encoder.is_some(),
            peers,
            generation: self.generation,
            teardowns: self.teardowns,
            last_error: self.last_error.clone(),
        }
    }
}

fn fps_duration(fps: f64) -> Duration {
    if fps.is_finite() && fps > 0.0 {
        Duration::from_secs_f64(1.0 / fps)
    } else {
        Duration::from_millis(33)
    }
}

async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
#[path = "pipeline_test.rs"]
mod pipeline_test;
