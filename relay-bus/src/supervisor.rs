//! Subprocess ownership for one pipeline run.
//!
//! A [`Supervisor`] spawns the capture process, hands its diagnostic stream to
//! the probe and, once the layout is known, wires its data stream to the run's
//! event channel and optionally through the motion-JPEG encoder process.
//! Every task it starts tags its events with the run generation.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{ProcessRole, RunEventKind, RunEventSender, emit};
use crate::layout::PixelLayout;
use crate::probe::spawn_probe;
use crate::source::SourceDescriptor;

const READ_CHUNK: usize = 64 * 1024;

/// Command line of the external motion-JPEG encoder.
#[derive(Clone, Debug)]
pub struct EncoderCommand {
    pub bin: PathBuf,
    /// 1..=100, higher is better.
    pub quality: u8,
}

impl EncoderCommand {
    pub fn new(bin: impl Into<PathBuf>, quality: u8) -> Self {
        Self {
            bin: bin.into(),
            quality: quality.clamp(1, 100),
        }
    }

    /// Maps quality 1..=100 onto the encoder's 31..=1 scale.
    pub fn mjpeg_q(&self) -> u32 {
        ((100.0 - self.quality as f64) / 100.0 * 30.0 + 1.0).round() as u32
    }

    pub fn args(&self, layout: &PixelLayout, fps: f64) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            layout.format.encoder_pix_fmt().into(),
            "-s".into(),
            layout.resolution(),
            "-r".into(),
            format!("{}", fps),
            "-i".into(),
            "pipe:0".into(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-q:v".into(),
            self.mjpeg_q().to_string(),
            "pipe:1".into(),
        ]
    }
}

/// A spawned subprocess and the task waiting on it.
struct ProcessHandle {
    role: ProcessRole,
    kill: CancellationToken,
    watcher: JoinHandle<()>,
}

impl ProcessHandle {
    fn watch(
        mut child: Child,
        role: ProcessRole,
        generation: u64,
        tx: RunEventSender,
        run_cancel: CancellationToken,
    ) -> Self {
        let kill = CancellationToken::new();
        let kill_clone = kill.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let kind = match status {
                        Ok(status) => {
                            log::info!("{}[{}] exited: {}", role, generation, status);
                            RunEventKind::Exited { role, code: status.code() }
                        }
                        Err(e) => RunEventKind::IoError { role, error: format!("wait: {}", e) },
                    };
                    tokio::select! {
                        _ = emit(&tx, generation, kind) => {}
                        _ = run_cancel.cancelled() => {}
                    }
                }
                _ = kill_clone.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        log::warn!("{}[{}] kill: {}", role, generation, e);
                    }
                    match child.wait().await {
                        Ok(status) => log::info!("{}[{}] terminated: {}", role, generation, status),
                        Err(e) => log::error!("{}[{}] wait after kill: {}", role, generation, e),
                    }
                }
            }
        });
        Self {
            role,
            kill,
            watcher,
        }
    }

    /// Waits up to `grace` for a voluntary exit, then force-terminates.
    async fn terminate(mut self, grace: Duration) {
        if !grace.is_zero() && tokio::time::timeout(grace, &mut self.watcher).await.is_ok() {
            return;
        }
        if !grace.is_zero() {
            log::warn!("{} did not exit within {:?}, killing", self.role, grace);
        }
        self.kill.cancel();
        if let Err(e) = self.watcher.await {
            log::error!("{} watcher: {}", self.role, e);
        }
    }
}

pub struct Supervisor {
    generation: u64,
    tx: RunEventSender,
    /// Cancels every task of the run; the tee then closes the encoder's stdin.
    cancel: CancellationToken,
    capture: Option<ProcessHandle>,
    capture_stdout: Option<ChildStdout>,
    encoder: Option<ProcessHandle>,
    /// Encoder output tasks outlive `cancel` so the encoder can flush.
    encoder_output: CancellationToken,
    jpeg_reader: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl Supervisor {
    /// Spawns `<capture_bin> <source>` and starts probing its diagnostics.
    pub fn start(
        generation: u64,
        capture_bin: &Path,
        source: &SourceDescriptor,
        discovery_timeout: Duration,
        stop_grace: Duration,
        tx: RunEventSender,
    ) -> anyhow::Result<Self> {
        let mut child = Command::new(capture_bin)
            .arg(&source.normalized)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {}: {}", capture_bin.display(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or(anyhow::anyhow!("capture stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(anyhow::anyhow!("capture stderr not piped"))?;

        log::info!(
            "capture[{}] started for {:?} (pid {:?})",
            generation,
            source.normalized,
            child.id()
        );

        let cancel = CancellationToken::new();
        spawn_probe(
            stderr,
            generation,
            discovery_timeout,
            tx.clone(),
            cancel.child_token(),
        );
        let capture = ProcessHandle::watch(
            child,
            ProcessRole::Capture,
            generation,
            tx.clone(),
            cancel.clone(),
        );

        Ok(Self {
            generation,
            tx,
            cancel,
            capture: Some(capture),
            capture_stdout: Some(stdout),
            encoder: None,
            encoder_output: CancellationToken::new(),
            jpeg_reader: None,
            stop_grace,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    /// Starts reading the capture data stream. With an encoder command, the
    /// stream is also piped into a freshly spawned encoder whose output
    /// arrives as `JpegChunk` events. Failing to spawn the encoder is an
    /// error; the capture stream is not read in that case.
    pub fn wire(
        &mut self,
        layout: &PixelLayout,
        fps: f64,
        encoder: Option<&EncoderCommand>,
    ) -> anyhow::Result<()> {
        let stdout = self
            .capture_stdout
            .take()
            .ok_or(anyhow::anyhow!("capture stream already wired"))?;

        let encoder_stdin = match encoder {
            Some(command) => Some(self.spawn_encoder(command, layout, fps)?),
            None => None,
        };

        spawn_tee(
            stdout,
            encoder_stdin,
            self.generation,
            self.tx.clone(),
            self.cancel.child_token(),
        );
        Ok(())
    }

    fn spawn_encoder(
        &mut self,
        command: &EncoderCommand,
        layout: &PixelLayout,
        fps: f64,
    ) -> anyhow::Result<ChildStdin> {
        let args = command.args(layout, fps);
        log::debug!("encoder[{}] args: {:?}", self.generation, args);
        let mut child = Command::new(&command.bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {}: {}", command.bin.display(), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or(anyhow::anyhow!("encoder stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(anyhow::anyhow!("encoder stdout not piped"))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_log_lines(stderr, "encoder", self.encoder_output.child_token());
        }

        self.jpeg_reader = Some(spawn_jpeg_reader(
            stdout,
            self.generation,
            self.tx.clone(),
            self.encoder_output.child_token(),
        ));
        self.encoder = Some(ProcessHandle::watch(
            child,
            ProcessRole::Encoder,
            self.generation,
            self.tx.clone(),
            self.cancel.clone(),
        ));
        log::info!("encoder[{}] started for {}", self.generation, layout);
        Ok(stdin)
    }

    /// Tears the run down: closes the encoder input, gives the encoder the
    /// grace period to flush, then force-terminates both processes. The
    /// encoder's output keeps being read until it has exited.
    pub async fn stop(mut self) {
        log::info!("run[{}] stopping", self.generation);
        self.cancel.cancel();
        drop(self.capture_stdout.take());

        if let Some(encoder) = self.encoder.take() {
            encoder.terminate(self.stop_grace).await;
        }
        if let Some(mut reader) = self.jpeg_reader.take() {
            // The pipe reaches EOF once the encoder is gone.
            if tokio::time::timeout(self.stop_grace, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        self.encoder_output.cancel();
        if let Some(capture) = self.capture.take() {
            capture.terminate(Duration::ZERO).await;
        }
        log::info!("run[{}] stopped", self.generation);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.encoder_output.cancel();
        for process in [self.capture.take(), self.encoder.take()].into_iter().flatten() {
            process.kill.cancel();
        }
    }
}

/// Copies capture output to the encoder (if any) and to the event channel.
fn spawn_tee(
    mut stdout: ChildStdout,
    mut encoder_stdin: Option<ChildStdin>,
    generation: u64,
    tx: RunEventSender,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                read = stdout.read_buf(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        let kind = RunEventKind::IoError {
                            role: ProcessRole::Capture,
                            error: format!("data stream: {}", e),
                        };
                        tokio::select! {
                            _ = emit(&tx, generation, kind) => {}
                            _ = cancel.cancelled() => {}
                        }
                        break;
                    }
                },
            };
            if n == 0 {
                log::debug!("capture[{}] data stream closed", generation);
                break;
            }
            let chunk = buf.split().freeze();

            if let Some(stdin) = encoder_stdin.as_mut() {
                let written = tokio::select! {
                    _ = cancel.cancelled() => break,
                    written = stdin.write_all(&chunk) => written,
                };
                if let Err(e) = written {
                    log::warn!("encoder[{}] input closed: {}", generation, e);
                    encoder_stdin = None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = emit(&tx, generation, RunEventKind::RawChunk(chunk)) => {
                    if !sent {
                        break;
                    }
                }
            }
        }
        // Dropping stdin signals end of input to the encoder.
        drop(encoder_stdin);
    })
}

/// Forwards the encoder output as `JpegChunk` events.
fn spawn_jpeg_reader<R>(
    mut reader: R,
    generation: u64,
    tx: RunEventSender,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_buf(&mut buf) => read,
            };
            let kind = match read {
                Ok(0) => break,
                Ok(_) => RunEventKind::JpegChunk(buf.split().freeze()),
                Err(e) => RunEventKind::IoError {
                    role: ProcessRole::Encoder,
                    error: format!("data stream: {}", e),
                },
            };
            let fatal = matches!(kind, RunEventKind::IoError { .. });
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = emit(&tx, generation, kind) => {
                    if !sent || fatal {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_log_lines<R>(reader: R, tag: &'static str, cancel: CancellationToken) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => log::debug!("[{}] {}", tag, line),
                    _ => break,
                },
            }
        }
    })
}

#[cfg(all(test, unix))]
#[path = "supervisor_test.rs"]
mod supervisor_test;
