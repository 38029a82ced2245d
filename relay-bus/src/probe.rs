//! Format discovery from the capture process's diagnostic output.
//!
//! The capture process reports, in any order and casing:
//! - `fourcc=XXXX` for the pixel layout
//! - `VIDEO <width>x<height>` for the resolution, optionally with `fps=<rate>`
//! - `connected to ...` once the source is reached
//!
//! Only the first valid resolution of a run is honoured. Later resolutions or
//! format tags are reported as notifications; acting on them needs a restart.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{ProcessRole, RunEventKind, RunEventSender, emit};
use crate::layout::{PixelFormat, PixelLayout};

const CONNECTED_MARKER: &str = "connected to";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Discovery {
    pub layout: PixelLayout,
    pub fps: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProbeEvent {
    Connected(String),
    Discovered(Discovery),
    /// A format tag that differs from the discovered layout.
    FormatChanged(PixelFormat),
    /// A resolution seen after discovery; ignored until restart.
    ResolutionChanged { width: u32, height: u32 },
}

#[derive(Default)]
pub struct StreamProbe {
    format: Option<PixelFormat>,
    fps: Option<f64>,
    discovered: Option<PixelLayout>,
}

impl StreamProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovered(&self) -> Option<PixelLayout> {
        self.discovered
    }

    pub fn feed_line(&mut self, line: &str) -> Vec<ProbeEvent> {
        let mut events = Vec::new();

        if line.to_ascii_lowercase().contains(CONNECTED_MARKER) {
            events.push(ProbeEvent::Connected(line.trim().to_string()));
        }

        if let Some(fps) = parse_fps_token(line) {
            self.fps.get_or_insert(fps);
        }

        if let Some(tag) = parse_fourcc_token(line) {
            let format = PixelFormat::from_fourcc(&tag);
            match self.discovered {
                Some(layout) if layout.format != format => {
                    log::warn!(
                        "probe: format changed {} -> {} mid-run, restart required",
                        layout.format,
                        format
                    );
                    events.push(ProbeEvent::FormatChanged(format));
                }
                Some(_) => {}
                None => self.format = Some(format),
            }
        }

        if let Some((width, height)) = parse_resolution_token(line) {
            match self.discovered {
                Some(layout) => {
                    if layout.width != width || layout.height != height {
                        log::warn!(
                            "probe: resolution {}x{} ignored, run is fixed at {}",
                            width,
                            height,
                            layout.resolution()
                        );
                    }
                    events.push(ProbeEvent::ResolutionChanged { width, height });
                }
                None => {
                    let format = self.format.unwrap_or_default();
                    match PixelLayout::new(format, width, height) {
                        Ok(layout) => {
                            self.discovered = Some(layout);
                            events.push(ProbeEvent::Discovered(Discovery {
                                layout,
                                fps: self.fps,
                            }));
                        }
                        Err(e) => log::warn!("probe: ignoring resolution token: {:#}", e),
                    }
                }
            }
        }

        events
    }
}

/// Returns the raw tag following `fourcc=`, up to four characters.
pub fn parse_fourcc_token(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find("fourcc=")? + "fourcc=".len();
    let tag: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .take(4)
        .collect();
    Some(tag)
}

/// Finds `VIDEO <w>x<h>` and returns the first well-formed pair.
pub fn parse_resolution_token(line: &str) -> Option<(u32, u32)> {
    let lower = line.to_ascii_lowercase();
    lower.match_indices("video").find_map(|(idx, token)| {
        let rest = lower[idx + token.len()..].trim_start();
        let (w, rest) = split_digits(rest)?;
        let rest = rest.strip_prefix('x')?;
        let (h, _) = split_digits(rest)?;
        Some((w.parse().ok()?, h.parse().ok()?))
    })
}

pub fn parse_fps_token(line: &str) -> Option<f64> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find("fps=")? + "fps=".len();
    let value: String = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    value.parse::<f64>().ok().filter(|fps| fps.is_finite() && *fps > 0.0)
}

fn split_digits(s: &str) -> Option<(&str, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some(s.split_at(end))
}

/// Reads the capture process's diagnostic stream for one run.
///
/// Emits probe events, and `ProbeTimedOut` if no resolution was discovered
/// within `timeout`. The timer stops on discovery or cancellation.
pub fn spawn_probe<R>(
    reader: R,
    generation: u64,
    timeout: Duration,
    tx: RunEventSender,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut segments = BufReader::new(reader).split(b'\n');
        let mut probe = StreamProbe::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timer_armed = true;
        let mut eof = false;

        loop {
            if eof && !timer_armed {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut deadline, if timer_armed => {
                    timer_armed = false;
                    log::warn!("probe[{}]: no resolution within {:?}", generation, timeout);
                    if !emit(&tx, generation, RunEventKind::ProbeTimedOut).await {
                        break;
                    }
                }
                segment = segments.next_segment(), if !eof => match segment {
                    Ok(Some(raw)) => {
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim_end_matches('\r');
                        log::debug!("[capture] {}", line);
                        for event in probe.feed_line(line) {
                            if matches!(event, ProbeEvent::Discovered(_)) {
                                timer_armed = false;
                            }
                            if !emit(&tx, generation, RunEventKind::Probe(event)).await {
                                return;
                            }
                        }
                    }
                    Ok(None) => eof = true,
                    Err(e) => {
                        let _ = emit(
                            &tx,
                            generation,
                            RunEventKind::IoError {
                                role: ProcessRole::Capture,
                                error: format!("diagnostic stream: {}", e),
                            },
                        )
                        .await;
                        eof = true;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
#[path = "probe_test.rs"]
mod probe_test;
