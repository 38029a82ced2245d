use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::probe::ProbeEvent;

/// Which subprocess an event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessRole {
    Capture,
    Encoder,
}

impl Display for ProcessRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            ProcessRole::Capture => write!(f, "capture"),
            ProcessRole::Encoder => write!(f, "encoder"),
        }
    }
}

/// Event produced by a task belonging to one pipeline run.
///
/// `generation` identifies the run; the controller drops events whose
/// generation is not the active one.
#[derive(Debug)]
pub struct RunEvent {
    pub generation: u64,
    pub kind: RunEventKind,
}

#[derive(Debug)]
pub enum RunEventKind {
    Probe(ProbeEvent),
    ProbeTimedOut,
    /// Raw pixel bytes read from the capture process.
    RawChunk(Bytes),
    /// Motion-JPEG bytes read from the encoder process.
    JpegChunk(Bytes),
    Exited {
        role: ProcessRole,
        code: Option<i32>,
    },
    IoError {
        role: ProcessRole,
        error: String,
    },
}

pub type RunEventSender = tokio::sync::mpsc::Sender<RunEvent>;
pub type RunEventReceiver = tokio::sync::mpsc::Receiver<RunEvent>;

/// Sends `kind` tagged with `generation`; returns false once the receiver is gone.
pub(crate) async fn emit(tx: &RunEventSender, generation: u64, kind: RunEventKind) -> bool {
    tx.send(RunEvent { generation, kind }).await.is_ok()
}
