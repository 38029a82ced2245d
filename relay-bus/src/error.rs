use std::time::Duration;

/// Errors surfaced at the pipeline control surface.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Rejected before touching pipeline state.
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("no resolution discovered within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error("subprocess failure: {0}")]
    Subprocess(String),
    #[error("peer handshake failed: {0}")]
    Handshake(String),
    #[error("pipeline is not running")]
    NotRunning,
    #[error("pipeline controller is closed")]
    Closed,
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidSource(_) => "invalid_source",
            PipelineError::DiscoveryTimeout(_) => "discovery_timeout",
            PipelineError::Subprocess(_) => "subprocess",
            PipelineError::Handshake(_) => "handshake",
            PipelineError::NotRunning => "not_running",
            PipelineError::Closed => "closed",
        }
    }
}
