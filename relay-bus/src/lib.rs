pub mod convert;
pub mod encoder;
pub mod error;
pub mod event;
pub mod fanout;
pub mod framer;
pub mod layout;
pub mod peer;
pub mod pipeline;
pub mod probe;
pub mod source;
pub mod supervisor;

#[cfg(all(test, unix))]
mod test_util;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineConfig, PipelineStatus};
