use std::{path::Path, process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::PipelineError;

pub const MAX_SOURCE_NAME_LEN: usize = 256;

/// A source name that is safe to hand to the capture process as an argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub normalized: String,
}

impl SourceDescriptor {
    /// Trims, strips control characters and bounds the length.
    pub fn parse(name: &str) -> Result<Self, PipelineError> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !c.is_control())
            .collect();
        let normalized = normalized.trim().to_string();
        if normalized.is_empty() {
            return Err(PipelineError::InvalidSource("source name is empty".into()));
        }
        if normalized.chars().count() > MAX_SOURCE_NAME_LEN {
            return Err(PipelineError::InvalidSource(format!(
                "source name longer than {} characters",
                MAX_SOURCE_NAME_LEN
            )));
        }
        Ok(Self {
            name: name.to_string(),
            normalized,
        })
    }
}

/// One entry reported by the discovery collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Deserialize)]
struct SourceList {
    #[serde(default)]
    sources: Vec<SourceInfo>,
}

/// Parses the discovery binary's stdout: `{"sources":[{"name":..,"url":..}]}`.
pub fn parse_source_list(output: &str) -> anyhow::Result<Vec<SourceInfo>> {
    let list: SourceList = serde_json::from_str(output.trim())
        .map_err(|e| anyhow::anyhow!("invalid source list: {}", e))?;
    Ok(list.sources)
}

/// Runs the discovery binary and returns the sources it found.
pub async fn list_sources(bin: &Path, timeout: Duration) -> anyhow::Result<Vec<SourceInfo>> {
    let child = Command::new(bin)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("spawn {}: {}", bin.display(), e))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", bin.display(), timeout))??;

    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            bin.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_source_list(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
