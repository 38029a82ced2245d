use std::time::Duration;

use super::{MAX_SOURCE_NAME_LEN, SourceDescriptor, list_sources, parse_source_list};
use crate::error::PipelineError;

#[test]
fn test_descriptor_trims_and_strips_control_chars() {
    let source = SourceDescriptor::parse("  STUDIO (Cam\u{7}era 1)\n").unwrap();
    assert_eq!(source.normalized, "STUDIO (Camera 1)");
    assert_eq!(source.name, "  STUDIO (Cam\u{7}era 1)\n");
}

#[test]
fn test_descriptor_rejects_empty() {
    for name in ["", "   ", "\t\r\n", "\u{1b}\u{0}"] {
        match SourceDescriptor::parse(name) {
            Err(PipelineError::InvalidSource(_)) => {}
            other => panic!("expected InvalidSource for {:?}, got {:?}", name, other),
        }
    }
}

#[test]
fn test_descriptor_length_bound() {
    let max = "a".repeat(MAX_SOURCE_NAME_LEN);
    assert!(SourceDescriptor::parse(&max).is_ok());

    let too_long = "a".repeat(MAX_SOURCE_NAME_LEN + 1);
    assert!(matches!(
        SourceDescriptor::parse(&too_long),
        Err(PipelineError::InvalidSource(_))
    ));
}

#[test]
fn test_parse_source_list() {
    let sources = parse_source_list(
        r#"{"sources":[{"name":"HOST (OBS)","url":"10.0.0.2:5961"},{"name":"CAM"}]}"#,
    )
    .unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].name, "HOST (OBS)");
    assert_eq!(sources[0].url.as_deref(), Some("10.0.0.2:5961"));
    assert!(sources[1].url.is_none());

    assert!(parse_source_list(r#"{"sources":[]}"#).unwrap().is_empty());
    assert!(parse_source_list("not json").is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_list_sources_runs_binary() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bin = crate::test_util::script(&dir, "list", r#"echo '{"sources":[{"name":"A"}]}'"#);

    let sources = list_sources(&bin, Duration::from_secs(5)).await?;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].name, "A");
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_list_sources_failure_and_timeout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let failing = crate::test_util::script(&dir, "fail", "echo boom >&2; exit 3");
    assert!(list_sources(&failing, Duration::from_secs(5)).await.is_err());

    let slow = crate::test_util::script(&dir, "slow", "sleep 5");
    assert!(list_sources(&slow, Duration::from_millis(200)).await.is_err());
    Ok(())
}
