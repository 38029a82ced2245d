use std::{env, path::PathBuf, str::FromStr, sync::LazyLock, time::Duration};

use relay_bus::{PipelineConfig, supervisor::EncoderCommand};

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    port: u16,
    capture_bin: PathBuf,
    list_bin: PathBuf,
    ffmpeg_bin: PathBuf,
    jpeg_quality: u8,
    fps: f64,
    discovery_timeout: Duration,
    stop_grace: Duration,
    switch_settle: Duration,
    h264_bitrate: u32,
    stun_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            capture_bin: PathBuf::from("./ndi_recv"),
            list_bin: PathBuf::from("./ndi_list"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            jpeg_quality: 80,
            fps: 30.0,
            discovery_timeout: Duration::from_millis(5000),
            stop_grace: Duration::from_millis(500),
            switch_settle: Duration::from_millis(1000),
            h264_bitrate: 2_500_000,
            stun_url: Some(DEFAULT_STUN_URL.to_string()),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        parse_into(&lookup, "PORT", &mut config.port);
        if let Some(v) = lookup("RELAY_CAPTURE_BIN") {
            config.capture_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELAY_LIST_BIN") {
            config.list_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELAY_FFMPEG_BIN") {
            config.ffmpeg_bin = PathBuf::from(v);
        }
        parse_into(&lookup, "RELAY_JPEG_QUALITY", &mut config.jpeg_quality);
        parse_into(&lookup, "RELAY_FPS", &mut config.fps);
        parse_millis(&lookup, "RELAY_DISCOVERY_TIMEOUT_MS", &mut config.discovery_timeout);
        parse_millis(&lookup, "RELAY_STOP_GRACE_MS", &mut config.stop_grace);
        parse_millis(&lookup, "RELAY_SWITCH_SETTLE_MS", &mut config.switch_settle);
        parse_into(&lookup, "RELAY_H264_BITRATE", &mut config.h264_bitrate);
        if let Some(v) = lookup("RELAY_STUN_URL") {
            let v = v.trim();
            config.stun_url = (!v.is_empty()).then(|| v.to_string());
        }
        if !(config.fps.is_finite() && config.fps > 0.0) {
            log::warn!("RELAY_FPS must be positive, using 30");
            config.fps = 30.0;
        }
        config
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ffmpeg_bin(&self) -> &PathBuf {
        &self.ffmpeg_bin
    }

    /// `with_encoder` is false when the preflight found no usable encoder.
    pub fn pipeline_config(&self, with_encoder: bool) -> PipelineConfig {
        PipelineConfig {
            capture_bin: self.capture_bin.clone(),
            list_bin: self.list_bin.clone(),
            encoder: with_encoder
                .then(|| EncoderCommand::new(self.ffmpeg_bin.clone(), self.jpeg_quality)),
            default_fps: self.fps,
            discovery_timeout: self.discovery_timeout,
            stop_grace: self.stop_grace,
            switch_settle: self.switch_settle,
            h264_bitrate: self.h264_bitrate,
            ice_urls: self.stun_url.iter().cloned().collect(),
            ..PipelineConfig::default()
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => log::warn!("ignoring invalid {}={:?}", key, raw),
        }
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    parse_into(lookup, key, &mut millis);
    *slot = Duration::from_millis(millis);
}

pub fn config() -> &'static RelayConfig {
    static CONFIG: LazyLock<RelayConfig> =
        LazyLock::new(|| RelayConfig::from_lookup(|key| env::var(key).ok()));
    &CONFIG
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
