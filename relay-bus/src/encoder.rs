use anyhow::Context;
use bytes::Bytes;
use openh264::OpenH264API;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, RateControlMode};
use openh264::formats::YUVSlices;

use crate::convert::PlanarFrame;

/// H.264 encoder for the peer path. Each call produces one Annex-B access unit.
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
}

impl H264Encoder {
    pub fn new(width: u32, height: u32, fps: f64, bitrate: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(
            width > 0 && height > 0 && width % 2 == 0 && height % 2 == 0,
            "invalid encoder size {}x{}",
            width,
            height
        );
        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(bitrate))
            .max_frame_rate(FrameRate::from_hz(fps as f32))
            .rate_control_mode(RateControlMode::Bitrate);

        let api = OpenH264API::from_source();
        let encoder =
            Encoder::with_api_config(api, config).context("failed to create h264 encoder")?;

        log::info!(
            "h264 encoder created: {}x{} @ {:.2} fps, {} bps",
            width,
            height,
            fps,
            bitrate
        );
        Ok(Self {
            encoder,
            width,
            height,
        })
    }

    /// The next encoded frame will be an IDR.
    pub fn force_keyframe(&mut self) {
        self.encoder.force_intra_frame();
        log::debug!("h264 keyframe requested");
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn encode(&mut self, frame: &PlanarFrame) -> anyhow::Result<Bytes> {
        anyhow::ensure!(
            frame.width() == self.width && frame.height() == self.height,
            "frame {}x{} does not match encoder {}x{}",
            frame.width(),
            frame.height(),
            self.width,
            self.height
        );

        let w = self.width as usize;
        let h = self.height as usize;
        let cw = frame.chroma_width();
        let yuv = YUVSlices::new(
            (frame.luma(), frame.chroma_u(), frame.chroma_v()),
            (w, h),
            (w, cw, cw),
        );

        let bitstream = self.encoder.encode(&yuv).context("h264 encode failed")?;
        let access_unit = bitstream.to_vec();
        log::trace!("encoded access unit: {} bytes", access_unit.len());
        Ok(Bytes::from(access_unit))
    }
}
