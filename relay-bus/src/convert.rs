//! Packed pixel buffers to planar 4:2:0 (I420).
//!
//! RGB coefficients are the BT.601 studio-swing integer approximations:
//! ```text
//! Y = ((66R + 129G + 25B + 128) >> 8) + 16
//! U = ((-38R - 74G + 112B + 128) >> 8) + 128
//! V = ((112R - 94G - 18B + 128) >> 8) + 128
//! ```
//! Chroma is computed once per 2x2 block from the block's average colour.

use std::fmt::{Display, Formatter};

use crate::layout::{PixelFormat, PixelLayout, RgbOrder};

/// Planar YUV 4:2:0 picture. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanarFrame {
    width: u32,
    height: u32,
    luma: Vec<u8>,
    chroma_u: Vec<u8>,
    chroma_v: Vec<u8>,
}

impl PlanarFrame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    pub fn chroma_u(&self) -> &[u8] {
        &self.chroma_u
    }

    pub fn chroma_v(&self) -> &[u8] {
        &self.chroma_v
    }

    /// Width of one chroma plane row.
    pub fn chroma_width(&self) -> usize {
        chroma_dim(self.width as usize)
    }

    pub fn chroma_height(&self) -> usize {
        chroma_dim(self.height as usize)
    }
}

impl Display for PlanarFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "PlanarFrame {{ {}x{}, luma: {}, chroma: {} }}",
            self.width,
            self.height,
            self.luma.len(),
            self.chroma_u.len()
        )
    }
}

fn chroma_dim(n: usize) -> usize {
    n.div_ceil(2)
}

#[inline]
fn clamp8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Converts one raw frame according to its layout.
pub fn convert(raw: &[u8], layout: &PixelLayout) -> anyhow::Result<PlanarFrame> {
    match layout.format {
        PixelFormat::PackedYuv422 => packed_yuv422_to_planar(raw, layout.width, layout.height),
        PixelFormat::PackedRgb(order) => {
            packed_rgb_to_planar(raw, layout.width, layout.height, order)
        }
    }
}

/// UYVY 4:2:2 to I420. Luma is copied as-is; each output chroma sample is the
/// rounded mean of the two rows' chroma samples covering its 2x2 block.
pub fn packed_yuv422_to_planar(raw: &[u8], width: u32, height: u32) -> anyhow::Result<PlanarFrame> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 {
        anyhow::bail!("invalid video size {}x{}", width, height);
    }
    if w % 2 != 0 {
        anyhow::bail!("packed 4:2:2 requires an even width, got {}", width);
    }
    let stride = w * 2;
    if raw.len() < stride * h {
        anyhow::bail!(
            "truncated 4:2:2 frame: {} bytes, expected {}",
            raw.len(),
            stride * h
        );
    }

    let mut luma = Vec::with_capacity(w * h);
    for row in raw[..stride * h].chunks_exact(stride) {
        for macro_pixel in row.chunks_exact(4) {
            luma.push(macro_pixel[1]);
            luma.push(macro_pixel[3]);
        }
    }

    let cw = chroma_dim(w);
    let ch = chroma_dim(h);
    let mut chroma_u = Vec::with_capacity(cw * ch);
    let mut chroma_v = Vec::with_capacity(cw * ch);
    for by in 0..ch {
        let top = &raw[(by * 2) * stride..(by * 2 + 1) * stride];
        let bottom = if by * 2 + 1 < h {
            Some(&raw[(by * 2 + 1) * stride..(by * 2 + 2) * stride])
        } else {
            None
        };
        for bx in 0..cw {
            let i = bx * 4;
            match bottom {
                Some(bottom) => {
                    chroma_u.push(((top[i] as u16 + bottom[i] as u16 + 1) / 2) as u8);
                    chroma_v.push(((top[i + 2] as u16 + bottom[i + 2] as u16 + 1) / 2) as u8);
                }
                None => {
                    chroma_u.push(top[i]);
                    chroma_v.push(top[i + 2]);
                }
            }
        }
    }

    Ok(PlanarFrame {
        width,
        height,
        luma,
        chroma_u,
        chroma_v,
    })
}

/// Packed 4-byte RGB to I420. Blocks on an odd right or bottom edge average
/// only the pixels they cover.
pub fn packed_rgb_to_planar(
    raw: &[u8],
    width: u32,
    height: u32,
    order: RgbOrder,
) -> anyhow::Result<PlanarFrame> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 {
        anyhow::bail!("invalid video size {}x{}", width, height);
    }
    let stride = w * 4;
    if raw.len() < stride * h {
        anyhow::bail!(
            "truncated {} frame: {} bytes, expected {}",
            order.fourcc(),
            raw.len(),
            stride * h
        );
    }
    let (ro, go, bo) = order.offsets();

    let mut luma = Vec::with_capacity(w * h);
    for px in raw[..stride * h].chunks_exact(4) {
        let (r, g, b) = (px[ro] as i32, px[go] as i32, px[bo] as i32);
        luma.push(clamp8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16));
    }

    let cw = chroma_dim(w);
    let ch = chroma_dim(h);
    let mut chroma_u = Vec::with_capacity(cw * ch);
    let mut chroma_v = Vec::with_capacity(cw * ch);
    for by in 0..ch {
        for bx in 0..cw {
            let (mut rs, mut gs, mut bs, mut n) = (0i32, 0i32, 0i32, 0i32);
            for y in (by * 2)..(by * 2 + 2).min(h) {
                for x in (bx * 2)..(bx * 2 + 2).min(w) {
                    let i = y * stride + x * 4;
                    rs += raw[i + ro] as i32;
                    gs += raw[i + go] as i32;
                    bs += raw[i + bo] as i32;
                    n += 1;
                }
            }
            let r = (rs + n / 2) / n;
            let g = (gs + n / 2) / n;
            let b = (bs + n / 2) / n;
            chroma_u.push(clamp8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128));
            chroma_v.push(clamp8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128));
        }
    }

    Ok(PlanarFrame {
        width,
        height,
        luma,
        chroma_u,
        chroma_v,
    })
}

#[cfg(test)]
#[path = "convert_test.rs"]
mod convert_test;
