use std::fmt::{Display, Formatter};

/// Byte order of a 4-byte packed RGB pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RgbOrder {
    Bgra,
    Bgrx,
    Rgba,
    Rgbx,
    Argb,
    Abgr,
}

impl RgbOrder {
    pub const ALL: [RgbOrder; 6] = [
        RgbOrder::Bgra,
        RgbOrder::Bgrx,
        RgbOrder::Rgba,
        RgbOrder::Rgbx,
        RgbOrder::Argb,
        RgbOrder::Abgr,
    ];

    /// Offsets of the (R, G, B) channels inside one pixel.
    pub fn offsets(self) -> (usize, usize, usize) {
        match self {
            RgbOrder::Bgra | RgbOrder::Bgrx => (2, 1, 0),
            RgbOrder::Rgba | RgbOrder::Rgbx => (0, 1, 2),
            RgbOrder::Argb => (1, 2, 3),
            RgbOrder::Abgr => (3, 2, 1),
        }
    }

    pub fn fourcc(self) -> &'static str {
        match self {
            RgbOrder::Bgra => "BGRA",
            RgbOrder::Bgrx => "BGRX",
            RgbOrder::Rgba => "RGBA",
            RgbOrder::Rgbx => "RGBX",
            RgbOrder::Argb => "ARGB",
            RgbOrder::Abgr => "ABGR",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// UYVY: U0 Y0 V0 Y1 for every two horizontal pixels.
    PackedYuv422,
    PackedRgb(RgbOrder),
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::PackedYuv422
    }
}

impl PixelFormat {
    /// Strict lookup of a four-character code, case-insensitive.
    pub fn parse_fourcc(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if tag.eq_ignore_ascii_case("UYVY") {
            return Some(PixelFormat::PackedYuv422);
        }
        RgbOrder::ALL
            .into_iter()
            .find(|order| tag.eq_ignore_ascii_case(order.fourcc()))
            .map(PixelFormat::PackedRgb)
    }

    /// Maps any tag to a format; unknown tags degrade to packed YUV 4:2:2.
    pub fn from_fourcc(tag: &str) -> Self {
        match Self::parse_fourcc(tag) {
            Some(format) => format,
            None => {
                log::warn!(
                    "unrecognized fourcc {:?}, falling back to {}",
                    tag,
                    PixelFormat::default()
                );
                PixelFormat::default()
            }
        }
    }

    pub fn fourcc(&self) -> &'static str {
        match self {
            PixelFormat::PackedYuv422 => "UYVY",
            PixelFormat::PackedRgb(order) => order.fourcc(),
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::PackedYuv422 => 2,
            PixelFormat::PackedRgb(_) => 4,
        }
    }

    /// Pixel format name understood by the external rawvideo encoder.
    pub fn encoder_pix_fmt(&self) -> &'static str {
        match self {
            PixelFormat::PackedYuv422 => "uyvy422",
            PixelFormat::PackedRgb(RgbOrder::Bgra) => "bgra",
            PixelFormat::PackedRgb(RgbOrder::Bgrx) => "bgr0",
            PixelFormat::PackedRgb(RgbOrder::Rgba) => "rgba",
            PixelFormat::PackedRgb(RgbOrder::Rgbx) => "rgb0",
            PixelFormat::PackedRgb(RgbOrder::Argb) => "argb",
            PixelFormat::PackedRgb(RgbOrder::Abgr) => "abgr",
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.fourcc())
    }
}

/// Largest accepted width or height.
pub const MAX_DIMENSION: u32 = 16384;

/// Frame geometry of one pipeline run. Fixed until the run is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PixelLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl PixelLayout {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("invalid video size {}x{}", width, height);
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            anyhow::bail!(
                "video size {}x{} exceeds {}x{}",
                width,
                height,
                MAX_DIMENSION,
                MAX_DIMENSION
            );
        }
        if width % 2 != 0 || height % 2 != 0 {
            anyhow::bail!(
                "video size {}x{} must be even for 4:2:0 subsampling",
                width,
                height
            );
        }
        Ok(Self {
            format,
            width,
            height,
        })
    }

    /// Bytes per frame. Bounded by `MAX_DIMENSION` for layouts built with `new`.
    pub fn frame_size(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(self.format.bytes_per_pixel())
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl Display for PixelLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}
