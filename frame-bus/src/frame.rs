use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Pixel layout of the frames a producer sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 8-bit RGBA, forwarded untouched.
    Rgba8,
    /// Packed little-endian half-float RGBA, converted to planar f32 GBR.
    Rgba16Half,
}

impl PixelFormat {
    pub fn bytes_per_channel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 1,
            PixelFormat::Rgba16Half => 2,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        self.bytes_per_channel() * 4
    }

    /// ffmpeg `-pix_fmt` of the bytes handed to the encoder for this input.
    pub fn sink_pix_fmt(self) -> &'static str {
        match self {
            PixelFormat::Rgba8 => "rgba",
            PixelFormat::Rgba16Half => "gbrpf32le",
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, PixelFormat::Rgba16Half)
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgba8 => f.write_str("rgba8"),
            PixelFormat::Rgba16Half => f.write_str("rgba16f"),
        }
    }
}

/// Resolution and layout, fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes of one inbound frame.
    pub fn input_len(&self) -> usize {
        self.pixels() * self.format.bytes_per_pixel()
    }

    /// Bytes of one frame after reformatting.
    pub fn output_len(&self) -> usize {
        match self.format {
            PixelFormat::Rgba8 => self.input_len(),
            PixelFormat::Rgba16Half => self.pixels() * 3 * size_of::<f32>(),
        }
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::new(4096, 2048, PixelFormat::Rgba16Half)
    }
}

impl Display for FrameGeometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

/// One inbound pixel buffer. Immutable once received.
#[derive(Clone, Debug)]
pub struct Frame {
    geometry: FrameGeometry,
    data: Bytes,
}

impl Frame {
    pub fn new(geometry: FrameGeometry, data: impl Into<Bytes>) -> Self {
        Self {
            geometry,
            data: data.into(),
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Rejects payloads that do not hold exactly one frame of the session geometry.
    pub fn check_len(&self) -> RelayResult<()> {
        let expected = self.geometry.input_len();
        let actual = self.data.len();
        if actual != expected || actual % self.geometry.format.bytes_per_pixel() != 0 {
            return Err(RelayError::MalformedFrame { expected, actual });
        }
        Ok(())
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame {{ {}, data: {} }}", self.geometry, self.data.len())
    }
}
