use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Pixel formats a capture device may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgb32,
    Bgr32,
    Yuyv,
    Uyvy,
    Grey,
    Mjpeg,
    /// Anything else, identified by its FourCC
    Other([u8; 4]),
}

impl PixelFormat {
    /// Bits per pixel for packed raw formats, 0 for compressed or unknown ones.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Grey => 8,
            PixelFormat::Yuyv | PixelFormat::Uyvy => 16,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 24,
            PixelFormat::Rgb32 | PixelFormat::Bgr32 => 32,
            PixelFormat::Mjpeg | PixelFormat::Other(_) => 0,
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Rgb32 => *b"RGB4",
            PixelFormat::Bgr32 => *b"BGR4",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Grey => *b"GREY",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Other(code) => code,
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"RGB3" => PixelFormat::Rgb24,
            b"BGR3" => PixelFormat::Bgr24,
            b"RGB4" | b"XB24" | b"AB24" => PixelFormat::Rgb32,
            b"BGR4" | b"XR24" | b"AR24" => PixelFormat::Bgr32,
            b"YUYV" => PixelFormat::Yuyv,
            b"UYVY" => PixelFormat::Uyvy,
            b"GREY" => PixelFormat::Grey,
            b"MJPG" => PixelFormat::Mjpeg,
            _ => PixelFormat::Other(code),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// One entry of a device's stream capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCapability {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// 0 for compressed formats; never selected by negotiation
    pub bits_per_pixel: u32,
}

impl StreamCapability {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            bits_per_pixel: pixel_format.bits_per_pixel(),
        }
    }
}

/// Geometry of every frame in a running session. Fixed after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    /// Bytes per row: `width * bits_per_pixel / 8`
    pub stride: u32,
    pub pixel_format: PixelFormat,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self::with_depth(width, height, pixel_format.bits_per_pixel(), pixel_format)
    }

    pub fn with_depth(width: u32, height: u32, bits_per_pixel: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            bits_per_pixel,
            stride: width * bits_per_pixel / 8,
            pixel_format,
        }
    }

    /// Exact byte length of one frame
    pub fn frame_len(&self) -> usize {
        self.height as usize * self.stride as usize
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl From<StreamCapability> for FrameFormat {
    fn from(cap: StreamCapability) -> Self {
        FrameFormat::with_depth(cap.width, cap.height, cap.bits_per_pixel, cap.pixel_format)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} bpp, stride {})",
            self.width, self.height, self.pixel_format, self.bits_per_pixel, self.stride
        )
    }
}

/// Frame metadata without pixels; what statistics windows carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub sequence: u64,
    pub captured_at: Instant,
}
