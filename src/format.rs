// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use videostream::fourcc::FourCC;

/// 8-bit single channel sensor data (V4L2 `GREY`)
pub const GREY: FourCC = FourCC(*b"GREY");

/// RGB 24-bit pixel format (8 bits per channel, no alpha)
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// RGBX 32-bit pixel format (8 bits per channel, unused alpha)
pub const RGBX: FourCC = FourCC(*b"RGBX");

/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// YUYV 4:2:2 YUV packed format (common camera output format)
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// NV12 4:2:0 YUV semi-planar format
pub const NV12: FourCC = FourCC(*b"NV12");

/// Pixel formats understood by the pipeline.
///
/// Every format maps to a V4L2 FourCC so capture devices and encoder
/// sessions can negotiate using the codes their drivers speak.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Raw 8-bit sensor samples, encoded as greyscale
    Raw,
    Rgb,
    Rgba,
    Rgbx,
    Yuyv,
    Nv12,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Raw,
        PixelFormat::Rgb,
        PixelFormat::Rgba,
        PixelFormat::Rgbx,
        PixelFormat::Yuyv,
        PixelFormat::Nv12,
    ];

    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Raw => GREY,
            PixelFormat::Rgb => RGB3,
            PixelFormat::Rgba => RGBA,
            PixelFormat::Rgbx => RGBX,
            PixelFormat::Yuyv => YUYV,
            PixelFormat::Nv12 => NV12,
        }
    }

    /// Bytes per row of the first plane.
    pub const fn row_stride(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelFormat::Raw => width,
            PixelFormat::Rgb => 3 * width,
            PixelFormat::Rgba | PixelFormat::Rgbx => 4 * width,
            PixelFormat::Yuyv => 2 * width,
            PixelFormat::Nv12 => width,
        }
    }

    /// Bytes required for a full frame including every plane.
    pub const fn frame_size(self, width: u32, height: u32) -> usize {
        let plane = self.row_stride(width) * height as usize;
        match self {
            PixelFormat::Nv12 => plane + plane / 2,
            _ => plane,
        }
    }
}

impl TryFrom<FourCC> for PixelFormat {
    type Error = String;

    fn try_from(fourcc: FourCC) -> Result<Self, Self::Error> {
        match &fourcc.0 {
            b"GREY" => Ok(PixelFormat::Raw),
            b"RGB3" => Ok(PixelFormat::Rgb),
            b"RGBA" => Ok(PixelFormat::Rgba),
            b"RGBX" => Ok(PixelFormat::Rgbx),
            b"YUYV" => Ok(PixelFormat::Yuyv),
            b"NV12" => Ok(PixelFormat::Nv12),
            code => Err(format!(
                "unsupported fourcc {}",
                String::from_utf8_lossy(code)
            )),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "grey" => Ok(PixelFormat::Raw),
            "rgb" | "rgb3" => Ok(PixelFormat::Rgb),
            "rgba" => Ok(PixelFormat::Rgba),
            "rgbx" => Ok(PixelFormat::Rgbx),
            "yuyv" => Ok(PixelFormat::Yuyv),
            "nv12" => Ok(PixelFormat::Nv12),
            _ => Err(format!("unknown pixel format '{s}'")),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PixelFormat::Raw => "RAW",
            PixelFormat::Rgb => "RGB3",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgbx => "RGBX",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
        };
        f.write_str(name)
    }
}

/// Geometry of the image held in a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: usize,
}

impl FrameLayout {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            stride: format.row_stride(width),
        }
    }

    pub fn size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Nv12.frame_size(1920, 1080), 3110400);
        assert_eq!(PixelFormat::Yuyv.frame_size(1920, 1080), 4147200);
        assert_eq!(PixelFormat::Rgb.frame_size(1920, 1080), 6220800);
        assert_eq!(PixelFormat::Rgba.frame_size(1920, 1080), 8294400);
        assert_eq!(PixelFormat::Raw.frame_size(640, 480), 307200);
    }

    #[test]
    fn fourcc_round_trip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::try_from(format.fourcc()), Ok(format));
        }
        assert!(PixelFormat::try_from(FourCC(*b"H264")).is_err());
    }

    #[test]
    fn parses_names() {
        assert_eq!("RAW".parse::<PixelFormat>(), Ok(PixelFormat::Raw));
        assert_eq!("yuyv".parse::<PixelFormat>(), Ok(PixelFormat::Yuyv));
        assert!("mjpg".parse::<PixelFormat>().is_err());
    }
}
