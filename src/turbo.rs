// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    encoder::{EncoderSession, SessionError},
    format::{FrameLayout, PixelFormat},
};
use turbojpeg::Subsamp;

/// JPEG encoder session backed by libjpeg-turbo with SIMD.
///
/// Stands in for a hardware encoder on platforms without one. Compression
/// runs on the driver's engine thread, so the pipeline sees the same
/// submit/wait behaviour either way. YUV input must be converted first;
/// the pipeline does that when the camera does not deliver RGB.
///
/// ```no_run
/// use edgefirst_capture::{Backend, DmaHeap, DmaHeapAllocator, TurboJpegSession, V4l2Camera};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Backend::new(
///     DmaHeapAllocator::new(DmaHeap::Cma)?,
///     V4l2Camera::new("/dev/video3"),
///     TurboJpegSession::new(),
/// );
/// # Ok(())
/// # }
/// ```
pub struct TurboJpegSession {
    subsamp: Subsamp,
}

impl Default for TurboJpegSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TurboJpegSession {
    /// Session producing 4:2:0 colour JPEGs.
    pub fn new() -> Self {
        Self {
            subsamp: Subsamp::Sub2x2,
        }
    }

    /// Chroma subsampling for colour input. Greyscale input always uses
    /// [`Subsamp::Gray`].
    pub fn with_subsampling(mut self, subsamp: Subsamp) -> Self {
        self.subsamp = subsamp;
        self
    }
}

fn turbo_format(format: PixelFormat) -> Option<turbojpeg::PixelFormat> {
    match format {
        PixelFormat::Rgb => Some(turbojpeg::PixelFormat::RGB),
        PixelFormat::Rgba => Some(turbojpeg::PixelFormat::RGBA),
        PixelFormat::Rgbx => Some(turbojpeg::PixelFormat::RGBX),
        PixelFormat::Raw => Some(turbojpeg::PixelFormat::GRAY),
        PixelFormat::Yuyv | PixelFormat::Nv12 => None,
    }
}

impl EncoderSession for TurboJpegSession {
    fn name(&self) -> &str {
        "turbojpeg"
    }

    fn formats(&self) -> &[PixelFormat] {
        &[
            PixelFormat::Rgb,
            PixelFormat::Rgba,
            PixelFormat::Rgbx,
            PixelFormat::Raw,
        ]
    }

    fn encode(
        &mut self,
        input: &[u8],
        layout: &FrameLayout,
        quality: u8,
        output: &mut [u8],
    ) -> Result<usize, SessionError> {
        let Some(format) = turbo_format(layout.format) else {
            return Err(SessionError::Rejected(format!(
                "turbojpeg cannot encode {}",
                layout.format
            )));
        };
        if input.len() < layout.size() {
            return Err(SessionError::Rejected(format!(
                "{} frame holds {} of {} bytes",
                layout,
                input.len(),
                layout.size()
            )));
        }
        let subsamp = match layout.format {
            PixelFormat::Raw => Subsamp::Gray,
            _ => self.subsamp,
        };

        let image = turbojpeg::Image {
            pixels: input,
            width: layout.width as usize,
            pitch: layout.stride,
            height: layout.height as usize,
            format,
        };
        let jpeg = turbojpeg::compress(image, quality as i32, subsamp)
            .map_err(|e| SessionError::Rejected(e.to_string()))?;

        if jpeg.len() > output.len() {
            return Err(SessionError::Rejected(format!(
                "{} byte JPEG does not fit a {} byte buffer",
                jpeg.len(),
                output.len()
            )));
        }
        output[..jpeg.len()].copy_from_slice(&jpeg);
        Ok(jpeg.len())
    }

    fn reinitialize(&mut self) -> Result<(), SessionError> {
        // Every compress call starts from a fresh state.
        Ok(())
    }
}
