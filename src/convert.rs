// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    buffer::{Buffer, BufferPool, FillState},
    error::{ConversionError, PoolError},
    format::{FrameLayout, PixelFormat},
};
use std::sync::Arc;
use tracing::trace;

type Kernel = fn(src: &[u8], src_stride: usize, dst: &mut [u8], width: usize, height: usize);

/// Converts captured frames into the pixel format the encoder accepts.
///
/// When the encoder takes the capture format directly the stage is a
/// pass-through: [`FormatStage::convert`] hands the input buffer back
/// untouched, without acquiring a second buffer or copying.
pub struct FormatStage {
    pool: Arc<BufferPool>,
    target: PixelFormat,
    passthrough: bool,
}

impl FormatStage {
    /// Stage that forwards every buffer unchanged.
    pub fn passthrough(pool: Arc<BufferPool>, format: PixelFormat) -> Self {
        Self {
            pool,
            target: format,
            passthrough: true,
        }
    }

    /// Stage converting `from` into `to`.
    ///
    /// Returns a pass-through stage when both formats are equal.
    pub fn new(
        pool: Arc<BufferPool>,
        from: PixelFormat,
        to: PixelFormat,
    ) -> Result<Self, ConversionError> {
        if from == to {
            return Ok(Self::passthrough(pool, to));
        }
        if kernel(from, to).is_none() {
            return Err(ConversionError::Unsupported { from, to });
        }
        Ok(Self {
            pool,
            target: to,
            passthrough: false,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    /// Converts `src` into a new buffer from the pool.
    ///
    /// `src` is released once converted. On error every buffer the stage
    /// holds, `src` included, is back in the pool before the error returns.
    pub fn convert(&self, src: Buffer) -> Result<Buffer, ConversionError> {
        if self.passthrough {
            return Ok(src);
        }

        let result = self.convert_into_new(&src);
        self.pool.recycle(src);
        result
    }

    fn convert_into_new(&self, src: &Buffer) -> Result<Buffer, ConversionError> {
        let Some(layout) = src.layout() else {
            return Err(ConversionError::ShortInput {
                expected: 1,
                actual: src.len(),
            });
        };
        let Some(convert_fn) = kernel(layout.format, self.target) else {
            return Err(ConversionError::Unsupported {
                from: layout.format,
                to: self.target,
            });
        };
        let expected = layout.size();
        if src.len() < expected {
            return Err(ConversionError::ShortInput {
                expected,
                actual: src.len(),
            });
        }

        let out = FrameLayout::new(self.target, layout.width, layout.height);
        let mut dst = self.pool.acquire().map_err(ConversionError::Pool)?;
        if dst.capacity() < out.size() {
            self.pool.recycle(dst);
            return Err(ConversionError::Pool(PoolError::Exhausted {
                capacity: self.pool.capacity(),
            }));
        }

        convert_fn(
            src.data(),
            layout.stride,
            &mut dst.memory_mut()[..out.size()],
            layout.width as usize,
            layout.height as usize,
        );
        dst.set_len(out.size());
        dst.set_layout(out);
        dst.set_frame(src.frame());
        dst.set_state(FillState::Full);
        trace!(from = %layout, to = %out, "converted");
        Ok(dst)
    }
}

/// Returns true when `from` frames can be turned into `to` frames, either
/// directly or by one of the software kernels.
pub fn supported(from: PixelFormat, to: PixelFormat) -> bool {
    from == to || kernel(from, to).is_some()
}

fn kernel(from: PixelFormat, to: PixelFormat) -> Option<Kernel> {
    match (from, to) {
        (PixelFormat::Yuyv, PixelFormat::Rgb) => Some(yuyv_to_rgb::<3> as Kernel),
        (PixelFormat::Yuyv, PixelFormat::Rgba | PixelFormat::Rgbx) => Some(yuyv_to_rgb::<4> as Kernel),
        (PixelFormat::Nv12, PixelFormat::Rgb) => Some(nv12_to_rgb::<3> as Kernel),
        (PixelFormat::Nv12, PixelFormat::Rgba | PixelFormat::Rgbx) => Some(nv12_to_rgb::<4> as Kernel),
        (PixelFormat::Rgba | PixelFormat::Rgbx, PixelFormat::Rgb) => Some(rgbx_to_rgb as Kernel),
        _ => None,
    }
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 studio range YUV to RGB, 8.8 fixed point.
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp((c + 409 * e + 128) >> 8),
        clamp((c - 100 * d - 208 * e + 128) >> 8),
        clamp((c + 516 * d + 128) >> 8),
    ]
}

#[inline]
fn put<const N: usize>(dst: &mut [u8], rgb: [u8; 3]) {
    dst[..3].copy_from_slice(&rgb);
    if N == 4 {
        dst[3] = 255;
    }
}

fn yuyv_to_rgb<const N: usize>(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let line = &src[row * src_stride..row * src_stride + width * 2];
        let out = &mut dst[row * width * N..(row + 1) * width * N];
        for (pair, px) in line.chunks_exact(4).zip(out.chunks_exact_mut(2 * N)) {
            let (y0, u, y1, v) = (pair[0], pair[1], pair[2], pair[3]);
            put::<N>(&mut px[..N], yuv_to_rgb(y0, u, v));
            put::<N>(&mut px[N..], yuv_to_rgb(y1, u, v));
        }
    }
}

fn nv12_to_rgb<const N: usize>(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    width: usize,
    height: usize,
) {
    let (luma, chroma) = src.split_at(src_stride * height);
    for row in 0..height {
        let uv_row = &chroma[(row / 2) * src_stride..];
        for col in 0..width {
            let y = luma[row * src_stride + col];
            let u = uv_row[col & !1];
            let v = uv_row[(col & !1) + 1];
            let at = (row * width + col) * N;
            put::<N>(&mut dst[at..at + N], yuv_to_rgb(y, u, v));
        }
    }
}

fn rgbx_to_rgb(src: &[u8], src_stride: usize, dst: &mut [u8], width: usize, height: usize) {
    for row in 0..height {
        let line = &src[row * src_stride..row * src_stride + width * 4];
        let out = &mut dst[row * width * 3..(row + 1) * width * 3];
        for (px, rgb) in line.chunks_exact(4).zip(out.chunks_exact_mut(3)) {
            rgb.copy_from_slice(&px[..3]);
        }
    }
}
