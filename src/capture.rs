// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Camera side of the pipeline.
//!
//! The camera pushes frames at its own cadence; [`CaptureSource`] turns that
//! into a pull interface that hands out filled pool buffers one at a time.

use crate::{
    buffer::{Buffer, BufferPool, FillState, FrameInfo},
    error::CaptureError,
    format::{FrameLayout, PixelFormat},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reported by a [`CaptureDevice`].
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    Fault(String),
}

/// A frame dequeued from the camera.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceFrame {
    pub info: FrameInfo,
    /// Bytes written into the destination, zero when the frame was skipped
    pub bytes_used: usize,
}

/// Camera streaming endpoint provided by the platform.
pub trait CaptureDevice: Send {
    /// Human readable device name, used in logs and output paths.
    fn name(&self) -> &str;

    /// Number of buffers the driver keeps queued while streaming.
    fn min_buffers(&self) -> usize {
        2
    }

    /// Starts streaming and returns the layout the driver settled on.
    fn start(&mut self, requested: FrameLayout) -> Result<FrameLayout, DeviceError>;

    /// Waits up to `timeout` for the next frame.
    ///
    /// With a destination the frame is copied into it. Without one the frame
    /// is dequeued and discarded so the camera queue keeps moving.
    fn read(
        &mut self,
        timeout: Duration,
        dst: Option<&mut [u8]>,
    ) -> Result<DeviceFrame, DeviceError>;

    /// Stops streaming. Must be safe to call when already stopped.
    fn stop(&mut self);
}

enum StreamStatus {
    Stopped,
    Streaming(FrameLayout),
    Faulted(String),
}

/// Produces filled pool buffers from a [`CaptureDevice`].
pub struct CaptureSource {
    device: Box<dyn CaptureDevice>,
    pool: Arc<BufferPool>,
    status: StreamStatus,
}

impl CaptureSource {
    pub fn new(device: Box<dyn CaptureDevice>, pool: Arc<BufferPool>) -> Self {
        Self {
            device,
            pool,
            status: StreamStatus::Stopped,
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn min_buffers(&self) -> usize {
        self.device.min_buffers()
    }

    /// Layout of the running stream.
    pub fn layout(&self) -> Option<FrameLayout> {
        match self.status {
            StreamStatus::Streaming(layout) => Some(layout),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, StreamStatus::Streaming(_))
    }

    /// Starts the camera stream.
    ///
    /// A faulted stream is stopped and restarted. Starting a running stream
    /// returns its current layout.
    pub fn start_stream(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<FrameLayout, CaptureError> {
        match self.status {
            StreamStatus::Streaming(layout) => return Ok(layout),
            StreamStatus::Faulted(_) => self.stop_stream(),
            StreamStatus::Stopped => {}
        }

        let requested = FrameLayout::new(format, width, height);
        let layout = self
            .device
            .start(requested)
            .map_err(|e| CaptureError::Start(e.to_string()))?;

        if layout.width != width || layout.height != height || layout.format != format {
            warn!(
                "requested {} but {} set {}",
                requested,
                self.device.name(),
                layout
            );
        }
        if layout.size() > self.pool.buffer_size() {
            self.device.stop();
            return Err(CaptureError::Start(format!(
                "{} frames need {} bytes but pool buffers hold {}",
                layout,
                layout.size(),
                self.pool.buffer_size()
            )));
        }

        info!(device = self.device.name(), %layout, "capture stream started");
        self.status = StreamStatus::Streaming(layout);
        Ok(layout)
    }

    /// Waits up to `timeout` for the next frame and returns it in a FULL
    /// buffer.
    ///
    /// When the pool has no free buffer the frame is still dequeued and
    /// dropped, and [`CaptureError::Exhausted`] is returned.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<Buffer, CaptureError> {
        let layout = match &self.status {
            StreamStatus::Streaming(layout) => *layout,
            StreamStatus::Stopped => return Err(CaptureError::NotStreaming),
            StreamStatus::Faulted(reason) => return Err(CaptureError::Stream(reason.clone())),
        };

        let mut buf = match self.pool.acquire() {
            Ok(buf) => buf,
            Err(exhausted) => {
                return match self.device.read(timeout, None) {
                    Ok(frame) => {
                        debug!(frame = frame.info.number, "no free buffer, frame skipped");
                        Err(CaptureError::Exhausted(exhausted))
                    }
                    Err(e) => Err(self.device_error(e, timeout)),
                };
            }
        };

        buf.set_state(FillState::Filling);
        match self.device.read(timeout, Some(buf.memory_mut())) {
            Ok(frame) => {
                buf.set_len(frame.bytes_used);
                buf.set_layout(layout);
                buf.set_frame(frame.info);
                buf.set_state(FillState::Full);
                Ok(buf)
            }
            Err(e) => {
                self.pool.recycle(buf);
                Err(self.device_error(e, timeout))
            }
        }
    }

    fn device_error(&mut self, err: DeviceError, timeout: Duration) -> CaptureError {
        match err {
            DeviceError::Timeout => CaptureError::Timeout(timeout),
            DeviceError::Fault(reason) => {
                warn!(device = self.device.name(), "capture stream fault: {reason}");
                self.status = StreamStatus::Faulted(reason.clone());
                CaptureError::Stream(reason)
            }
        }
    }

    /// Stops the camera stream. Idempotent.
    pub fn stop_stream(&mut self) {
        if matches!(self.status, StreamStatus::Stopped) {
            return;
        }
        self.device.stop();
        self.status = StreamStatus::Stopped;
        info!(device = self.device.name(), "capture stream stopped");
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::HeapAllocator, synthetic::SyntheticCamera};

    fn source(camera: SyntheticCamera, buffers: usize) -> (CaptureSource, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new(&HeapAllocator, buffers, 64 * 48).unwrap());
        (CaptureSource::new(Box::new(camera), pool.clone()), pool)
    }

    #[test]
    fn delivers_full_buffers() {
        let (mut src, pool) = source(SyntheticCamera::new(), 2);
        src.start_stream(PixelFormat::Raw, 64, 48).unwrap();

        let buf = src.next_frame(Duration::from_millis(100)).unwrap();
        assert_eq!(buf.state(), FillState::Full);
        assert_eq!(buf.len(), 64 * 48);
        assert_eq!(buf.layout(), Some(FrameLayout::new(PixelFormat::Raw, 64, 48)));
        assert_eq!(buf.frame().number, 1);
        pool.release(buf).unwrap();
    }

    #[test]
    fn not_streaming_until_started() {
        let (mut src, _pool) = source(SyntheticCamera::new(), 2);
        assert!(matches!(
            src.next_frame(Duration::from_millis(1)),
            Err(CaptureError::NotStreaming)
        ));
    }

    #[test]
    fn timeout_returns_no_buffer() {
        let camera = SyntheticCamera::new().with_stall_after(0);
        let (mut src, pool) = source(camera, 2);
        src.start_stream(PixelFormat::Raw, 64, 48).unwrap();

        assert!(matches!(
            src.next_frame(Duration::from_millis(10)),
            Err(CaptureError::Timeout(_))
        ));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn exhausted_pool_skips_frame() {
        let camera = SyntheticCamera::new();
        let control = camera.control();
        let (mut src, pool) = source(camera, 1);
        src.start_stream(PixelFormat::Raw, 64, 48).unwrap();

        let held = src.next_frame(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            src.next_frame(Duration::from_millis(10)),
            Err(CaptureError::Exhausted(_))
        ));
        assert_eq!(control.frames_read(), 2);
        pool.release(held).unwrap();
    }

    #[test]
    fn fault_is_terminal_until_restart() {
        let camera = SyntheticCamera::new().with_fault_after(1);
        let (mut src, pool) = source(camera, 2);
        src.start_stream(PixelFormat::Raw, 64, 48).unwrap();

        let buf = src.next_frame(Duration::from_millis(10)).unwrap();
        pool.release(buf).unwrap();
        assert!(matches!(
            src.next_frame(Duration::from_millis(10)),
            Err(CaptureError::Stream(_))
        ));
        assert!(matches!(
            src.next_frame(Duration::from_millis(10)),
            Err(CaptureError::Stream(_))
        ));
        assert_eq!(pool.free_count(), 2);

        src.stop_stream();
        src.stop_stream();
        assert!(!src.is_streaming());
    }

    #[test]
    fn oversized_stream_is_refused() {
        let (mut src, _pool) = source(SyntheticCamera::new(), 2);
        assert!(matches!(
            src.start_stream(PixelFormat::Rgba, 640, 480),
            Err(CaptureError::Start(_))
        ));
        assert!(!src.is_streaming());
    }
}
