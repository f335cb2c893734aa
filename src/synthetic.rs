// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Software stand-ins for the camera and encoder hardware.
//!
//! They follow the same contracts as the real backends and expose a shared
//! control block so tests can inject stalls and faults while a pipeline is
//! running.

use crate::{
    buffer::FrameInfo,
    capture::{CaptureDevice, DeviceError, DeviceFrame},
    encoder::{EncoderSession, SessionError},
    format::{FrameLayout, PixelFormat},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Runtime switches shared with a [`SyntheticCamera`].
#[derive(Debug, Default)]
pub struct CameraControl {
    frames_read: AtomicU64,
    starts: AtomicU64,
    stalled: AtomicBool,
    fault_next: AtomicBool,
}

impl CameraControl {
    /// Frames dequeued so far, skipped ones included.
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    /// While stalled every read times out.
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Relaxed);
    }

    /// Makes the next read report a sensor fault.
    pub fn fault_next(&self) {
        self.fault_next.store(true, Ordering::Relaxed);
    }
}

/// Camera producing a fixed test pattern.
pub struct SyntheticCamera {
    name: String,
    min_buffers: usize,
    interval: Duration,
    resolution: Option<(u32, u32)>,
    stall_after: Option<u64>,
    fault_after: Option<u64>,
    control: Arc<CameraControl>,
    layout: Option<FrameLayout>,
    delivered: u64,
    epoch: Instant,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            name: "synthetic".to_string(),
            min_buffers: 2,
            interval: Duration::ZERO,
            resolution: None,
            stall_after: None,
            fault_after: None,
            control: Arc::default(),
            layout: None,
            delivered: 0,
            epoch: Instant::now(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_min_buffers(mut self, min_buffers: usize) -> Self {
        self.min_buffers = min_buffers;
        self
    }

    /// Paces frames like a sensor running at `1 / interval` fps.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Streams at this resolution whatever the caller requests.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    /// Times out every read after `frames` frames.
    pub fn with_stall_after(mut self, frames: u64) -> Self {
        self.stall_after = Some(frames);
        self
    }

    /// Faults after `frames` frames.
    pub fn with_fault_after(mut self, frames: u64) -> Self {
        self.fault_after = Some(frames);
        self
    }

    pub fn control(&self) -> Arc<CameraControl> {
        self.control.clone()
    }
}

impl CaptureDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_buffers(&self) -> usize {
        self.min_buffers
    }

    fn start(&mut self, requested: FrameLayout) -> Result<FrameLayout, DeviceError> {
        let layout = match self.resolution {
            Some((width, height)) => FrameLayout::new(requested.format, width, height),
            None => requested,
        };
        self.layout = Some(layout);
        self.control.starts.fetch_add(1, Ordering::Relaxed);
        Ok(layout)
    }

    fn read(
        &mut self,
        timeout: Duration,
        dst: Option<&mut [u8]>,
    ) -> Result<DeviceFrame, DeviceError> {
        let Some(layout) = self.layout else {
            return Err(DeviceError::Fault("stream not started".to_string()));
        };

        let stalled = self.control.stalled.load(Ordering::Relaxed)
            || self.stall_after.is_some_and(|n| self.delivered >= n);
        if stalled || self.interval > timeout {
            thread::sleep(timeout);
            return Err(DeviceError::Timeout);
        }
        if self.control.fault_next.swap(false, Ordering::Relaxed)
            || self.fault_after.is_some_and(|n| self.delivered >= n)
        {
            return Err(DeviceError::Fault("sensor disconnected".to_string()));
        }
        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }

        self.delivered += 1;
        self.control.frames_read.fetch_add(1, Ordering::Relaxed);

        let bytes_used = match dst {
            Some(dst) => {
                let len = layout.size().min(dst.len());
                for (i, byte) in dst[..len].iter_mut().enumerate() {
                    *byte = (i % 251) as u8;
                }
                len
            }
            None => 0,
        };

        Ok(DeviceFrame {
            info: FrameInfo {
                number: self.delivered,
                timestamp: self.epoch.elapsed(),
            },
            bytes_used,
        })
    }

    fn stop(&mut self) {
        self.layout = None;
    }
}

/// Runtime switches shared with a [`SyntheticEncoder`].
#[derive(Debug, Default)]
pub struct EncoderControl {
    jobs: AtomicU64,
    resets: AtomicU64,
    fail_every: AtomicU64,
    fault_next: AtomicBool,
    stall_next_us: AtomicU64,
    stall_always_us: AtomicU64,
    fail_resets: AtomicBool,
    closed: AtomicBool,
}

impl EncoderControl {
    /// Jobs the session has started.
    pub fn jobs(&self) -> u64 {
        self.jobs.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Rejects every `n`th job as a transient failure; zero disables.
    pub fn fail_every(&self, n: u64) {
        self.fail_every.store(n, Ordering::Relaxed);
    }

    /// Makes the next job fault the hardware.
    pub fn fault_next(&self) {
        self.fault_next.store(true, Ordering::Relaxed);
    }

    /// Delays the next job by `delay`.
    pub fn stall_next(&self, delay: Duration) {
        self.stall_next_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Delays every job by `delay` until cleared with `None`.
    pub fn stall_always(&self, delay: Option<Duration>) {
        let us = delay.map_or(0, |d| d.as_micros() as u64);
        self.stall_always_us.store(us, Ordering::Relaxed);
    }

    pub fn fail_resets(&self, fail: bool) {
        self.fail_resets.store(fail, Ordering::Relaxed);
    }
}

/// Encoder that echoes its input as the "bitstream".
///
/// The output length always equals the input length, which makes buffer
/// accounting easy to check.
pub struct SyntheticEncoder {
    formats: Vec<PixelFormat>,
    control: Arc<EncoderControl>,
}

impl Default for SyntheticEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticEncoder {
    /// Encoder accepting every pixel format.
    pub fn new() -> Self {
        Self {
            formats: PixelFormat::ALL.to_vec(),
            control: Arc::default(),
        }
    }

    /// Restricts the accepted formats, preferred first.
    pub fn with_formats(mut self, formats: &[PixelFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    pub fn control(&self) -> Arc<EncoderControl> {
        self.control.clone()
    }
}

impl EncoderSession for SyntheticEncoder {
    fn name(&self) -> &str {
        "synthetic-jpeg"
    }

    fn formats(&self) -> &[PixelFormat] {
        &self.formats
    }

    fn encode(
        &mut self,
        input: &[u8],
        _layout: &FrameLayout,
        _quality: u8,
        output: &mut [u8],
    ) -> Result<usize, SessionError> {
        let job = self.control.jobs.fetch_add(1, Ordering::Relaxed) + 1;

        let stall = self.control.stall_next_us.swap(0, Ordering::Relaxed)
            + self.control.stall_always_us.load(Ordering::Relaxed);
        if stall > 0 {
            thread::sleep(Duration::from_micros(stall));
        }
        if self.control.fault_next.swap(false, Ordering::Relaxed) {
            return Err(SessionError::Fault("synthetic bus error".to_string()));
        }
        let every = self.control.fail_every.load(Ordering::Relaxed);
        if every > 0 && job % every == 0 {
            return Err(SessionError::Rejected(format!(
                "synthetic transient failure on job {job}"
            )));
        }

        let len = input.len().min(output.len());
        output[..len].copy_from_slice(&input[..len]);
        Ok(len)
    }

    fn reinitialize(&mut self) -> Result<(), SessionError> {
        self.control.resets.fetch_add(1, Ordering::Relaxed);
        if self.control.fail_resets.load(Ordering::Relaxed) {
            return Err(SessionError::Fault("reinitialize failed".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.control.closed.store(true, Ordering::Relaxed);
    }
}
