// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};
use tracy_client::{plot_name, Client};

const FPS_HISTORY: usize = 30;

/// Snapshot of the pipeline counters.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Counters {
    /// Frames dequeued from the camera, including skipped ones
    pub frames_captured: u64,
    /// Captured frames that never reached the sink
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    /// Capture calls that timed out without a frame
    pub capture_timeouts: u64,
    /// Encoder timeouts and hardware faults
    pub encoder_failures: u64,
    pub bytes_encoded: u64,
    /// Mean time from frame captured to frame delivered
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Mean time spent waiting on the camera
    pub avg_capture_ms: f64,
    /// Mean time spent converting the pixel format
    pub avg_convert_ms: f64,
    /// Mean time from submit to encoder completion
    pub avg_encode_ms: f64,
    /// Mean time spent in the sink
    pub avg_deliver_ms: f64,
    /// Delivered frames per second over the last 30 frames
    pub fps: f64,
}

/// Timestamps of one pipeline cycle.
#[derive(Debug)]
pub struct CycleTimer {
    acquire: Instant,
    captured: Option<Instant>,
    submitted: Option<Instant>,
    completed: Option<Instant>,
}

impl CycleTimer {
    pub fn captured(&mut self) {
        self.captured = Some(Instant::now());
    }

    pub fn submitted(&mut self) {
        self.submitted = Some(Instant::now());
    }

    pub fn completed(&mut self) {
        self.completed = Some(Instant::now());
    }
}

struct FpsWindow {
    prev: Option<Instant>,
    history: [f64; FPS_HISTORY],
    index: usize,
    filled: usize,
}

impl FpsWindow {
    fn update(&mut self, now: Instant) -> f64 {
        if let Some(prev) = self.prev.replace(now) {
            let elapsed = now.duration_since(prev).as_secs_f64();
            if elapsed > 0.0 {
                self.history[self.index] = 1.0 / elapsed;
                self.index = (self.index + 1) % FPS_HISTORY;
                self.filled = (self.filled + 1).min(FPS_HISTORY);
            }
        }
        self.current()
    }

    fn current(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.history[..self.filled].iter().sum::<f64>() / self.filled as f64
    }
}

#[derive(Default)]
struct Stage {
    total_ns: AtomicU64,
    count: AtomicU64,
}

impl Stage {
    fn record(&self, elapsed: Duration) {
        self.total_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn avg_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_ns.load(Ordering::Relaxed) as f64 / count as f64 / 1e6
    }
}

/// Lock-free counters for the capture, convert, encode and deliver stages.
///
/// Written by the pipeline worker and read from any thread through
/// [`Profiler::counters`]. Nothing here feeds back into pipeline control.
pub struct Profiler {
    captured: AtomicU64,
    dropped: AtomicU64,
    encoded: AtomicU64,
    capture_timeouts: AtomicU64,
    encoder_failures: AtomicU64,
    bytes: AtomicU64,
    max_latency_ns: AtomicU64,
    latency: Stage,
    capture: Stage,
    convert: Stage,
    encode: Stage,
    deliver: Stage,
    fps: Mutex<FpsWindow>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            captured: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            encoded: AtomicU64::new(0),
            capture_timeouts: AtomicU64::new(0),
            encoder_failures: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            max_latency_ns: AtomicU64::new(0),
            latency: Stage::default(),
            capture: Stage::default(),
            convert: Stage::default(),
            encode: Stage::default(),
            deliver: Stage::default(),
            fps: Mutex::new(FpsWindow {
                prev: None,
                history: [0.0; FPS_HISTORY],
                index: 0,
                filled: 0,
            }),
        }
    }

    /// Starts timing a cycle at buffer acquisition.
    pub fn begin(&self) -> CycleTimer {
        CycleTimer {
            acquire: Instant::now(),
            captured: None,
            submitted: None,
            completed: None,
        }
    }

    pub fn frame_captured(&self, timer: &mut CycleTimer) {
        timer.captured();
        self.captured.fetch_add(1, Ordering::Relaxed);
        self.capture.record(timer.acquire.elapsed());
    }

    /// Counts a frame that was dequeued but had nowhere to go.
    pub fn frame_skipped(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capture_timeout(&self) {
        self.capture_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encoder_failure(&self) {
        self.encoder_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_submitted(&self, timer: &mut CycleTimer) {
        timer.submitted();
        if let Some(captured) = timer.captured {
            self.convert.record(captured.elapsed());
        }
    }

    pub fn frame_encoded(&self, timer: &mut CycleTimer, bytes: usize) {
        timer.completed();
        self.encoded.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Some(submitted) = timer.submitted {
            self.encode.record(submitted.elapsed());
        }
    }

    /// Closes a cycle once the sink returned.
    pub fn frame_delivered(&self, timer: CycleTimer) {
        let now = Instant::now();
        if let Some(completed) = timer.completed {
            self.deliver.record(now.duration_since(completed));
        }
        let start = timer.captured.unwrap_or(timer.acquire);
        let latency = now.duration_since(start);
        self.latency.record(latency);
        self.max_latency_ns
            .fetch_max(latency.as_nanos() as u64, Ordering::Relaxed);

        let fps = self
            .fps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(now);

        if let Some(client) = Client::running() {
            client.frame_mark();
            client.plot(plot_name!("latency_ms"), latency.as_secs_f64() * 1e3);
            client.plot(plot_name!("fps"), fps);
        }
    }

    pub fn counters(&self) -> Counters {
        Counters {
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_encoded: self.encoded.load(Ordering::Relaxed),
            capture_timeouts: self.capture_timeouts.load(Ordering::Relaxed),
            encoder_failures: self.encoder_failures.load(Ordering::Relaxed),
            bytes_encoded: self.bytes.load(Ordering::Relaxed),
            avg_latency_ms: self.latency.avg_ms(),
            max_latency_ms: self.max_latency_ns.load(Ordering::Relaxed) as f64 / 1e6,
            avg_capture_ms: self.capture.avg_ms(),
            avg_convert_ms: self.convert.avg_ms(),
            avg_encode_ms: self.encode.avg_ms(),
            avg_deliver_ms: self.deliver.avg_ms(),
            fps: self
                .fps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .current(),
        }
    }
}
