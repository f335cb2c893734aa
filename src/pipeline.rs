// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture to JPEG pipeline coordinator.
//!
//! A [`Pipeline`] drives the fixed cycle
//!
//! ```text
//!   capture --> [convert] --> submit --> wait --> deliver --> release
//! ```
//!
//! over one shared [`BufferPool`]. A single worker runs the cycle at a time:
//! the caller's thread inside [`Pipeline::capture_one`] or
//! [`Pipeline::stream_to`], or the thread started by
//! [`Pipeline::spawn_stream`]. [`Pipeline::stop`] may be called from any
//! thread, the sink included.
//!
//! With [`ImageKind::Pixels`] the encoder is skipped and the converted frame
//! is copied out as is.
//!
//! Per-frame problems (capture timeouts, skipped frames, conversion errors,
//! rejected encodes) are counted and the stream carries on. Encoder timeouts
//! and hardware faults reset the encoder and count as consecutive failures.
//! A reset the encoder has not acknowledged in time stays pending: frames are
//! dropped while it is, and each unanswered retry is another failure.
//! Reaching the configured limit, a session that refuses to reinitialize, or
//! a capture stream fault moves the pipeline to [`PipelineState::Failed`] and
//! the error is returned to the caller.

use crate::{
    buffer::{BufferAllocator, BufferPool, HeapAllocator},
    capture::{CaptureDevice, CaptureSource},
    convert::{self, FormatStage},
    encoder::{DriverState, EncodeRequest, EncodeResult, EncoderDriver, EncoderSession},
    error::{CaptureError, ConversionError, EncoderError, Error, InitError, Result},
    format::{FrameLayout, PixelFormat},
    profiler::{Counters, CycleTimer, Profiler},
    synthetic::{SyntheticCamera, SyntheticEncoder},
};
use kanal::Receiver;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, debug_span, error, info, warn};

/// Extra bytes per buffer so a compressed frame may exceed the raw frame.
const JPEG_HEADROOM: usize = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// Resources allocated, stream never started
    Uninitialized,
    Streaming,
    /// Stop requested while a worker was mid-cycle
    Stopping,
    Stopped,
    /// A fatal error ended the stream; `stop` then `start` to recover
    Failed,
}

/// What a pipeline hands to its caller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// JPEG bitstream from the encoder
    #[default]
    Jpeg,
    /// Uncompressed frames converted to the given format; the encoder is
    /// not used
    Pixels(PixelFormat),
}

/// Pipeline settings.
///
/// Buffer count, timeouts and the failure threshold depend on the target
/// hardware, so all of them are configurable. Missing fields in a JSON
/// document take their [`Default`] values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture pixel format requested from the camera
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// JPEG quality, 1 to 100
    pub quality: u8,
    /// Pool buffers; raised to the camera's minimum when lower
    pub buffer_count: usize,
    pub frame_timeout_ms: u64,
    pub encode_timeout_ms: u64,
    pub reset_timeout_ms: u64,
    /// Consecutive encoder timeouts or faults tolerated before failing
    pub max_consecutive_failures: u32,
    /// JPEG, or raw frames in a given pixel format
    pub output: ImageKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Yuyv,
            width: 1920,
            height: 1080,
            quality: 80,
            buffer_count: 4,
            frame_timeout_ms: 1000,
            encode_timeout_ms: 1000,
            reset_timeout_ms: 2000,
            max_consecutive_failures: 5,
            output: ImageKind::Jpeg,
        }
    }
}

impl PipelineConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_millis(self.encode_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Checks every field without touching any hardware.
    pub fn validate(&self) -> Result<(), InitError> {
        let invalid = |msg: String| Err(InitError::InvalidConfig(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!("resolution {}x{}", self.width, self.height));
        }
        if matches!(self.format, PixelFormat::Yuyv | PixelFormat::Nv12) && self.width % 2 != 0 {
            return invalid(format!("{} needs an even width", self.format));
        }
        if self.format == PixelFormat::Nv12 && self.height % 2 != 0 {
            return invalid(format!("{} needs an even height", self.format));
        }
        if !(1..=100).contains(&self.quality) {
            return invalid(format!("quality {} outside 1-100", self.quality));
        }
        if self.buffer_count == 0 {
            return invalid("buffer_count must be at least 1".to_string());
        }
        if self.frame_timeout_ms == 0 || self.encode_timeout_ms == 0 || self.reset_timeout_ms == 0
        {
            return invalid("timeouts must be non-zero".to_string());
        }
        if self.max_consecutive_failures == 0 {
            return invalid("max_consecutive_failures must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Hardware a pipeline runs on.
pub struct Backend {
    pub allocator: Box<dyn BufferAllocator>,
    pub camera: Box<dyn CaptureDevice>,
    pub encoder: Box<dyn EncoderSession>,
}

impl Backend {
    pub fn new(
        allocator: impl BufferAllocator + 'static,
        camera: impl CaptureDevice + 'static,
        encoder: impl EncoderSession + 'static,
    ) -> Self {
        Self {
            allocator: Box::new(allocator),
            camera: Box::new(camera),
            encoder: Box::new(encoder),
        }
    }

    /// Heap buffers, test pattern camera and echo encoder.
    pub fn synthetic() -> Self {
        Self::new(HeapAllocator, SyntheticCamera::new(), SyntheticEncoder::new())
    }
}

/// A frame handed to the caller, JPEG unless the pipeline delivers raw
/// pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
    /// Encode sequence, one per submitted frame
    pub sequence: u64,
    /// Frame number reported by the camera
    pub frame_number: u64,
    /// Capture timestamp reported by the camera
    pub timestamp: Duration,
}

struct Worker {
    source: CaptureSource,
    stage: FormatStage,
    encoder: EncoderDriver,
    layout: FrameLayout,
    next_sequence: u64,
    failures: u32,
}

/// Capture to JPEG pipeline. See the module documentation.
pub struct Pipeline {
    config: PipelineConfig,
    pool: Arc<BufferPool>,
    profiler: Profiler,
    state: Mutex<PipelineState>,
    stop_requested: AtomicBool,
    worker: Mutex<Worker>,
}

/// Buffers one cycle holds at its peak. Conversion releases the captured
/// buffer before the encoder takes its output buffer, so it adds none.
const CYCLE_BUFFERS: usize = 2;

/// Picks the encoder input format for frames captured as `capture`.
fn encoder_input(accepted: &[PixelFormat], capture: PixelFormat) -> Option<PixelFormat> {
    if accepted.contains(&capture) {
        return Some(capture);
    }
    accepted
        .iter()
        .copied()
        .find(|&format| convert::supported(capture, format))
}

/// Format the format stage produces for `output`.
fn stage_target(
    output: ImageKind,
    accepted: &[PixelFormat],
    capture: PixelFormat,
) -> Option<PixelFormat> {
    match output {
        ImageKind::Jpeg => encoder_input(accepted, capture),
        ImageKind::Pixels(format) => convert::supported(capture, format).then_some(format),
    }
}

impl Pipeline {
    /// Validates `config`, allocates the buffer pool and opens the encoder
    /// session. The camera is not started until [`Pipeline::start`].
    pub fn initialize(config: PipelineConfig, backend: Backend) -> Result<Self, InitError> {
        config.validate()?;
        let Backend {
            allocator,
            camera,
            encoder,
        } = backend;

        let requested = FrameLayout::new(config.format, config.width, config.height);
        let target =
            stage_target(config.output, encoder.formats(), config.format).ok_or_else(|| {
                InitError::InvalidConfig(match config.output {
                    ImageKind::Jpeg => {
                        format!("{} cannot encode {} frames", encoder.name(), config.format)
                    }
                    ImageKind::Pixels(format) => {
                        format!("no conversion from {} to {}", config.format, format)
                    }
                })
            })?;
        let encoded = FrameLayout::new(target, config.width, config.height);

        let capacity = config.buffer_count.max(camera.min_buffers());
        if capacity < CYCLE_BUFFERS {
            return Err(InitError::InvalidConfig(format!(
                "{capacity} buffers but each frame needs {CYCLE_BUFFERS}"
            )));
        }
        let buffer_size = requested.size().max(encoded.size()) + JPEG_HEADROOM;
        let pool = Arc::new(
            BufferPool::new(allocator.as_ref(), capacity, buffer_size)
                .map_err(InitError::Allocation)?,
        );

        let source = CaptureSource::new(camera, pool.clone());
        let encoder = EncoderDriver::new(encoder, pool.clone(), config.reset_timeout())?;
        info!(
            camera = source.device_name(),
            encoder = encoder.name(),
            %requested,
            capacity,
            buffer_size,
            "pipeline initialized"
        );

        let worker = Worker {
            stage: FormatStage::passthrough(pool.clone(), config.format),
            source,
            encoder,
            layout: requested,
            next_sequence: 0,
            failures: 0,
        };
        Ok(Self {
            config,
            pool,
            profiler: Profiler::new(),
            state: Mutex::new(PipelineState::Uninitialized),
            stop_requested: AtomicBool::new(false),
            worker: Mutex::new(worker),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    pub fn counters(&self) -> Counters {
        self.profiler.counters()
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.lock_state();
        if *state != next {
            info!(from = ?*state, to = ?next, "pipeline state");
            *state = next;
        }
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Starts the camera stream. Starting a streaming pipeline is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        match self.state() {
            PipelineState::Streaming => return Ok(()),
            PipelineState::Uninitialized | PipelineState::Stopped => {}
            state => return Err(Error::InvalidState { op: "start", state }),
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        if worker.encoder.state() != DriverState::Idle {
            worker.encoder.reset()?;
        }
        let layout = worker.source.start_stream(
            self.config.format,
            self.config.width,
            self.config.height,
        )?;
        if let Err(e) = self.prepare_stage(&mut worker, layout) {
            worker.source.stop_stream();
            return Err(e);
        }

        worker.layout = layout;
        worker.failures = 0;
        self.set_state(PipelineState::Streaming);
        Ok(())
    }

    fn prepare_stage(&self, worker: &mut Worker, layout: FrameLayout) -> Result<()> {
        let target = stage_target(self.config.output, worker.encoder.formats(), layout.format)
            .ok_or(ConversionError::Unsupported {
                from: layout.format,
                to: match self.config.output {
                    ImageKind::Jpeg => worker.encoder.preferred_format(),
                    ImageKind::Pixels(format) => format,
                },
            })?;
        let stage = FormatStage::new(self.pool.clone(), layout.format, target)?;

        let encoded = FrameLayout::new(target, layout.width, layout.height);
        if encoded.size() > self.pool.buffer_size() {
            return Err(InitError::InvalidConfig(format!(
                "{} frames need {} bytes but pool buffers hold {}",
                encoded,
                encoded.size(),
                self.pool.buffer_size()
            ))
            .into());
        }

        if !stage.is_passthrough() {
            info!(from = %layout.format, to = %target, "converting frames in software");
        }
        worker.stage = stage;
        Ok(())
    }

    /// Stops the stream. Idempotent, and safe to call from the sink.
    ///
    /// When a worker is mid-cycle the pipeline is STOPPING until that cycle
    /// completes or times out; the worker then stops the stream itself.
    pub fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut state = self.lock_state();
            match *state {
                PipelineState::Uninitialized | PipelineState::Stopped => return Ok(()),
                PipelineState::Streaming => {
                    info!(from = ?*state, to = ?PipelineState::Stopping, "pipeline state");
                    *state = PipelineState::Stopping;
                }
                PipelineState::Stopping | PipelineState::Failed => {}
            }
        }

        match self.worker.try_lock() {
            Ok(mut worker) => self.finish_stop(&mut worker),
            Err(TryLockError::Poisoned(poisoned)) => self.finish_stop(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => debug!("stop deferred to the running worker"),
        }
        Ok(())
    }

    fn finish_stop(&self, worker: &mut Worker) {
        if !matches!(
            self.state(),
            PipelineState::Stopping | PipelineState::Failed
        ) {
            return;
        }
        worker.source.stop_stream();
        if worker.encoder.state() != DriverState::Idle {
            if let Err(e) = worker.encoder.reset() {
                warn!("encoder reset during stop failed: {e}");
            }
        }
        self.set_state(PipelineState::Stopped);
    }

    /// Runs `f` as the pipeline worker.
    fn run<T>(&self, op: &'static str, f: impl FnOnce(&mut Worker) -> Result<T>) -> Result<T> {
        let result = {
            let mut worker = self.lock_worker();
            let result = match self.state() {
                PipelineState::Streaming => f(&mut *worker),
                state => Err(Error::InvalidState { op, state }),
            };
            let result = result.map_err(|e| self.escalate(e));
            if self.stopping() {
                self.finish_stop(&mut worker);
            }
            result
        };

        // A stop issued between the check above and the unlock found the
        // worker busy and left the stream to us.
        if self.stopping() {
            if let Ok(mut worker) = self.worker.try_lock() {
                self.finish_stop(&mut worker);
            }
        }
        result
    }

    fn escalate(&self, err: Error) -> Error {
        if err.is_fatal() {
            error!("pipeline failed: {err}");
            self.set_state(PipelineState::Failed);
        }
        err
    }

    /// Runs cycles until one frame is delivered or `timeout` passes.
    pub fn capture_one(&self, timeout: Duration) -> Result<EncodedImage> {
        let deadline = Instant::now() + timeout;
        self.run("capture", |worker| loop {
            if self.stopping() {
                return Err(Error::InvalidState {
                    op: "capture",
                    state: PipelineState::Stopping,
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            if let Some((image, timer)) = self.cycle(worker, remaining)? {
                self.profiler.frame_delivered(timer);
                return Ok(image);
            }
        })
    }

    /// Delivers every encoded frame to `sink` until [`Pipeline::stop`] is
    /// called or a fatal error occurs.
    ///
    /// Returns [`Error::Timeout`] when no frame was delivered for `timeout`;
    /// the pipeline keeps streaming and `stream_to` may be called again.
    pub fn stream_to<F>(&self, mut sink: F, timeout: Duration) -> Result<()>
    where
        F: FnMut(EncodedImage),
    {
        self.run("stream", |worker| {
            let mut last = Instant::now();
            while !self.stopping() {
                let idle = last.elapsed();
                if idle >= timeout {
                    return Err(Error::Timeout(timeout));
                }
                if let Some((image, timer)) = self.cycle(worker, timeout - idle)? {
                    sink(image);
                    self.profiler.frame_delivered(timer);
                    last = Instant::now();
                }
            }
            Ok(())
        })
    }

    /// Streams on a dedicated thread into a bounded channel.
    ///
    /// Frames the receiver has no room for are dropped and counted. A
    /// timeout is logged and streaming continues; the worker ends on stop or
    /// on a fatal error, which [`StreamWorker::stop`] returns.
    pub fn spawn_stream(self: &Arc<Self>, timeout: Duration) -> Result<StreamWorker> {
        let state = self.state();
        if state != PipelineState::Streaming {
            return Err(Error::InvalidState {
                op: "spawn stream",
                state,
            });
        }

        let (tx, frames) = kanal::bounded(self.pool.capacity());
        let pipeline = self.clone();
        let handle = thread::Builder::new()
            .name("capture-stream".to_string())
            .spawn(move || {
                let mut sink = |image: EncodedImage| match tx.try_send(image) {
                    Ok(true) => {}
                    Ok(false) => {
                        pipeline.profiler.frame_dropped();
                        debug!("stream receiver full, frame dropped");
                    }
                    Err(_) => {
                        let _ = pipeline.stop();
                    }
                };
                loop {
                    match pipeline.stream_to(&mut sink, timeout) {
                        Err(Error::Timeout(t)) if !pipeline.stopping() => {
                            warn!("no frame delivered within {t:?}")
                        }
                        Err(Error::Timeout(_) | Error::InvalidState { .. })
                            if pipeline.stopping() =>
                        {
                            return Ok(())
                        }
                        other => return other,
                    }
                }
            })
            .map_err(Error::Spawn)?;

        Ok(StreamWorker {
            pipeline: self.clone(),
            frames,
            handle: Some(handle),
        })
    }

    fn cycle(
        &self,
        worker: &mut Worker,
        wait: Duration,
    ) -> Result<Option<(EncodedImage, CycleTimer)>> {
        let mut timer = self.profiler.begin();
        let input = match worker.source.next_frame(self.config.frame_timeout().min(wait)) {
            Ok(buf) => buf,
            Err(CaptureError::Timeout(timeout)) => {
                self.profiler.capture_timeout();
                debug!(?timeout, "capture timeout");
                return Ok(None);
            }
            Err(CaptureError::Exhausted(e)) => {
                self.profiler.frame_skipped();
                warn!("{e}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.profiler.frame_captured(&mut timer);

        let frame = input.frame();
        let _span = debug_span!("frame", number = frame.number).entered();

        let input = match worker.stage.convert(input) {
            Ok(buf) => buf,
            Err(e) => {
                self.profiler.frame_dropped();
                warn!(frame = frame.number, "frame dropped: {e}");
                return Ok(None);
            }
        };

        if worker.encoder.reset_pending() {
            self.pool.release(input)?;
            self.profiler.frame_dropped();
            debug!(frame = frame.number, "frame dropped while the encoder resets");
            return self.retry_reset(worker).map(|()| None);
        }

        let sequence = worker.next_sequence;
        worker.next_sequence += 1;
        self.profiler.frame_submitted(&mut timer);

        if let ImageKind::Pixels(_) = self.config.output {
            let image = EncodedImage {
                bytes: input.data().to_vec(),
                kind: self.config.output,
                width: worker.layout.width,
                height: worker.layout.height,
                sequence,
                frame_number: frame.number,
                timestamp: frame.timestamp,
            };
            self.pool.release(input)?;
            self.profiler.frame_encoded(&mut timer, image.bytes.len());
            return Ok(Some((image, timer)));
        }

        let request = EncodeRequest {
            input,
            quality: self.config.quality,
            sequence,
        };
        let encode_timeout = self.config.encode_timeout();
        let result = match worker
            .encoder
            .submit(request)
            .and_then(|()| worker.encoder.wait(encode_timeout))
        {
            Ok(result) => result,
            Err(e) => return self.encoder_failure(worker, sequence, e).map(|()| None),
        };
        self.profiler.frame_encoded(&mut timer, result.len());
        worker.failures = 0;

        let image = EncodedImage {
            bytes: result.bytes().to_vec(),
            kind: ImageKind::Jpeg,
            width: worker.layout.width,
            height: worker.layout.height,
            sequence,
            frame_number: frame.number,
            timestamp: frame.timestamp,
        };
        let EncodeResult { input, output, .. } = result;
        let released = self.pool.release(input);
        self.pool.release(output)?;
        released?;
        Ok(Some((image, timer)))
    }

    fn encoder_failure(&self, worker: &mut Worker, sequence: u64, err: EncoderError) -> Result<()> {
        match err {
            EncoderError::Rejected { .. } | EncoderError::Pool(_) => {
                self.profiler.frame_dropped();
                warn!(sequence, "frame dropped: {err}");
                Ok(())
            }
            EncoderError::Timeout(_) | EncoderError::Hardware(_) => {
                self.profiler.frame_dropped();
                self.profiler.encoder_failure();
                worker.failures += 1;
                warn!(sequence, failures = worker.failures, "{err}, resetting encoder");
                let last = match worker.encoder.reset() {
                    Ok(()) => err,
                    Err(e @ EncoderError::ResetTimeout(_)) => e,
                    Err(e) => return Err(e.into()),
                };
                self.check_failures(worker, last)
            }
            err => Err(err.into()),
        }
    }

    /// Waits again for a reset the encoder has not acknowledged yet. Every
    /// unanswered wait counts as another consecutive failure.
    fn retry_reset(&self, worker: &mut Worker) -> Result<()> {
        match worker.encoder.reset() {
            Ok(()) => {
                info!(failures = worker.failures, "encoder recovered");
                Ok(())
            }
            Err(err @ EncoderError::ResetTimeout(_)) => {
                self.profiler.encoder_failure();
                worker.failures += 1;
                warn!(failures = worker.failures, "{err}");
                self.check_failures(worker, err)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_failures(&self, worker: &Worker, last: EncoderError) -> Result<()> {
        if worker.failures >= self.config.max_consecutive_failures {
            return Err(Error::EncoderStalled {
                failures: worker.failures,
                last,
            });
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Handle to the thread started by [`Pipeline::spawn_stream`].
///
/// Dropping the handle stops the pipeline and joins the thread.
pub struct StreamWorker {
    pipeline: Arc<Pipeline>,
    frames: Receiver<EncodedImage>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl StreamWorker {
    /// Encoded frames in delivery order.
    pub fn frames(&self) -> &Receiver<EncodedImage> {
        &self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stops the pipeline, joins the worker and returns how it ended.
    pub fn stop(mut self) -> Result<()> {
        match self.shutdown() {
            Some(Ok(result)) => result,
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) -> Option<thread::Result<Result<()>>> {
        let handle = self.handle.take()?;
        let _ = self.pipeline.stop();
        Some(handle.join())
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        if let Some(Err(_)) = self.shutdown() {
            error!("stream worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PipelineConfig {
        PipelineConfig {
            format: PixelFormat::Raw,
            width: 64,
            height: 48,
            frame_timeout_ms: 100,
            encode_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let cases = [
            PipelineConfig {
                quality: 0,
                ..small()
            },
            PipelineConfig {
                quality: 101,
                ..small()
            },
            PipelineConfig {
                width: 0,
                ..small()
            },
            PipelineConfig {
                format: PixelFormat::Yuyv,
                width: 63,
                ..small()
            },
            PipelineConfig {
                buffer_count: 0,
                ..small()
            },
            PipelineConfig {
                encode_timeout_ms: 0,
                ..small()
            },
            PipelineConfig {
                max_consecutive_failures: 0,
                ..small()
            },
        ];
        for config in cases {
            assert!(
                matches!(
                    Pipeline::initialize(config.clone(), Backend::synthetic()),
                    Err(InitError::InvalidConfig(_))
                ),
                "{config:?}"
            );
        }
    }

    #[test]
    fn config_reads_partial_json() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "format": "nv12", "quality": 95 }"#).unwrap();
        assert_eq!(config.format, PixelFormat::Nv12);
        assert_eq!(config.quality, 95);
        assert_eq!(config.buffer_count, PipelineConfig::default().buffer_count);
    }

    #[test]
    fn capacity_follows_camera_minimum() {
        let backend = Backend::new(
            HeapAllocator,
            SyntheticCamera::new().with_min_buffers(6),
            SyntheticEncoder::new(),
        );
        let pipeline = Pipeline::initialize(small(), backend).unwrap();
        assert_eq!(pipeline.pool().capacity(), 6);
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn single_buffer_is_rejected() {
        let config = PipelineConfig {
            buffer_count: 1,
            ..small()
        };
        let backend = Backend::new(
            HeapAllocator,
            SyntheticCamera::new().with_min_buffers(1),
            SyntheticEncoder::new(),
        );
        assert!(matches!(
            Pipeline::initialize(config, backend),
            Err(InitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unencodable_format_is_rejected() {
        let config = PipelineConfig {
            format: PixelFormat::Raw,
            ..small()
        };
        let backend = Backend::new(
            HeapAllocator,
            SyntheticCamera::new(),
            SyntheticEncoder::new().with_formats(&[PixelFormat::Rgb]),
        );
        assert!(matches!(
            Pipeline::initialize(config, backend),
            Err(InitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn capture_requires_streaming() {
        let pipeline = Pipeline::initialize(small(), Backend::synthetic()).unwrap();
        assert!(matches!(
            pipeline.capture_one(Duration::from_millis(10)),
            Err(Error::InvalidState {
                state: PipelineState::Uninitialized,
                ..
            })
        ));
    }

    #[test]
    fn start_stop_cycle() {
        let pipeline = Pipeline::initialize(small(), Backend::synthetic()).unwrap();
        pipeline.start().unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Streaming);

        pipeline.stop().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Streaming);
        pipeline.capture_one(Duration::from_secs(1)).unwrap();
        pipeline.stop().unwrap();
        assert_eq!(pipeline.pool().free_count(), pipeline.pool().capacity());
    }

    #[test]
    fn converts_when_encoder_needs_rgb() {
        let config = PipelineConfig {
            format: PixelFormat::Yuyv,
            ..small()
        };
        let backend = Backend::new(
            HeapAllocator,
            SyntheticCamera::new(),
            SyntheticEncoder::new().with_formats(&[PixelFormat::Rgb]),
        );
        let pipeline = Pipeline::initialize(config, backend).unwrap();
        pipeline.start().unwrap();

        let image = pipeline.capture_one(Duration::from_secs(1)).unwrap();
        // The echo encoder returns the converted RGB frame.
        assert_eq!(image.bytes.len(), 64 * 48 * 3);
        assert_eq!((image.width, image.height), (64, 48));
    }

    #[test]
    fn delivers_raw_frames_without_encoding() {
        let config = PipelineConfig {
            format: PixelFormat::Yuyv,
            output: ImageKind::Pixels(PixelFormat::Rgba),
            ..small()
        };
        let encoder = SyntheticEncoder::new();
        let control = encoder.control();
        let pipeline =
            Pipeline::initialize(config, Backend::new(HeapAllocator, SyntheticCamera::new(), encoder))
                .unwrap();
        pipeline.start().unwrap();

        for _ in 0..3 {
            let image = pipeline.capture_one(Duration::from_secs(1)).unwrap();
            assert_eq!(image.kind, ImageKind::Pixels(PixelFormat::Rgba));
            assert_eq!(image.bytes.len(), 64 * 48 * 4);
            // Opaque alpha from the YUYV kernel.
            assert!(image.bytes.chunks_exact(4).all(|px| px[3] == 0xff));
        }
        assert_eq!(control.jobs(), 0);
        assert_eq!(pipeline.counters().frames_encoded, 3);
        assert_eq!(pipeline.pool().free_count(), pipeline.pool().capacity());
    }

    #[test]
    fn unconvertible_frame_format_is_rejected() {
        let config = PipelineConfig {
            format: PixelFormat::Raw,
            output: ImageKind::Pixels(PixelFormat::Rgba),
            ..small()
        };
        assert!(matches!(
            Pipeline::initialize(config, Backend::synthetic()),
            Err(InitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn encoder_input_prefers_capture_format() {
        let accepted = [PixelFormat::Rgb, PixelFormat::Yuyv];
        assert_eq!(
            encoder_input(&accepted, PixelFormat::Yuyv),
            Some(PixelFormat::Yuyv)
        );
        assert_eq!(
            encoder_input(&accepted, PixelFormat::Nv12),
            Some(PixelFormat::Rgb)
        );
        assert_eq!(encoder_input(&accepted, PixelFormat::Raw), None);
    }
}
