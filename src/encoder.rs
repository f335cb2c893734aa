// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! One-shot JPEG encoder driver.
//!
//! The [`EncoderSession`] is moved onto a dedicated engine thread that plays
//! the role of the hardware: it takes one job at a time and signals
//! completion over a channel. [`EncoderDriver`] sits on the pipeline side and
//! enforces the session contract:
//!
//! ```text
//!   IDLE --submit--> SUBMITTED --wait/poll--> IDLE
//!                        |
//!                        +--hardware fault--> FAILED --reset--> IDLE
//! ```
//!
//! Only one request may be in flight. Buffers travel with the job and come
//! back with the completion, so the engine never shares memory with the
//! pipeline. Buffers stranded by a fault or a timeout are returned to the
//! pool by [`EncoderDriver::reset`].
//!
//! A reset is queued behind the job the engine is working on. When that job
//! outlasts the reset timeout the reset stays pending: the driver reports
//! [`EncoderError::ResetTimeout`] and a later `reset` call waits for the same
//! acknowledgement instead of queueing another one.
//!
//! A panicking session is caught on the engine thread and reported as a
//! hardware fault, so its buffers still come back with the completion.

use crate::{
    buffer::{Buffer, BufferPool, FillState},
    error::{EncoderError, InitError},
    format::{FrameLayout, PixelFormat},
};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reported by an [`EncoderSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// This job could not be encoded; the session is still healthy.
    #[error("{0}")]
    Rejected(String),

    /// The hardware faulted and must be reinitialized.
    #[error("{0}")]
    Fault(String),
}

/// Hardware JPEG encoder session provided by the platform.
///
/// A session is an owned object: it is created by the caller, moved into the
/// driver and closed exactly once when the driver shuts down.
pub trait EncoderSession: Send {
    fn name(&self) -> &str;

    /// Pixel formats accepted as input, preferred format first.
    fn formats(&self) -> &[PixelFormat];

    /// Encodes one image into `output` and returns the bitstream length.
    ///
    /// Blocks until the hardware signals completion.
    fn encode(
        &mut self,
        input: &[u8],
        layout: &FrameLayout,
        quality: u8,
        output: &mut [u8],
    ) -> Result<usize, SessionError>;

    /// Returns the session to a clean state, abandoning any partial work.
    fn reinitialize(&mut self) -> Result<(), SessionError>;

    fn close(&mut self) {}
}

/// An image ready to be encoded.
#[derive(Debug)]
pub struct EncodeRequest {
    pub input: Buffer,
    /// JPEG quality, 1 to 100
    pub quality: u8,
    pub sequence: u64,
}

/// A completed encode.
///
/// Holds both buffers of the job; the consumer releases them to the pool.
#[derive(Debug)]
pub struct EncodeResult {
    pub sequence: u64,
    /// Compressed bitstream in an ENCODED buffer
    pub output: Buffer,
    /// The source image
    pub input: Buffer,
    /// Time spent inside the session
    pub encode_time: Duration,
}

impl EncodeResult {
    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        self.output.data()
    }
}

/// Observable driver state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Submitted { sequence: u64 },
    Failed,
}

struct Job {
    sequence: u64,
    quality: u8,
    input: Buffer,
    output: Buffer,
}

struct Completion {
    sequence: u64,
    input: Buffer,
    output: Buffer,
    outcome: Result<usize, SessionError>,
    elapsed: Duration,
}

enum Command {
    Encode(Job),
    Reinitialize(u64),
    Close,
}

/// Drives an [`EncoderSession`] with at most one job in flight.
///
/// The driver is `Send` but not `Sync`: exactly one pipeline worker owns it.
pub struct EncoderDriver {
    name: String,
    formats: Vec<PixelFormat>,
    pool: Arc<BufferPool>,
    commands: Sender<Command>,
    completions: Receiver<Completion>,
    acks: Receiver<(u64, Result<(), SessionError>)>,
    engine: Option<JoinHandle<()>>,
    state: DriverState,
    last_sequence: Option<u64>,
    reset_epoch: u64,
    pending_reset: Option<u64>,
    reset_timeout: Duration,
    stranded: Vec<Buffer>,
}

impl EncoderDriver {
    /// Takes ownership of `session` and starts its engine thread.
    pub fn new(
        session: Box<dyn EncoderSession>,
        pool: Arc<BufferPool>,
        reset_timeout: Duration,
    ) -> Result<Self, InitError> {
        let name = session.name().to_string();
        let formats = session.formats().to_vec();
        if formats.is_empty() {
            return Err(InitError::Encoder(format!("{name} accepts no input format")));
        }

        let (commands, command_rx) = kanal::unbounded();
        let (completion_tx, completions) = kanal::unbounded();
        let (ack_tx, acks) = kanal::unbounded();
        let engine = thread::Builder::new()
            .name("jpeg-encoder".to_string())
            .spawn(move || run_engine(session, command_rx, completion_tx, ack_tx))
            .map_err(|e| InitError::Encoder(e.to_string()))?;
        debug!(session = %name, "encoder engine started");

        Ok(Self {
            name,
            formats,
            pool,
            commands,
            completions,
            acks,
            engine: Some(engine),
            state: DriverState::Idle,
            last_sequence: None,
            reset_epoch: 0,
            pending_reset: None,
            reset_timeout,
            stranded: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Accepted input formats, preferred first.
    pub fn formats(&self) -> &[PixelFormat] {
        &self.formats
    }

    pub fn accepts(&self, format: PixelFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn preferred_format(&self) -> PixelFormat {
        self.formats[0]
    }

    /// True while a reset has been queued but not yet acknowledged.
    pub fn reset_pending(&self) -> bool {
        self.pending_reset.is_some()
    }

    fn engine_running(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| !engine.is_finished())
    }

    /// Submits a request to the encoder.
    ///
    /// The driver owns the request from here on: if it is refused, its input
    /// buffer is returned to the pool before the error is reported.
    pub fn submit(&mut self, request: EncodeRequest) -> Result<(), EncoderError> {
        if !self.engine_running() {
            self.pool.recycle(request.input);
            return Err(self.engine_lost());
        }
        if let Err(e) = self.check_submit(&request) {
            self.pool.recycle(request.input);
            return Err(e);
        }

        let output = match self.pool.acquire() {
            Ok(buf) => buf,
            Err(e) => {
                self.pool.recycle(request.input);
                return Err(EncoderError::Pool(e));
            }
        };

        let EncodeRequest {
            mut input,
            quality,
            sequence,
        } = request;
        let mut output = output;
        input.set_state(FillState::InFlight);
        output.set_state(FillState::InFlight);

        let job = Job {
            sequence,
            quality,
            input,
            output,
        };
        // The engine only exits on close, which takes `engine`, so a live
        // engine always receives the job and returns its buffers.
        if self.commands.send(Command::Encode(job)).is_err() {
            return Err(self.engine_lost());
        }

        self.last_sequence = Some(sequence);
        self.state = DriverState::Submitted { sequence };
        Ok(())
    }

    fn check_submit(&self, request: &EncodeRequest) -> Result<(), EncoderError> {
        match self.state {
            DriverState::Failed => return Err(EncoderError::Failed),
            DriverState::Submitted { sequence } => {
                return Err(EncoderError::Busy {
                    in_flight: sequence,
                })
            }
            DriverState::Idle => {}
        }
        if !(1..=100).contains(&request.quality) {
            return Err(EncoderError::InvalidArgument(format!(
                "quality {} outside 1-100",
                request.quality
            )));
        }
        if let Some(last) = self.last_sequence {
            if request.sequence <= last {
                return Err(EncoderError::InvalidArgument(format!(
                    "sequence {} does not follow {}",
                    request.sequence, last
                )));
            }
        }
        match request.input.layout() {
            Some(layout) if self.accepts(layout.format) => Ok(()),
            Some(layout) => Err(EncoderError::InvalidArgument(format!(
                "{} does not accept {}",
                self.name, layout.format
            ))),
            None => Err(EncoderError::InvalidArgument(
                "input buffer holds no image".to_string(),
            )),
        }
    }

    fn expect_in_flight(&self) -> Result<u64, EncoderError> {
        match self.state {
            DriverState::Submitted { sequence } => Ok(sequence),
            DriverState::Failed => Err(EncoderError::Failed),
            DriverState::Idle => Err(EncoderError::Idle),
        }
    }

    /// Blocks up to `timeout` for the in-flight encode.
    ///
    /// A timeout leaves the request in flight; wait again or `reset`.
    pub fn wait(&mut self, timeout: Duration) -> Result<EncodeResult, EncoderError> {
        let expected = self.expect_in_flight()?;
        match self.completions.recv_timeout(timeout) {
            Ok(completion) => self.complete(expected, completion),
            Err(ReceiveErrorTimeout::Timeout) => Err(EncoderError::Timeout(timeout)),
            Err(_) => Err(self.engine_lost()),
        }
    }

    /// Non-blocking variant of [`EncoderDriver::wait`].
    pub fn poll(&mut self) -> Result<Option<EncodeResult>, EncoderError> {
        let expected = self.expect_in_flight()?;
        match self.completions.try_recv() {
            Ok(Some(completion)) => self.complete(expected, completion).map(Some),
            Ok(None) => Ok(None),
            Err(_) => Err(self.engine_lost()),
        }
    }

    fn engine_lost(&mut self) -> EncoderError {
        self.state = DriverState::Failed;
        EncoderError::Hardware(format!("{} engine stopped", self.name))
    }

    fn complete(
        &mut self,
        expected: u64,
        completion: Completion,
    ) -> Result<EncodeResult, EncoderError> {
        let Completion {
            sequence,
            mut input,
            mut output,
            outcome,
            elapsed,
        } = completion;

        if sequence != expected {
            warn!(expected, actual = sequence, "encoder completion out of sequence");
            self.stranded.push(input);
            self.stranded.push(output);
            self.state = DriverState::Failed;
            return Err(EncoderError::SequenceMismatch {
                expected,
                actual: sequence,
            });
        }

        match outcome {
            Ok(len) if len <= output.capacity() => {
                output.set_len(len);
                output.set_state(FillState::Encoded);
                input.set_state(FillState::Full);
                self.state = DriverState::Idle;
                Ok(EncodeResult {
                    sequence,
                    output,
                    input,
                    encode_time: elapsed,
                })
            }
            Ok(len) => {
                self.pool.recycle(input);
                self.pool.recycle(output);
                self.state = DriverState::Idle;
                Err(EncoderError::Rejected {
                    sequence,
                    reason: format!("session reported {len} bytes, larger than the buffer"),
                })
            }
            Err(SessionError::Rejected(reason)) => {
                self.pool.recycle(input);
                self.pool.recycle(output);
                self.state = DriverState::Idle;
                Err(EncoderError::Rejected { sequence, reason })
            }
            Err(SessionError::Fault(reason)) => {
                warn!(session = %self.name, sequence, "encoder fault: {reason}");
                self.stranded.push(input);
                self.stranded.push(output);
                self.state = DriverState::Failed;
                Err(EncoderError::Hardware(reason))
            }
        }
    }

    /// Reinitializes the session and returns the driver to IDLE.
    ///
    /// Every buffer still owned by the encoder, whether in flight, stranded
    /// by a fault, or part of a completion nobody waited for, is released to
    /// the pool.
    ///
    /// Returns [`EncoderError::ResetTimeout`] if the session does not
    /// acknowledge within the reset timeout. The driver then stays FAILED
    /// with the reset pending, and the next call resumes waiting for it. A
    /// session that refuses to reinitialize yields
    /// [`EncoderError::Hardware`].
    pub fn reset(&mut self) -> Result<(), EncoderError> {
        let epoch = match self.pending_reset {
            Some(epoch) => epoch,
            None => {
                self.reset_epoch += 1;
                if self
                    .commands
                    .send(Command::Reinitialize(self.reset_epoch))
                    .is_err()
                {
                    self.reclaim();
                    return Err(self.engine_lost());
                }
                self.pending_reset = Some(self.reset_epoch);
                self.reset_epoch
            }
        };

        let deadline = Instant::now() + self.reset_timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.acks.recv_timeout(remaining) {
                Ok((ack, outcome)) if ack == epoch => break outcome,
                Ok(_) => continue,
                Err(ReceiveErrorTimeout::Timeout) => {
                    warn!(session = %self.name, epoch, "reset still pending");
                    self.state = DriverState::Failed;
                    return Err(EncoderError::ResetTimeout(self.reset_timeout));
                }
                Err(_) => {
                    self.pending_reset = None;
                    self.reclaim();
                    return Err(self.engine_lost());
                }
            }
        };
        self.pending_reset = None;

        // The engine handles commands in order, so every completion for work
        // submitted before the reset is already queued.
        self.reclaim();

        match outcome {
            Ok(()) => {
                info!(session = %self.name, "encoder reset");
                self.state = DriverState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = DriverState::Failed;
                Err(EncoderError::Hardware(e.to_string()))
            }
        }
    }

    fn reclaim(&mut self) {
        while let Ok(Some(completion)) = self.completions.try_recv() {
            debug!(sequence = completion.sequence, "discarding unclaimed completion");
            self.pool.recycle(completion.input);
            self.pool.recycle(completion.output);
        }
        for buf in self.stranded.drain(..) {
            self.pool.recycle(buf);
        }
    }

    /// Stops the engine and closes the session. Idempotent.
    ///
    /// Waits up to the reset timeout for a busy engine; after that the
    /// engine thread is detached and any buffer it holds stays IN_USE.
    pub fn close(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let _ = self.commands.send(Command::Close);

        let deadline = Instant::now() + self.reset_timeout;
        while !engine.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if engine.is_finished() {
            if engine.join().is_err() {
                warn!(session = %self.name, "encoder engine panicked");
            }
        } else {
            warn!(session = %self.name, "encoder engine unresponsive, detaching");
        }

        self.reclaim();
        self.pending_reset = None;
        self.state = DriverState::Idle;
        debug!(session = %self.name, "encoder closed");
    }
}

impl Drop for EncoderDriver {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_engine(
    mut session: Box<dyn EncoderSession>,
    commands: Receiver<Command>,
    completions: Sender<Completion>,
    acks: Sender<(u64, Result<(), SessionError>)>,
) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Encode(mut job) => {
                let start = Instant::now();
                let outcome = match job.input.layout() {
                    Some(layout) => panic::catch_unwind(AssertUnwindSafe(|| {
                        session.encode(
                            job.input.data(),
                            &layout,
                            job.quality,
                            job.output.memory_mut(),
                        )
                    }))
                    .unwrap_or_else(|payload| Err(panicked("encode", payload))),
                    None => Err(SessionError::Rejected("input holds no image".to_string())),
                };
                let completion = Completion {
                    sequence: job.sequence,
                    input: job.input,
                    output: job.output,
                    outcome,
                    elapsed: start.elapsed(),
                };
                if completions.send(completion).is_err() {
                    break;
                }
            }
            Command::Reinitialize(epoch) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.reinitialize()))
                    .unwrap_or_else(|payload| Err(panicked("reinitialize", payload)));
                if acks.send((epoch, outcome)).is_err() {
                    break;
                }
            }
            Command::Close => break,
        }
    }

    // Hand back any job queued behind the close.
    while let Ok(Some(command)) = commands.try_recv() {
        if let Command::Encode(job) = command {
            let _ = completions.send(Completion {
                sequence: job.sequence,
                input: job.input,
                output: job.output,
                outcome: Err(SessionError::Fault("encoder closed".to_string())),
                elapsed: Duration::ZERO,
            });
        }
    }
    session.close();
    debug!(session = session.name(), "encoder engine exited");
}

fn panicked(op: &str, payload: Box<dyn Any + Send>) -> SessionError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    SessionError::Fault(format!("session panicked during {op}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::HeapAllocator, synthetic::SyntheticEncoder};

    const LAYOUT: FrameLayout = FrameLayout {
        format: PixelFormat::Raw,
        width: 8,
        height: 8,
        stride: 8,
    };

    fn setup(encoder: SyntheticEncoder) -> (EncoderDriver, Arc<BufferPool>) {
        setup_session(Box::new(encoder), Duration::from_secs(2))
    }

    fn setup_session(
        session: Box<dyn EncoderSession>,
        reset_timeout: Duration,
    ) -> (EncoderDriver, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new(&HeapAllocator, 4, 64).unwrap());
        let driver = EncoderDriver::new(session, pool.clone(), reset_timeout).unwrap();
        (driver, pool)
    }

    /// Session that panics on every encode.
    struct PanickingSession;

    impl EncoderSession for PanickingSession {
        fn name(&self) -> &str {
            "panicking"
        }

        fn formats(&self) -> &[PixelFormat] {
            &[PixelFormat::Raw]
        }

        fn encode(
            &mut self,
            _input: &[u8],
            _layout: &FrameLayout,
            _quality: u8,
            _output: &mut [u8],
        ) -> Result<usize, SessionError> {
            panic!("encoder register read failed");
        }

        fn reinitialize(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn request(pool: &BufferPool, sequence: u64) -> EncodeRequest {
        let mut input = pool.acquire().unwrap();
        input.memory_mut().fill(0x5a);
        input.set_len(LAYOUT.size());
        input.set_layout(LAYOUT);
        input.set_state(FillState::Full);
        EncodeRequest {
            input,
            quality: 80,
            sequence,
        }
    }

    #[test]
    fn submit_wait_release() {
        let (mut driver, pool) = setup(SyntheticEncoder::new());
        driver.submit(request(&pool, 1)).unwrap();
        assert_eq!(driver.state(), DriverState::Submitted { sequence: 1 });

        let result = driver.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(result.sequence, 1);
        assert_eq!(result.len(), 64);
        assert_eq!(result.output.state(), FillState::Encoded);
        assert_eq!(pool.in_use_count(), 2);

        pool.release(result.input).unwrap();
        pool.release(result.output).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn second_submit_is_busy() {
        let encoder = SyntheticEncoder::new();
        encoder.control().stall_next(Duration::from_millis(100));
        let (mut driver, pool) = setup(encoder);

        driver.submit(request(&pool, 1)).unwrap();
        let err = driver.submit(request(&pool, 2)).unwrap_err();
        assert!(matches!(err, EncoderError::Busy { in_flight: 1 }));
        // The refused request's buffer went straight back.
        assert_eq!(pool.in_use_count(), 2);

        let result = driver.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(result.sequence, 1);
        pool.release(result.input).unwrap();
        pool.release(result.output).unwrap();
    }

    #[test]
    fn quality_out_of_range_fails_fast() {
        let (mut driver, pool) = setup(SyntheticEncoder::new());
        for quality in [0, 101] {
            let mut req = request(&pool, 1);
            req.quality = quality;
            assert!(matches!(
                driver.submit(req),
                Err(EncoderError::InvalidArgument(_))
            ));
        }
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn sequence_must_increase() {
        let (mut driver, pool) = setup(SyntheticEncoder::new());
        driver.submit(request(&pool, 5)).unwrap();
        let result = driver.wait(Duration::from_secs(1)).unwrap();
        pool.release(result.input).unwrap();
        pool.release(result.output).unwrap();

        assert!(matches!(
            driver.submit(request(&pool, 5)),
            Err(EncoderError::InvalidArgument(_))
        ));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn wait_without_submit_is_idle() {
        let (mut driver, _pool) = setup(SyntheticEncoder::new());
        assert!(matches!(
            driver.wait(Duration::from_millis(1)),
            Err(EncoderError::Idle)
        ));
        assert!(matches!(driver.poll(), Err(EncoderError::Idle)));
    }

    #[test]
    fn poll_until_complete() {
        let encoder = SyntheticEncoder::new();
        encoder.control().stall_next(Duration::from_millis(20));
        let (mut driver, pool) = setup(encoder);

        driver.submit(request(&pool, 1)).unwrap();
        assert!(driver.poll().unwrap().is_none());
        let result = loop {
            if let Some(result) = driver.poll().unwrap() {
                break result;
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(result.sequence, 1);
        pool.release(result.input).unwrap();
        pool.release(result.output).unwrap();
    }

    #[test]
    fn rejected_job_returns_to_idle() {
        let encoder = SyntheticEncoder::new();
        encoder.control().fail_every(1);
        let (mut driver, pool) = setup(encoder);

        driver.submit(request(&pool, 1)).unwrap();
        assert!(matches!(
            driver.wait(Duration::from_secs(1)),
            Err(EncoderError::Rejected { sequence: 1, .. })
        ));
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn fault_blocks_until_reset() {
        let encoder = SyntheticEncoder::new();
        encoder.control().fault_next();
        let (mut driver, pool) = setup(encoder);

        driver.submit(request(&pool, 1)).unwrap();
        assert!(matches!(
            driver.wait(Duration::from_secs(1)),
            Err(EncoderError::Hardware(_))
        ));
        assert_eq!(driver.state(), DriverState::Failed);
        // Input and output stay with the failed encoder.
        assert_eq!(pool.in_use_count(), 2);

        assert!(matches!(
            driver.submit(request(&pool, 2)),
            Err(EncoderError::Failed)
        ));
        assert!(matches!(
            driver.wait(Duration::from_millis(1)),
            Err(EncoderError::Failed)
        ));
        assert!(matches!(driver.poll(), Err(EncoderError::Failed)));

        driver.reset().unwrap();
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);

        driver.submit(request(&pool, 3)).unwrap();
        let result = driver.wait(Duration::from_secs(1)).unwrap();
        pool.release(result.input).unwrap();
        pool.release(result.output).unwrap();
    }

    #[test]
    fn timeout_then_reset_reclaims_in_flight() {
        let encoder = SyntheticEncoder::new();
        encoder.control().stall_next(Duration::from_millis(200));
        let (mut driver, pool) = setup(encoder);

        driver.submit(request(&pool, 1)).unwrap();
        assert!(matches!(
            driver.wait(Duration::from_millis(10)),
            Err(EncoderError::Timeout(_))
        ));
        assert_eq!(driver.state(), DriverState::Submitted { sequence: 1 });

        driver.reset().unwrap();
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn failed_reset_keeps_driver_failed() {
        let encoder = SyntheticEncoder::new();
        let control = encoder.control();
        control.fault_next();
        control.fail_resets(true);
        let (mut driver, pool) = setup(encoder);

        driver.submit(request(&pool, 1)).unwrap();
        assert!(driver.wait(Duration::from_secs(1)).is_err());
        assert!(matches!(driver.reset(), Err(EncoderError::Hardware(_))));
        assert_eq!(driver.state(), DriverState::Failed);
        // Buffers are reclaimed even when the session stays broken.
        assert_eq!(pool.free_count(), 4);

        control.fail_resets(false);
        driver.reset().unwrap();
        assert_eq!(driver.state(), DriverState::Idle);
    }

    #[test]
    fn reset_outlasting_timeout_stays_pending() {
        let encoder = SyntheticEncoder::new();
        encoder.control().stall_next(Duration::from_millis(300));
        let (mut driver, pool) = setup_session(Box::new(encoder), Duration::from_millis(50));

        driver.submit(request(&pool, 1)).unwrap();
        assert!(matches!(
            driver.wait(Duration::from_millis(10)),
            Err(EncoderError::Timeout(_))
        ));
        assert!(matches!(
            driver.reset(),
            Err(EncoderError::ResetTimeout(_))
        ));
        assert!(driver.reset_pending());
        assert_eq!(driver.state(), DriverState::Failed);
        assert!(matches!(
            driver.submit(request(&pool, 2)),
            Err(EncoderError::Failed)
        ));

        // Retries wait on the same queued reset until the stalled job ends.
        let start = Instant::now();
        while let Err(e) = driver.reset() {
            assert!(matches!(e, EncoderError::ResetTimeout(_)), "{e}");
            assert!(start.elapsed() < Duration::from_secs(2));
        }
        assert!(!driver.reset_pending());
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);

        driver.submit(request(&pool, 3)).unwrap();
        let result = driver.wait(Duration::from_secs(1)).unwrap();
        pool.release(result.input).unwrap();
        pool.release(result.output).unwrap();
    }

    #[test]
    fn mismatched_completion_fails_driver() {
        let encoder = SyntheticEncoder::new();
        encoder.control().stall_next(Duration::from_millis(50));
        let (mut driver, pool) = setup(encoder);
        driver.submit(request(&pool, 1)).unwrap();

        let completion = Completion {
            sequence: 9,
            input: pool.acquire().unwrap(),
            output: pool.acquire().unwrap(),
            outcome: Ok(8),
            elapsed: Duration::ZERO,
        };
        assert!(matches!(
            driver.complete(1, completion),
            Err(EncoderError::SequenceMismatch {
                expected: 1,
                actual: 9
            })
        ));
        assert_eq!(driver.state(), DriverState::Failed);
        assert_eq!(pool.free_count(), 0);

        driver.reset().unwrap();
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn submit_after_close_returns_input() {
        let (mut driver, pool) = setup(SyntheticEncoder::new());
        driver.close();

        assert!(matches!(
            driver.submit(request(&pool, 1)),
            Err(EncoderError::Hardware(_))
        ));
        assert_eq!(driver.state(), DriverState::Failed);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn panicking_session_returns_buffers() {
        let (mut driver, pool) = setup_session(Box::new(PanickingSession), Duration::from_secs(2));

        driver.submit(request(&pool, 1)).unwrap();
        let err = driver.wait(Duration::from_secs(1)).unwrap_err();
        assert!(
            matches!(&err, EncoderError::Hardware(reason) if reason.contains("panicked")),
            "{err}"
        );
        assert_eq!(driver.state(), DriverState::Failed);

        driver.reset().unwrap();
        assert_eq!(driver.state(), DriverState::Idle);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn close_is_idempotent() {
        let encoder = SyntheticEncoder::new();
        let control = encoder.control();
        let (mut driver, _pool) = setup(encoder);
        driver.close();
        driver.close();
        assert!(control.closed());
    }
}
