// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error taxonomy for the capture pipeline.
//!
//! Each stage has its own error type so callers can tell per-frame problems
//! (absorbed into the drop counters) from stream-fatal ones. The crate-level
//! [`enum@Error`] aggregates them and classifies fatality with
//! [`Error::is_fatal`].

use crate::{buffer::BufferId, format::PixelFormat, pipeline::PipelineState};
use std::{io, time::Duration};
use thiserror::Error;

/// Errors returned by [`crate::buffer::BufferPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every buffer is currently in use.
    #[error("buffer pool exhausted ({capacity} buffers in use)")]
    Exhausted { capacity: usize },

    /// The buffer belongs to another pool, is stale, or was already released.
    #[error("invalid buffer handle {0}")]
    InvalidHandle(BufferId),
}

/// Errors raised while configuring or initializing a pipeline.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(#[source] io::Error),

    #[error("encoder session unavailable: {0}")]
    Encoder(String),
}

/// Errors raised by [`crate::capture::CaptureSource`].
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No frame arrived within the timeout. Recoverable.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    /// Sensor or driver fault. The stream is unusable until restarted.
    #[error("capture stream fault: {0}")]
    Stream(String),

    /// The stream could not be started.
    #[error("failed to start capture stream: {0}")]
    Start(String),

    /// `next_frame` was called without an active stream.
    #[error("capture stream is not running")]
    NotStreaming,

    /// No pool buffer was free; the sensor frame was skipped.
    #[error("frame skipped: {0}")]
    Exhausted(#[source] PoolError),
}

/// Per-frame errors raised by [`crate::convert::FormatStage`].
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("no conversion from {from} to {to}")]
    Unsupported { from: PixelFormat, to: PixelFormat },

    #[error("source holds {actual} bytes but {expected} are required")]
    ShortInput { expected: usize, actual: usize },

    #[error("no output buffer: {0}")]
    Pool(#[source] PoolError),
}

/// Errors raised by [`crate::encoder::EncoderDriver`].
#[derive(Debug, Error)]
pub enum EncoderError {
    /// A request is already in flight.
    #[error("encoder busy with sequence {in_flight}")]
    Busy { in_flight: u64 },

    /// Argument validation failed before anything was submitted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session did not complete within the timeout.
    #[error("encode did not complete within {0:?}")]
    Timeout(Duration),

    /// The session rejected a single job; the driver is usable again.
    #[error("encode of sequence {sequence} rejected: {reason}")]
    Rejected { sequence: u64, reason: String },

    /// The hardware faulted; the driver stays failed until reset.
    #[error("encoder hardware fault: {0}")]
    Hardware(String),

    /// The driver previously faulted and has not been reset.
    #[error("encoder failed and requires reset")]
    Failed,

    /// The session is still busy and has not acknowledged the reset yet.
    /// The reset stays queued; calling `reset` again keeps waiting for it.
    #[error("encoder did not reinitialize within {0:?}")]
    ResetTimeout(Duration),

    /// A completion arrived for a sequence the driver never issued.
    #[error("completion for sequence {actual} but {expected} is in flight")]
    SequenceMismatch { expected: u64, actual: u64 },

    /// No output buffer could be acquired for the request.
    #[error("no output buffer: {0}")]
    Pool(#[source] PoolError),

    /// `wait` or `poll` called with nothing in flight.
    #[error("no encode in flight")]
    Idle,
}

/// Crate level error returned by [`crate::pipeline::Pipeline`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// The operation is not allowed in the current pipeline state.
    #[error("cannot {op} while pipeline is {state:?}")]
    InvalidState {
        op: &'static str,
        state: PipelineState,
    },

    /// `capture_one` gave up without delivering a frame.
    #[error("no frame delivered within {0:?}")]
    Timeout(Duration),

    /// Consecutive encoder failures reached the configured limit.
    #[error("{failures} consecutive encoder failures, last: {last}")]
    EncoderStalled {
        failures: u32,
        #[source]
        last: EncoderError,
    },

    #[error("failed to spawn stream worker: {0}")]
    Spawn(#[source] io::Error),
}

impl Error {
    /// Returns true when the error ends the stream and requires `stop` and
    /// `start` before the pipeline is usable again.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Init(_) | Error::EncoderStalled { .. } => true,
            Error::Capture(CaptureError::Stream(_) | CaptureError::Start(_)) => true,
            Error::Encoder(
                EncoderError::Hardware(_)
                | EncoderError::Failed
                | EncoderError::SequenceMismatch { .. },
            ) => true,
            // Handle misuse is a programming error and always surfaces.
            Error::Pool(PoolError::InvalidHandle(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_errors() {
        assert!(Error::from(CaptureError::Stream("unplugged".into())).is_fatal());
        assert!(Error::from(EncoderError::Hardware("bus error".into())).is_fatal());
        assert!(Error::from(EncoderError::SequenceMismatch {
            expected: 1,
            actual: 7
        })
        .is_fatal());

        assert!(!Error::from(CaptureError::Timeout(Duration::from_millis(5))).is_fatal());
        assert!(!Error::from(EncoderError::Busy { in_flight: 3 }).is_fatal());
        assert!(!Error::from(ConversionError::ShortInput {
            expected: 10,
            actual: 2
        })
        .is_fatal());
        assert!(!Error::from(PoolError::Exhausted { capacity: 4 }).is_fatal());
        assert!(!Error::from(EncoderError::ResetTimeout(Duration::from_millis(50))).is_fatal());
    }
}
