// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Capture Library
//!
//! Captures camera frames into a fixed pool of hardware-backed buffers and
//! encodes them to JPEG, handing each compressed frame to the caller.
//!
//! ## Features
//!
//! - **Buffer Pool**: Fixed set of DMA or heap buffers with generation-checked
//!   handles. Ownership moves between stages, so a buffer can never be
//!   returned twice or used after it was returned.
//! - **Capture**: V4L2 cameras through the videostream library, with skip
//!   mode so an exhausted pool never stalls the sensor.
//! - **Format Conversion**: BT.601 software conversion from YUYV and NV12 to
//!   RGB when the encoder cannot take the camera format directly.
//! - **JPEG Encoding**: One-in-flight encoder driver with timeouts, fault
//!   recovery and a turbojpeg session with SIMD.
//! - **Raw Frames**: Optional delivery of converted RGB/RGBA frames without
//!   encoding.
//! - **Profiling**: Per-stage latency and FPS counters, Tracy frame marks.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_capture::{Backend, Pipeline, PipelineConfig, PixelFormat};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig {
//!     format: PixelFormat::Raw,
//!     width: 640,
//!     height: 480,
//!     ..Default::default()
//! };
//! let pipeline = Pipeline::initialize(config, Backend::synthetic())?;
//! pipeline.start()?;
//! let image = pipeline.capture_one(Duration::from_secs(1))?;
//! println!("frame {} is {} bytes", image.sequence, image.bytes.len());
//! pipeline.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel 5.10+ with V4L2 and DMA heap support for the hardware
//!   backends. The synthetic backend runs anywhere.
//!
//! ## Safety
//!
//! `unsafe` is limited to mapping dmabuf file descriptors in [`dma`].

pub mod buffer;
pub mod capture;
pub mod convert;
pub mod dma;
pub mod encoder;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod profiler;
pub mod synthetic;
pub mod turbo;
pub mod v4l2;

pub use buffer::{BufferAllocator, BufferPool, HeapAllocator};
pub use dma::{DmaHeap, DmaHeapAllocator};
pub use error::{Error, Result};
pub use format::{FrameLayout, PixelFormat};
pub use pipeline::{
    Backend, EncodedImage, ImageKind, Pipeline, PipelineConfig, PipelineState, StreamWorker,
};
pub use profiler::Counters;
pub use synthetic::{SyntheticCamera, SyntheticEncoder};
pub use turbo::TurboJpegSession;
pub use v4l2::{Mirror, V4l2Camera};
