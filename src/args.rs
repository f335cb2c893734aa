// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_capture::{DmaHeap, ImageKind, Mirror, PipelineConfig, PixelFormat};
use std::path::PathBuf;

/// Camera image mirroring options.
///
/// Determines how the camera image should be flipped before processing.
/// Useful for correcting camera orientation.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum MirrorSetting {
    /// No mirroring
    None,
    /// Flip horizontally (left-right)
    Horizontal,
    /// Flip vertically (top-bottom)
    Vertical,
    /// Flip both horizontally and vertically (180-degree rotation)
    Both,
}

impl From<MirrorSetting> for Mirror {
    fn from(setting: MirrorSetting) -> Self {
        match setting {
            MirrorSetting::None => Mirror::None,
            MirrorSetting::Horizontal => Mirror::Horizontal,
            MirrorSetting::Vertical => Mirror::Vertical,
            MirrorSetting::Both => Mirror::Both,
        }
    }
}

/// Memory the buffer pool is allocated from.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum HeapSetting {
    /// Contiguous DMA memory (/dev/dma_heap/linux,cma)
    Cma,
    /// Scatter-gather DMA memory (/dev/dma_heap/system)
    System,
    /// Ordinary process memory
    Heap,
}

impl HeapSetting {
    pub fn dma_heap(self) -> Option<DmaHeap> {
        match self {
            HeapSetting::Cma => Some(DmaHeap::Cma),
            HeapSetting::System => Some(DmaHeap::System),
            HeapSetting::Heap => None,
        }
    }
}

/// Command-line arguments for the EdgeFirst capture tool.
///
/// Captures frames from one or more cameras, encodes them to JPEG and writes
/// them to `<output-dir>/<camera-name>/<frame-number>.jpg`. With `--raw` the
/// converted frames are written instead, named after their pixel format
/// (`<frame-number>.rgba`). Arguments can be specified via command line or
/// environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// capture --camera /dev/video0 --frames 30 --quality 90
///
/// # Two cameras, raw RGBA frames
/// capture --camera /dev/video0,/dev/video2 --raw rgba
///
/// # Via environment variables
/// export CAMERA=/dev/video0
/// export FRAMES=30
/// capture
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Camera capture device paths, comma separated (e.g., /dev/video0)
    #[arg(
        short,
        long,
        env = "CAMERA",
        default_value = "/dev/video3",
        value_delimiter = ','
    )]
    pub camera: Vec<String>,

    /// Use the built-in test pattern camera instead of a V4L2 device
    #[arg(long, env = "SYNTHETIC")]
    pub synthetic: bool,

    /// Camera capture resolution in pixels (width height)
    #[arg(
        long,
        env = "CAMERA_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub camera_size: Vec<u32>,

    /// Camera pixel format (raw, rgb, rgba, rgbx, yuyv, nv12)
    #[arg(long, env = "CAMERA_FORMAT", default_value = "yuyv")]
    pub format: PixelFormat,

    /// Camera image mirroring setting
    #[arg(long, env = "MIRROR", default_value = "none", value_enum)]
    pub mirror: MirrorSetting,

    /// JPEG quality (1-100)
    #[arg(short, long, env = "JPEG_QUALITY", default_value = "80")]
    pub quality: u8,

    /// Buffers in the capture pool, raised to the camera minimum if lower
    #[arg(long, env = "BUFFER_COUNT", default_value = "4")]
    pub buffer_count: usize,

    /// Memory the capture pool is allocated from [default: cma, or heap with
    /// --synthetic]
    #[arg(long, env = "HEAP", value_enum)]
    pub heap: Option<HeapSetting>,

    /// Longest wait for a camera frame in milliseconds
    #[arg(long, env = "FRAME_TIMEOUT", default_value = "1000")]
    pub frame_timeout: u64,

    /// Longest wait for an encode in milliseconds
    #[arg(long, env = "ENCODE_TIMEOUT", default_value = "1000")]
    pub encode_timeout: u64,

    /// Longest wait for an encoder reset in milliseconds
    #[arg(long, env = "RESET_TIMEOUT", default_value = "2000")]
    pub reset_timeout: u64,

    /// Consecutive encoder timeouts or faults before giving up
    #[arg(long, env = "MAX_FAILURES", default_value = "5")]
    pub max_failures: u32,

    /// Write converted frames in this pixel format instead of JPEG
    #[arg(long, env = "RAW_FORMAT")]
    pub raw: Option<PixelFormat>,

    /// Pipeline settings as JSON; replaces the pipeline flags above
    #[arg(long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Frames to write per camera, 0 to run until killed
    #[arg(short, long, env = "FRAMES", default_value = "10")]
    pub frames: u64,

    /// Directory receiving one sub-directory of frames per camera
    #[arg(short, long, env = "OUTPUT_DIR", default_value = "captures")]
    pub output_dir: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    /// Pool memory, falling back to process memory for the synthetic camera
    /// which needs no DMA heap.
    pub fn heap(&self) -> HeapSetting {
        self.heap.unwrap_or(if self.synthetic {
            HeapSetting::Heap
        } else {
            HeapSetting::Cma
        })
    }
}

impl From<Args> for PipelineConfig {
    fn from(args: Args) -> Self {
        PipelineConfig {
            format: args.format,
            width: args.camera_size[0],
            height: args.camera_size[1],
            quality: args.quality,
            buffer_count: args.buffer_count,
            frame_timeout_ms: args.frame_timeout,
            encode_timeout_ms: args.encode_timeout,
            reset_timeout_ms: args.reset_timeout,
            max_consecutive_failures: args.max_failures,
            output: args.raw.map_or(ImageKind::Jpeg, ImageKind::Pixels),
        }
    }
}
