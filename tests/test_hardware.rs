// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_capture::{
    Backend, BufferPool, DmaHeap, DmaHeapAllocator, Pipeline, PipelineConfig, PipelineState,
    PixelFormat, TurboJpegSession, V4l2Camera,
};
use serial_test::serial;
use std::{error::Error, time::Duration};

const CAMERA: &str = "/dev/video3";

#[test]
#[serial]
#[ignore = "dma heap test is disabled by default (run with --include-ignored to enable)"]
fn test_dma_heap_pool() -> Result<(), Box<dyn Error>> {
    let allocator = DmaHeapAllocator::new(DmaHeap::Cma)?;
    let pool = BufferPool::new(&allocator, 4, 1920 * 1080 * 2)?;
    assert_eq!(pool.free_count(), 4);

    let buffer = pool.acquire()?;
    assert_eq!(buffer.capacity(), 1920 * 1080 * 2);
    assert_eq!(pool.free_count(), 3);
    pool.release(buffer)?;
    assert_eq!(pool.free_count(), 4);
    Ok(())
}

#[test]
#[serial]
#[ignore = "camera test is disabled by default (run with --include-ignored to enable)"]
fn test_camera_to_jpeg() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig {
        format: PixelFormat::Yuyv,
        width: 1920,
        height: 1080,
        ..Default::default()
    };
    let backend = Backend::new(
        DmaHeapAllocator::new(DmaHeap::Cma)?,
        V4l2Camera::new(CAMERA),
        TurboJpegSession::new(),
    );
    let pipeline = Pipeline::initialize(config, backend)?;
    pipeline.start()?;

    for _ in 0..10 {
        let image = pipeline.capture_one(Duration::from_secs(2))?;
        println!(
            "frame {} sequence {} {} bytes",
            image.frame_number,
            image.sequence,
            image.bytes.len()
        );
        assert_eq!(&image.bytes[..2], &[0xff, 0xd8]);
    }

    let counters = pipeline.counters();
    println!(
        "latency avg {:.2} ms max {:.2} ms encode {:.2} ms",
        counters.avg_latency_ms, counters.max_latency_ms, counters.avg_encode_ms
    );

    pipeline.stop()?;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.pool().free_count(), pipeline.pool().capacity());
    Ok(())
}

#[test]
#[serial]
#[ignore = "camera test is disabled by default (run with --include-ignored to enable)"]
fn test_camera_restart() -> Result<(), Box<dyn Error>> {
    let config = PipelineConfig {
        format: PixelFormat::Yuyv,
        width: 1280,
        height: 720,
        ..Default::default()
    };
    let backend = Backend::new(
        DmaHeapAllocator::new(DmaHeap::Cma)?,
        V4l2Camera::new(CAMERA),
        TurboJpegSession::new(),
    );
    let pipeline = Pipeline::initialize(config, backend)?;

    let mut last = None;
    for _ in 0..3 {
        pipeline.start()?;
        let image = pipeline.capture_one(Duration::from_secs(2))?;
        if let Some(last) = last {
            assert!(image.sequence > last);
        }
        last = Some(image.sequence);
        pipeline.stop()?;
    }
    Ok(())
}
