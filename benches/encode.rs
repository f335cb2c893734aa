// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_capture::{encoder::EncoderSession, FrameLayout, PixelFormat, TurboJpegSession};

fn benchmark_jpeg(
    session: &mut TurboJpegSession,
    input: &[u8],
    layout: &FrameLayout,
    output: &mut [u8],
) {
    let _ = session.encode(input, layout, 80, output).unwrap();
}

pub fn benchmark_encode(c: &mut Criterion) {
    let mut session = TurboJpegSession::new();
    for fmt in [PixelFormat::Rgb, PixelFormat::Rgbx, PixelFormat::Raw] {
        let mut group = c.benchmark_group(format!("jpeg/{fmt}"));
        for dim in [
            (320, 240),
            (640, 480),
            (960, 540),
            (1280, 720),
            (1920, 1080),
            (3840, 2160),
        ]
        .iter()
        {
            let layout = FrameLayout::new(fmt, dim.0, dim.1);
            let input: Vec<u8> = (0..layout.size()).map(|i| (i % 251) as u8).collect();
            let mut output = vec![0u8; layout.size() + 4096];
            group.bench_function(format!("{}x{}", dim.0, dim.1), |b| {
                b.iter(|| benchmark_jpeg(&mut session, &input, &layout, &mut output))
            });
        }
    }
}

criterion_group!(benches, benchmark_encode);
criterion_main!(benches);
