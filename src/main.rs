// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_capture::{
    capture::CaptureDevice, Backend, BufferAllocator, DmaHeapAllocator, EncodedImage,
    HeapAllocator, ImageKind, Pipeline, PipelineConfig, StreamWorker, SyntheticCamera,
    TurboJpegSession, V4l2Camera,
};
use std::{
    error::Error,
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

/// One running pipeline and the directory its frames land in.
struct Stream {
    directory: PathBuf,
    pipeline: Arc<Pipeline>,
    worker: StreamWorker,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "loading pipeline config");
            load_config(path)?
        }
        None => PipelineConfig::from(args.clone()),
    };

    let mut streams = Vec::with_capacity(args.camera.len());
    for device in &args.camera {
        streams.push(open_stream(&args, &config, device)?);
    }

    let mut written = 0;
    'capture: while args.frames == 0 || written < args.frames {
        for stream in &streams {
            let Ok(image) = stream.worker.frames().recv() else {
                warn!(
                    directory = %stream.directory.display(),
                    "stream ended after {written} frames"
                );
                break 'capture;
            };
            save(&stream.directory, &image)?;
        }
        written += 1;
    }

    let mut result = Ok(());
    for stream in streams {
        if let Err(e) = stream.worker.stop() {
            error!(directory = %stream.directory.display(), "stream failed: {e}");
            result = Err(e);
        }
        report(&stream.directory, &stream.pipeline);
    }
    result?;
    Ok(())
}

fn open_stream(
    args: &Args,
    config: &PipelineConfig,
    device: &str,
) -> Result<Stream, Box<dyn Error>> {
    let allocator: Box<dyn BufferAllocator> = match args.heap().dma_heap() {
        Some(heap) => Box::new(DmaHeapAllocator::new(heap)?),
        None => Box::new(HeapAllocator),
    };
    let camera: Box<dyn CaptureDevice> = if args.synthetic {
        let name = Path::new(device)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(device);
        Box::new(
            SyntheticCamera::new()
                .with_name(name)
                .with_frame_interval(Duration::from_millis(33)),
        )
    } else {
        Box::new(V4l2Camera::new(device).with_mirror(args.mirror.into()))
    };
    let directory = args.output_dir.join(camera.name());
    fs::create_dir_all(&directory)?;

    let backend = Backend {
        allocator,
        camera,
        encoder: Box::new(TurboJpegSession::new()),
    };
    let pipeline = Arc::new(Pipeline::initialize(config.clone(), backend)?);
    pipeline.start()?;
    let worker = pipeline.spawn_stream(config.frame_timeout() * 5)?;
    info!(camera = device, directory = %directory.display(), "streaming");

    Ok(Stream {
        directory,
        pipeline,
        worker,
    })
}

fn save(directory: &Path, image: &EncodedImage) -> Result<(), Box<dyn Error>> {
    let extension = match image.kind {
        ImageKind::Jpeg => "jpg".to_owned(),
        ImageKind::Pixels(format) => format.to_string().to_lowercase(),
    };
    let path = directory.join(format!("{}.{extension}", image.frame_number));
    fs::write(&path, &image.bytes)?;
    info!(
        path = %path.display(),
        bytes = image.bytes.len(),
        sequence = image.sequence,
        "saved"
    );
    Ok(())
}

fn report(directory: &Path, pipeline: &Pipeline) {
    let counters = pipeline.counters();
    info!(
        directory = %directory.display(),
        captured = counters.frames_captured,
        encoded = counters.frames_encoded,
        dropped = counters.frames_dropped,
        capture_timeouts = counters.capture_timeouts,
        encoder_failures = counters.encoder_failures,
        "pipeline counters"
    );
    info!(
        "latency avg {:.2} ms max {:.2} ms (capture {:.2} convert {:.2} encode {:.2} deliver {:.2}) fps {:.1}",
        counters.avg_latency_ms,
        counters.max_latency_ms,
        counters.avg_capture_ms,
        counters.avg_convert_ms,
        counters.avg_encode_ms,
        counters.avg_deliver_ms,
        counters.fps
    );
}

fn load_config(path: &Path) -> Result<PipelineConfig, Box<dyn Error>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn init_logging(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let journald = match tracing_journald::layer() {
        Ok(layer) => Some(layer),
        Err(e) => {
            eprintln!("journald unavailable: {e}");
            None
        }
    };
    let tracy = args.tracy.then(|| {
        tracy_client::Client::start();
        tracing_tracy::TracyLayer::default()
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}
