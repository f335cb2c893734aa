// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! V4L2 camera backed by the videostream library.
//!
//! The videostream reader and the buffers it hands out stay on a dedicated
//! `v4l2-capture` thread. That thread dequeues at the sensor cadence, copies
//! each frame out of its dmabuf and relays it over a bounded channel, so a
//! slow pipeline never holds a driver buffer.

use crate::{
    buffer::{BufferMemory, FrameInfo},
    capture::{CaptureDevice, DeviceError, DeviceFrame},
    dma::DmaMemory,
    format::FrameLayout,
};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use unix_ts::Timestamp;
use videostream::camera::{create_camera, CameraBuffer, CameraReader};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Camera image mirroring applied by the driver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mirror {
    #[default]
    None,
    Horizontal,
    Vertical,
    Both,
}

impl From<Mirror> for videostream::camera::Mirror {
    fn from(mirror: Mirror) -> Self {
        match mirror {
            Mirror::None => videostream::camera::Mirror::None,
            Mirror::Horizontal => videostream::camera::Mirror::Horizontal,
            Mirror::Vertical => videostream::camera::Mirror::Vertical,
            Mirror::Both => videostream::camera::Mirror::Both,
        }
    }
}

struct Frame {
    data: Vec<u8>,
    info: FrameInfo,
}

struct Stream {
    frames: Receiver<Result<Frame, String>>,
    spare: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Video4Linux2 capture device such as `/dev/video3`.
pub struct V4l2Camera {
    device: String,
    name: String,
    mirror: Mirror,
    queue_depth: usize,
    stream: Option<Stream>,
}

impl V4l2Camera {
    pub fn new(device: &str) -> Self {
        let name = Path::new(device)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(device)
            .to_string();
        Self {
            device: device.to_string(),
            name,
            mirror: Mirror::None,
            queue_depth: 2,
            stream: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = mirror;
        self
    }

    /// Frames buffered between the capture thread and the pipeline. Older
    /// frames are never replaced; new ones are dropped while the queue is
    /// full.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl CaptureDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, requested: FrameLayout) -> Result<FrameLayout, DeviceError> {
        self.stop();

        let (ready_tx, ready) = kanal::bounded(1);
        let (frame_tx, frames) = kanal::bounded(self.queue_depth);
        let (spare, spare_rx) = kanal::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let device = self.device.clone();
        let mirror = self.mirror;
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("v4l2-capture".to_string())
            .spawn(move || {
                let cam = match open(&device, mirror, requested) {
                    Ok(cam) => cam,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let layout = FrameLayout::new(
                    requested.format,
                    cam.width() as u32,
                    cam.height() as u32,
                );
                if ready_tx.send(Ok(layout)).is_ok() {
                    relay(&cam, frame_tx, spare_rx, &stop_flag);
                }
                debug!(device, "capture thread exited");
            })
            .map_err(|e| DeviceError::Fault(e.to_string()))?;

        let layout = match ready.recv() {
            Ok(Ok(layout)) => layout,
            Ok(Err(reason)) => {
                let _ = handle.join();
                return Err(DeviceError::Fault(reason));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(DeviceError::Fault("capture thread exited".to_string()));
            }
        };

        info!(device = %self.device, %layout, "camera streaming");
        self.stream = Some(Stream {
            frames,
            spare,
            stop,
            handle,
        });
        Ok(layout)
    }

    fn read(
        &mut self,
        timeout: Duration,
        dst: Option<&mut [u8]>,
    ) -> Result<DeviceFrame, DeviceError> {
        let Some(stream) = &self.stream else {
            return Err(DeviceError::Fault("stream not started".to_string()));
        };

        match stream.frames.recv_timeout(timeout) {
            Ok(Ok(frame)) => {
                let bytes_used = match dst {
                    Some(dst) => {
                        let len = frame.data.len().min(dst.len());
                        dst[..len].copy_from_slice(&frame.data[..len]);
                        len
                    }
                    None => 0,
                };
                let info = frame.info;
                let _ = stream.spare.send(frame.data);
                Ok(DeviceFrame { info, bytes_used })
            }
            Ok(Err(reason)) => Err(DeviceError::Fault(reason)),
            Err(ReceiveErrorTimeout::Timeout) => Err(DeviceError::Timeout),
            Err(_) => Err(DeviceError::Fault("capture thread exited".to_string())),
        }
    }

    fn stop(&mut self) {
        let Some(Stream {
            frames,
            spare,
            stop,
            handle,
        }) = self.stream.take()
        else {
            return;
        };
        stop.store(true, Ordering::Relaxed);
        drop(frames);
        drop(spare);

        // The reader may be blocked on a frame that never comes.
        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!(device = %self.device, "capture thread unresponsive, detaching");
        }
        info!(device = %self.device, "camera stopped");
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open(device: &str, mirror: Mirror, requested: FrameLayout) -> Result<CameraReader, String> {
    let cam = create_camera()
        .with_device(device)
        .with_resolution(requested.width as i32, requested.height as i32)
        .with_format(requested.format.fourcc())
        .with_mirror(mirror.into())
        .open()
        .map_err(|e| format!("{device}: {e}"))?;
    cam.start().map_err(|e| format!("{device}: {e}"))?;
    Ok(cam)
}

fn relay(
    cam: &CameraReader,
    frames: Sender<Result<Frame, String>>,
    spare: Receiver<Vec<u8>>,
    stop: &AtomicBool,
) {
    let mut number = 0;
    while !stop.load(Ordering::Relaxed) {
        let frame = cam.read().map_err(|e| e.to_string()).and_then(|buf| {
            number += 1;
            let mut data = spare.try_recv().ok().flatten().unwrap_or_default();
            copy_frame(&buf, &mut data)?;
            Ok(Frame {
                data,
                info: FrameInfo {
                    number,
                    timestamp: since_epoch(buf.timestamp()),
                },
            })
        });

        let fault = frame.is_err();
        match frames.try_send(frame) {
            Ok(true) => {}
            Ok(false) => debug!(frame = number, "capture queue full, frame dropped"),
            Err(_) => break,
        }
        if fault {
            break;
        }
    }
}

fn copy_frame(buf: &CameraBuffer<'_>, data: &mut Vec<u8>) -> Result<(), String> {
    let fd = buf.fd().try_clone_to_owned().map_err(|e| e.to_string())?;
    let mem = DmaMemory::map(fd, buf.length() as usize).map_err(|e| e.to_string())?;
    data.clear();
    data.extend_from_slice(mem.as_slice());
    Ok(())
}

fn since_epoch(ts: Timestamp) -> Duration {
    Duration::new(ts.seconds().max(0) as u64, ts.subsec(9))
}
