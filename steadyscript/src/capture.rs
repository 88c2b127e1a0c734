//! Frame source: owns the V4L2 capture device on a dedicated thread.
//!
//! The thread publishes the newest frame into a `watch` channel, so the
//! contract downstream is "latest frame wins" — if the pipeline is slow,
//! intermediate frames are silently discarded rather than queued.

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::config::AppConfig;
use crate::errors::CaptureError;

/// One captured frame, RGB, mirror-flipped for display.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: RgbImage,
    pub captured_at: Instant,
}

pub type FrameSender = watch::Sender<Option<Arc<CapturedFrame>>>;
pub type FrameReceiver = watch::Receiver<Option<Arc<CapturedFrame>>>;

/// An opened capture device with its negotiated format.
pub struct CaptureDevice {
    index: usize,
    device: Device,
    format: Format,
}

/// Open and configure the camera. Failure here is fatal to the process.
pub fn open_device(cfg: &AppConfig) -> Result<CaptureDevice, CaptureError> {
    let device = Device::new(cfg.camera_index).map_err(|source| CaptureError::DeviceUnavailable {
        index: cfg.camera_index,
        source,
    })?;

    let wanted = Format::new(cfg.frame_width, cfg.frame_height, FourCC::new(b"YUYV"));
    let format = device
        .set_format(&wanted)
        .map_err(|source| CaptureError::DeviceUnavailable {
            index: cfg.camera_index,
            source,
        })?;

    if let Err(e) = device.set_params(&Parameters::with_fps(cfg.frame_rate)) {
        // Some drivers refuse interval changes; not fatal.
        warn!("could not set {} fps on camera: {e}", cfg.frame_rate);
    }

    let fourcc = format.fourcc;
    if fourcc != FourCC::new(b"YUYV") && fourcc != FourCC::new(b"MJPG") {
        return Err(CaptureError::UnsupportedFormat(fourcc.to_string()));
    }

    info!(
        "camera {} ready: {}x{} {}",
        cfg.camera_index, format.width, format.height, fourcc
    );

    Ok(CaptureDevice {
        index: cfg.camera_index,
        device,
        format,
    })
}

/// Run the capture loop until the receiver side goes away. Intended to be
/// spawned on its own OS thread.
pub fn capture_loop(capture: CaptureDevice, frame_tx: FrameSender) -> Result<(), CaptureError> {
    let CaptureDevice {
        index,
        device,
        format,
    } = capture;
    let mut stream =
        MmapStream::with_buffers(&device, Type::VideoCapture, 4).map_err(|source| {
            CaptureError::DeviceUnavailable { index, source }
        })?;

    let mut consecutive_errors: u32 = 0;
    loop {
        let decoded = match stream.next() {
            Ok((buf, _meta)) => decode_frame(buf, &format),
            Err(e) => Err(CaptureError::FrameDropped(e.to_string())),
        };

        match decoded {
            Ok(image) => {
                consecutive_errors = 0;
                let frame = Arc::new(CapturedFrame {
                    image: image::imageops::flip_horizontal(&image),
                    captured_at: Instant::now(),
                });
                if frame_tx.send(Some(frame)).is_err() {
                    debug!("no frame receivers left; stopping capture");
                    return Ok(());
                }
            }
            Err(e) => {
                // Transient: downstream keeps using the previous frame.
                consecutive_errors = consecutive_errors.saturating_add(1);
                if consecutive_errors % 30 == 1 {
                    warn!("transient capture error ({consecutive_errors} consecutive): {e}");
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
}

fn decode_frame(buf: &[u8], format: &Format) -> Result<RgbImage, CaptureError> {
    let (w, h) = (format.width, format.height);
    if format.fourcc == FourCC::new(b"YUYV") {
        yuyv_to_rgb(buf, w, h)
    } else {
        // MJPG fallback.
        let img = image::load_from_memory(buf)
            .map_err(|e| CaptureError::FrameDropped(format!("jpeg decode: {e}")))?;
        Ok(img.to_rgb8())
    }
}

/// BT.601 YUYV 4:2:2 to packed RGB.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let expected = (width * height * 2) as usize;
    if buf.len() < expected {
        return Err(CaptureError::FrameDropped(format!(
            "short YUYV buffer: {} < {}",
            buf.len(),
            expected
        )));
    }

    let mut out = vec![0u8; (width * height * 3) as usize];
    for (i, chunk) in buf[..expected].chunks_exact(4).enumerate() {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        let px = i * 2;
        write_yuv_pixel(&mut out[px * 3..px * 3 + 3], y0, u, v);
        write_yuv_pixel(&mut out[(px + 1) * 3..(px + 1) * 3 + 3], y1, u, v);
    }

    RgbImage::from_raw(width, height, out)
        .ok_or_else(|| CaptureError::FrameDropped("YUYV buffer size mismatch".to_string()))
}

fn write_yuv_pixel(out: &mut [u8], y: u8, u: u8, v: u8) {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    out[0] = (1.164 * c + 1.596 * e).round().clamp(0.0, 255.0) as u8;
    out[1] = (1.164 * c - 0.392 * d - 0.813 * e).round().clamp(0.0, 255.0) as u8;
    out[2] = (1.164 * c + 2.017 * d).round().clamp(0.0, 255.0) as u8;
}
