//! OpenCV-backed camera capture with blocking reconnect.

use std::{thread, time::Duration};

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{info, warn};

use crate::types::{CaptureError, Frame, FrameFormat};

/// Pull-based capture handle driven by the orchestrator loop.
///
/// `open` blocks until a connection succeeds, retrying forever at a fixed
/// interval. `read` reports per-frame decode/timeout failures as `None` so the
/// caller can count consecutive failures and decide when to reconnect.
pub trait CaptureSource {
    /// Connect to the source, discarding any previous handle. Blocks,
    /// retrying until a connection is established.
    fn open(&mut self);

    /// Fetch the next frame. `None` means the read failed or produced an
    /// empty frame; the handle stays usable.
    fn read(&mut self) -> Option<Frame>;

    /// Release the underlying handle. Safe to call repeatedly or before
    /// `open`.
    fn close(&mut self);
}

/// Network (MJPEG/RTSP URL) or local V4L camera source.
pub struct NetCamera {
    uri: String,
    target_size: (i32, i32),
    retry_interval: Duration,
    cap: Option<VideoCapture>,
    frame: Mat,
    scratch: Mat,
}

impl NetCamera {
    pub fn new(uri: impl Into<String>, target_size: (i32, i32), retry_interval: Duration) -> Self {
        Self {
            uri: uri.into(),
            target_size,
            retry_interval,
            cap: None,
            frame: Mat::default(),
            scratch: Mat::default(),
        }
    }

    /// Single connection attempt across the candidate OpenCV backends.
    fn try_open(&self) -> Result<VideoCapture, CaptureError> {
        if let Some(index) = parse_device_index(&self.uri) {
            for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
                match VideoCapture::new(index, backend) {
                    Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                    Ok(_) => {}
                    Err(err) => {
                        warn!("failed to open device #{index} with backend {backend}: {err}");
                    }
                }
            }
        } else {
            match VideoCapture::from_file(&self.uri, videoio::CAP_ANY) {
                Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                Ok(_) => {}
                Err(err) => return Err(CaptureError::Other(err.into())),
            }
        }

        Err(CaptureError::Open {
            uri: self.uri.clone(),
        })
    }
}

impl CaptureSource for NetCamera {
    fn open(&mut self) {
        self.close();

        loop {
            info!("connecting to camera stream {}", self.uri);
            match self.try_open() {
                Ok(mut cap) => {
                    configure_capture(&mut cap, self.target_size);
                    info!("camera stream connected");
                    self.cap = Some(cap);
                    return;
                }
                Err(err) => {
                    warn!("{err}, retrying in {:?}", self.retry_interval);
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    fn read(&mut self) -> Option<Frame> {
        let cap = self.cap.as_mut()?;

        match cap.read(&mut self.frame) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!("frame read error: {err}");
                return None;
            }
        }

        let size = self.frame.size().ok()?;
        if size.width <= 0 || size.height <= 0 {
            return None;
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .ok()?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working.data_bytes().ok()?.to_vec();

        Some(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            if let Err(err) = cap.release() {
                warn!("failed to release capture handle: {err}");
            }
        }
    }
}

impl Drop for NetCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Apply capture settings; keep the driver-side buffer shallow so reads stay
/// close to live.
fn configure_capture(cap: &mut VideoCapture, target_size: (i32, i32)) {
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
}
