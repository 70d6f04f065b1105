//! Camera frame acquisition.
//!
//! Each camera runs a continuous "grab" loop on its own dedicated
//! thread (the camera handle isn't `Send`, so it never leaves the
//! thread that opened it) and publishes into a single most-recent
//! slot. The dashboard pipeline calls [`CameraCache::retrieve`], a
//! non-blocking read of that slot, once per tick.

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use types::Frame;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera not found")]
    NotFound,
    #[error("capture error: {0}")]
    Capture(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames older than this are treated as if no frame were available.
    pub cache_max_life: Duration,
    pub flipped: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 15,
            cache_max_life: Duration::from_secs(5),
            flipped: false,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The single most-recent-frame slot for one camera.
#[derive(Clone)]
pub struct CameraCache {
    slot: Arc<Mutex<Option<(Frame, Instant)>>>,
    max_life: Duration,
}

impl CameraCache {
    /// Build a standalone cache with nothing publishing into it yet.
    /// Useful for wiring a pipeline in tests without opening a real
    /// camera device.
    pub fn new(max_life: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            max_life,
        }
    }

    pub fn publish(&self, frame: Frame) {
        *self.slot.lock().unwrap() = Some((frame, Instant::now()));
    }

    /// Non-blocking retrieve of the latest frame, or `None` if nothing
    /// has ever been grabbed or the most recent grab is older than
    /// `cache_max_life`.
    pub fn retrieve(&self) -> Option<Frame> {
        let guard = self.slot.lock().unwrap();
        match &*guard {
            Some((frame, grabbed_at)) if grabbed_at.elapsed() <= self.max_life => {
                Some(frame.clone())
            }
            _ => None,
        }
    }
}

/// Spawn a dedicated capture thread for one camera. Returns a cache the
/// caller can poll and the thread's join handle.
pub fn spawn_capture_thread(
    config: Config,
) -> Result<(CameraCache, std::thread::JoinHandle<()>), CameraError> {
    let cache = CameraCache::new(config.cache_max_life);
    let publish_cache = cache.clone();

    let handle = std::thread::spawn(move || {
        if let Err(e) = capture_loop(config, publish_cache) {
            error!(?e, "camera capture loop failed");
        }
    });

    Ok((cache, handle))
}

fn open_camera(config: &Config) -> Result<Camera, CameraError> {
    let index = CameraIndex::Index(config.index);
    let cameras = nokhwa::query(nokhwa::utils::ApiBackend::Auto).unwrap_or_default();
    if cameras.is_empty() {
        error!("no cameras found on this system");
        return Err(CameraError::NotFound);
    }
    info!(count = cameras.len(), "found cameras");

    let format = CameraFormat::new(
        Resolution::new(config.width, config.height),
        FrameFormat::MJPEG,
        config.fps,
    );
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

    match Camera::new(index.clone(), requested) {
        Ok(cam) => Ok(cam),
        Err(e) => {
            warn!(?e, "failed with requested format, trying any format");
            let requested =
                RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
            Camera::new(index, requested).map_err(|e| {
                error!(?e, "failed to open camera with any format");
                CameraError::NotFound
            })
        }
    }
}

fn capture_loop(config: Config, cache: CameraCache) -> Result<(), CameraError> {
    let mut camera = open_camera(&config)?;
    camera.open_stream().map_err(|e| {
        error!(?e, "failed to open camera stream");
        CameraError::Capture(e.to_string())
    })?;

    info!(index = config.index, width = config.width, height = config.height, fps = config.fps, "camera stream opened");

    let target_interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
    let mut last_frame = Instant::now();

    loop {
        let elapsed = last_frame.elapsed();
        if elapsed < target_interval {
            std::thread::sleep(target_interval - elapsed);
        }
        last_frame = Instant::now();

        let captured = match camera.frame() {
            Ok(f) => f,
            Err(e) => {
                warn!(?e, "frame capture failed");
                continue;
            }
        };

        let resolution = captured.resolution();
        let (width, height) = (resolution.width(), resolution.height());

        let rgb = match captured.decode_image::<RgbFormat>() {
            Ok(d) => d,
            Err(e) => {
                warn!(?e, "frame decode failed");
                continue;
            }
        };

        let mut data = rgb.into_raw();
        if config.flipped {
            flip_rgb_in_place(&mut data, width, height);
        }

        cache.publish(Frame::new(data, width, height, now_ms()));
    }
}

/// 180-degree flip (used when the camera is mounted upside down): reverse
/// the pixel order so the last pixel becomes the first.
fn flip_rgb_in_place(data: &mut [u8], width: u32, height: u32) {
    let pixel_count = (width as usize) * (height as usize);
    for i in 0..pixel_count / 2 {
        let a = i * 3;
        let b = (pixel_count - 1 - i) * 3;
        for k in 0..3 {
            data.swap(a + k, b + k);
        }
    }
}

/// Encode a frame as JPEG for the HTTP snapshot route and recording
/// (uses the `image` crate's encoder; no custom codec work here).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, CameraError> {
    use image::codecs::jpeg::JpegEncoder;
    use std::io::Cursor;

    let mut buf = Vec::with_capacity((frame.width * frame.height) as usize);
    let mut cursor = Cursor::new(&mut buf);
    let mut encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
    encoder
        .encode(&frame.data, frame.width, frame.height, image::ExtendedColorType::Rgb8)
        .map_err(|e| CameraError::Encoding(e.to_string()))?;
    debug!(bytes = buf.len(), "encoded snapshot jpeg");
    Ok(buf)
}
