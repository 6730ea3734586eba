use super::CaptureSource;
use anyhow::{Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;

/// Frame rate requested from the camera driver.
const REQUESTED_FPS: u32 = 30;

pub struct WebcamCapture {
    camera: Camera,
    device_index: u32,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    /// Open camera `device_index`, asking for the format closest to `width`x`height`.
    pub fn new(device_index: u32, width: u32, height: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let index = CameraIndex::Index(device_index);
        let wanted = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, REQUESTED_FPS);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(wanted));

        let mut camera = Camera::new(index, requested)
            .with_context(|| format!("Failed to open camera {device_index}"))?;

        camera.open_stream()
            .context("Failed to open camera stream")?;

        let actual = camera.resolution();
        tracing::info!(
            "Webcam {} streaming at {}x{}",
            device_index,
            actual.width(),
            actual.height()
        );

        Ok(Self {
            camera,
            device_index,
            width: actual.width(),
            height: actual.height(),
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let frame = self
            .camera
            .frame()
            .context("Failed to capture frame")?;

        let decoded = frame.decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        Ok(decoded)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        match self.camera.stop_stream() {
            Ok(()) => tracing::info!("Webcam {} released", self.device_index),
            Err(err) => tracing::warn!("Webcam {} release warning: {}", self.device_index, err),
        }
    }
}

/// Enumerate capture devices as (index, name) pairs.
pub fn list_cameras() -> Result<Vec<(String, String)>> {
    let cameras = nokhwa::query(ApiBackend::Auto).context("Failed to query cameras")?;
    Ok(cameras
        .into_iter()
        .map(|info| (info.index().to_string(), info.human_name()))
        .collect())
}
