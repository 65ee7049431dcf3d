use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, RgbImage};

use crate::config::{CameraConstraints, ResizeMode};
use crate::error::CameraError;
use crate::frame::FrameGeometry;

/// A camera-like producer of frames.
///
/// `acquire` is called once per controller lifetime; a failure is terminal
/// for that attempt and is never retried here. Once acquired, `read_frame`
/// must return the most recent frame without blocking.
#[async_trait]
pub trait FrameSource: Send + 'static {
    async fn acquire(
        &mut self,
        constraints: &CameraConstraints,
    ) -> Result<FrameGeometry, CameraError>;

    fn read_frame(&self) -> Result<RgbImage, CameraError>;

    /// Stop the stream. Must be safe to call more than once.
    fn release(&mut self);
}

/// Serves one decoded image as every frame. Useful for replaying a still
/// photo through the pipeline.
pub struct StillImageSource {
    path: Option<PathBuf>,
    image: Option<RgbImage>,
}

impl StillImageSource {
    /// Decode `path` lazily on `acquire`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            image: None,
        }
    }

    /// Serve an already-decoded image; ready without acquisition.
    pub fn from_image(image: RgbImage) -> Self {
        Self {
            path: None,
            image: Some(image),
        }
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    async fn acquire(
        &mut self,
        constraints: &CameraConstraints,
    ) -> Result<FrameGeometry, CameraError> {
        let decoded = match (&self.path, self.image.take()) {
            (_, Some(image)) => image,
            (Some(path), None) => {
                let path = path.clone();
                let opened = tokio::task::spawn_blocking(move || image::open(&path))
                    .await
                    .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))?;
                opened.map_err(map_image_error)?.to_rgb8()
            }
            (None, None) => {
                return Err(CameraError::DeviceUnavailable(
                    "no image configured".to_string(),
                ))
            }
        };

        let image = fit_to_constraints(decoded, constraints);
        let geometry = FrameGeometry {
            width: image.width(),
            height: image.height(),
        };
        tracing::info!(
            path = ?self.path,
            width = geometry.width,
            height = geometry.height,
            "still image source acquired"
        );
        self.image = Some(image);
        Ok(geometry)
    }

    fn read_frame(&self) -> Result<RgbImage, CameraError> {
        self.image.clone().ok_or(CameraError::NotReady)
    }

    fn release(&mut self) {
        if self.image.take().is_some() {
            tracing::debug!("still image source released");
        }
    }
}

fn map_image_error(err: ImageError) -> CameraError {
    match err {
        ImageError::IoError(io) if io.kind() == ErrorKind::NotFound => {
            CameraError::DeviceUnavailable(io.to_string())
        }
        ImageError::IoError(io) if io.kind() == ErrorKind::PermissionDenied => {
            CameraError::PermissionDenied(io.to_string())
        }
        other => CameraError::Unsupported(other.to_string()),
    }
}

/// Apply the requested dimensions the way a camera would with
/// `crop-and-scale`: fill the target box, cropping the excess.
fn fit_to_constraints(image: RgbImage, constraints: &CameraConstraints) -> RgbImage {
    if constraints.resize_mode == ResizeMode::None {
        return image;
    }
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return image;
    }
    let (target_w, target_h) = match (constraints.width, constraints.height) {
        (None, None) => return image,
        (Some(tw), Some(th)) => (tw, th),
        (Some(tw), None) => (tw, scaled(h, tw, w)),
        (None, Some(th)) => (scaled(w, th, h), th),
    };
    if (target_w, target_h) == (w, h) {
        return image;
    }
    DynamicImage::ImageRgb8(image)
        .resize_to_fill(target_w, target_h, FilterType::Triangle)
        .to_rgb8()
}

fn scaled(value: u32, numerator: u32, denominator: u32) -> u32 {
    ((u64::from(value) * u64::from(numerator)) / u64::from(denominator)).max(1) as u32
}
