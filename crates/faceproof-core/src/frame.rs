use std::io::Cursor;
use std::sync::Arc;

use image::{imageops, ImageFormat, RgbImage};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{CameraError, CaptureError};
use crate::source::FrameSource;
use crate::types::{BlobFormat, ImageBlob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

/// One repainted frame: RGB pixels plus the repaint counter it came from.
///
/// Frames are immutable once painted; readers share them through `Arc`.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    index: u64,
}

impl Frame {
    pub fn new(image: RgbImage, index: u64) -> Self {
        Self { image, index }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Package the pixels as a PNG blob.
    pub fn encode_png(&self) -> Result<ImageBlob, CaptureError> {
        let mut bytes = Cursor::new(Vec::new());
        self.image
            .write_to(&mut bytes, ImageFormat::Png)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;
        Ok(ImageBlob {
            format: BlobFormat::Png,
            width: self.width(),
            height: self.height(),
            bytes: bytes.into_inner(),
        })
    }
}

/// Drawable copy of the frame source that inference reads from.
///
/// The controller is the only writer: every cycle it repaints from the
/// source, which swaps in a fresh [`Frame`]. In-flight inference keeps
/// reading the frame it was handed, so a repaint never races a reader.
/// Each repaint is also published to the video passthrough surface.
pub struct FrameBuffer {
    current: Option<Arc<Frame>>,
    painted: u64,
    mirror: bool,
    surface: watch::Sender<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new(mirror: bool, surface: watch::Sender<Option<Arc<Frame>>>) -> Self {
        Self {
            current: None,
            painted: 0,
            mirror,
            surface,
        }
    }

    /// Read the source's latest frame into the buffer.
    pub fn repaint<S: FrameSource + ?Sized>(
        &mut self,
        source: &S,
    ) -> Result<Arc<Frame>, CameraError> {
        let mut image = source.read_frame()?;
        if self.mirror {
            imageops::flip_horizontal_in_place(&mut image);
        }
        self.painted += 1;
        let frame = Arc::new(Frame::new(image, self.painted));
        self.current = Some(Arc::clone(&frame));
        self.surface.send_replace(Some(Arc::clone(&frame)));
        Ok(frame)
    }

    pub fn current(&self) -> Option<Arc<Frame>> {
        self.current.clone()
    }

    pub fn painted(&self) -> u64 {
        self.painted
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.surface.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StillImageSource;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, _| Rgb([x as u8, 0, 0]))
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(gradient(4, 2), 7);
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.index(), 7);
    }

    #[test]
    fn test_encode_png_signature() {
        let blob = Frame::new(gradient(8, 8), 1).encode_png().unwrap();
        assert_eq!(blob.format, BlobFormat::Png);
        assert_eq!((blob.width, blob.height), (8, 8));
        assert_eq!(&blob.bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_repaint_publishes_and_counts() {
        let (tx, rx) = watch::channel(None);
        let mut buffer = FrameBuffer::new(false, tx);
        let source = StillImageSource::from_image(gradient(4, 2));

        let first = buffer.repaint(&source).unwrap();
        let second = buffer.repaint(&source).unwrap();
        assert_eq!(first.index(), 1);
        assert_eq!(second.index(), 2);
        assert_eq!(buffer.painted(), 2);
        assert_eq!(rx.borrow().as_ref().map(|f| f.index()), Some(2));

        // Earlier readers keep their own frame.
        assert_eq!(first.index(), 1);
    }

    #[test]
    fn test_repaint_mirrors() {
        let (tx, _rx) = watch::channel(None);
        let mut buffer = FrameBuffer::new(true, tx);
        let source = StillImageSource::from_image(gradient(4, 1));

        let frame = buffer.repaint(&source).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0)[0], 3);
        assert_eq!(frame.image().get_pixel(3, 0)[0], 0);
    }

    #[test]
    fn test_repaint_before_ready_fails() {
        let (tx, rx) = watch::channel(None);
        let mut buffer = FrameBuffer::new(false, tx);
        let source = StillImageSource::from_path("/nonexistent/face.png");

        assert_eq!(buffer.repaint(&source).unwrap_err(), CameraError::NotReady);
        assert!(buffer.current().is_none());
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn test_clear_unpublishes() {
        let (tx, rx) = watch::channel(None);
        let mut buffer = FrameBuffer::new(false, tx);
        let source = StillImageSource::from_image(gradient(2, 2));
        buffer.repaint(&source).unwrap();

        buffer.clear();
        assert!(buffer.current().is_none());
        assert!(rx.borrow().is_none());
    }
}
