//! Per-surface views onto a buffer's current frame.
//!
//! A [`Renderer`] is what a display surface actually paints from. It holds
//! one reference on its [`ImageBuffer`] for its whole lifetime, so the
//! payload cannot be freed while the surface might still read it, even if
//! the cache evicts the buffer in the meantime.
//!
//! The output surface and decode cursor of a sequence renderer are
//! exclusively owned by that renderer, which is why `advance`/`reset` need
//! no locking: only the owner (in practice the drawable's worker thread)
//! ever calls them.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};

use crate::buffer::ImageBuffer;
use crate::codec::FrameCursor;
use crate::Bitmap;

enum Kind {
    /// Aliases the buffer's surface. Never animates.
    Static { bitmap: Arc<Bitmap> },
    /// Owns a private cursor and output surface so several renderers over
    /// the same sequence can sit at different frames.
    Sequence {
        cursor: Box<dyn FrameCursor>,
        bitmap: Bitmap,
    },
}

/// A view onto one [`ImageBuffer`], created with
/// [`ImageBuffer::create_renderer`].
///
/// Geometry and opacity are captured at construction and remain valid after
/// recycling; frame operations become no-ops and [`Renderer::bitmap`]
/// returns `None` once recycled.
pub struct Renderer {
    width: u32,
    height: u32,
    opaque: bool,
    animated: bool,

    buffer: Arc<ImageBuffer>,
    /// `None` once recycled.
    kind: Option<Kind>,
}

impl Renderer {
    /// The buffer has already acquired one reference on our behalf.
    pub(crate) fn new_static(buffer: Arc<ImageBuffer>, bitmap: Arc<Bitmap>) -> Self {
        Renderer {
            width: bitmap.width(),
            height: bitmap.height(),
            opaque: bitmap.is_opaque(),
            animated: false,
            buffer,
            kind: Some(Kind::Static { bitmap }),
        }
    }

    /// The buffer has already acquired one reference on our behalf.
    pub(crate) fn new_sequence(
        buffer: Arc<ImageBuffer>,
        cursor: Box<dyn FrameCursor>,
        bitmap: Bitmap,
    ) -> Self {
        Renderer {
            width: bitmap.width(),
            height: bitmap.height(),
            opaque: bitmap.is_opaque(),
            animated: true,
            buffer,
            kind: Some(Kind::Sequence { cursor, bitmap }),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    pub fn is_animated(&self) -> bool {
        self.animated
    }

    pub fn is_recycled(&self) -> bool {
        self.kind.is_none()
    }

    /// Time the current frame should remain displayed, or `None` (never
    /// advance) if the renderer is static or recycled.
    pub fn current_delay(&self) -> Option<Duration> {
        match &self.kind {
            Some(Kind::Sequence { cursor, .. }) => Some(cursor.current_delay()),
            _ => None,
        }
    }

    /// Rewind to frame 0 and re-render. No-op on static or recycled
    /// renderers.
    pub fn reset(&mut self) {
        if let Some(Kind::Sequence { cursor, bitmap }) = &mut self.kind {
            cursor.reset();
            if let Err(e) = cursor.render_into(bitmap) {
                // Keep the previous pixels; the animation keeps going.
                warn!("failed to render frame after reset: {}", e);
            }
        }
    }

    /// Move to the next frame (wrapping) and re-render. No-op on static or
    /// recycled renderers.
    pub fn advance(&mut self) {
        if let Some(Kind::Sequence { cursor, bitmap }) = &mut self.kind {
            cursor.advance();
            if let Err(e) = cursor.render_into(bitmap) {
                warn!("failed to render frame after advance: {}", e);
            }
        }
    }

    /// The surface to paint from, or `None` if recycled.
    pub fn bitmap(&self) -> Option<&Bitmap> {
        match &self.kind {
            Some(Kind::Static { bitmap }) => Some(bitmap),
            Some(Kind::Sequence { bitmap, .. }) => Some(bitmap),
            None => None,
        }
    }

    /// Free the renderer's own resources and return its buffer reference.
    ///
    /// Idempotent: only the first call releases the reference.
    pub fn recycle(&mut self) {
        if self.kind.take().is_some() {
            if let Err(e) = self.buffer.release() {
                // Cannot happen while the refcount protocol is respected:
                // we held exactly one reference.
                error!("renderer failed to release its buffer: {}", e);
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.recycle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::TestSource;
    use std::sync::atomic::Ordering;

    fn animated_buffer(frame_count: usize) -> (Arc<ImageBuffer>, Arc<TestSource>) {
        let source = Arc::new(TestSource::new(frame_count));
        let buffer = Arc::new(ImageBuffer::new_animated(
            Arc::clone(&source) as Arc<dyn crate::codec::FrameSource>
        ));
        (buffer, source)
    }

    #[test]
    fn test_static_renderer() {
        let buffer = Arc::new(ImageBuffer::new_static(Bitmap::new(100, 50, true).unwrap()));
        let mut renderer = Arc::clone(&buffer).create_renderer().unwrap();

        assert_eq!(renderer.width(), 100);
        assert_eq!(renderer.height(), 50);
        assert!(renderer.is_opaque());
        assert!(!renderer.is_animated());
        assert_eq!(renderer.current_delay(), None);

        // Frame operations are no-ops, not errors.
        renderer.reset();
        renderer.advance();
        assert!(renderer.bitmap().is_some());
    }

    #[test]
    fn test_sequence_advance_wraps() {
        let (buffer, _) = animated_buffer(3);
        let mut renderer = Arc::clone(&buffer).create_renderer().unwrap();

        renderer.reset();
        let frame0 = renderer.bitmap().unwrap().pixels().to_vec();

        renderer.advance();
        assert_eq!(renderer.bitmap().unwrap().pixels()[0], 1);
        renderer.advance();
        assert_eq!(renderer.bitmap().unwrap().pixels()[0], 2);
        // Third advance wraps back to frame 0.
        renderer.advance();
        assert_eq!(renderer.bitmap().unwrap().pixels(), &frame0[..]);
    }

    #[test]
    fn test_sequence_reset_from_any_frame() {
        let (buffer, _) = animated_buffer(4);
        let mut renderer = Arc::clone(&buffer).create_renderer().unwrap();

        renderer.advance();
        renderer.advance();
        assert_eq!(renderer.bitmap().unwrap().pixels()[0], 2);

        renderer.reset();
        assert_eq!(renderer.bitmap().unwrap().pixels()[0], 0);
        assert_eq!(renderer.current_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_sequence_delays() {
        let source = Arc::new(TestSource::with_delays(vec![
            Duration::from_millis(100),
            Duration::from_millis(150),
            Duration::from_millis(200),
        ]));
        let buffer = Arc::new(ImageBuffer::new_animated(
            source as Arc<dyn crate::codec::FrameSource>,
        ));
        let mut renderer = Arc::clone(&buffer).create_renderer().unwrap();

        assert_eq!(renderer.current_delay(), Some(Duration::from_millis(100)));
        renderer.advance();
        assert_eq!(renderer.current_delay(), Some(Duration::from_millis(150)));
        renderer.advance();
        assert_eq!(renderer.current_delay(), Some(Duration::from_millis(200)));
        renderer.advance();
        assert_eq!(renderer.current_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_independent_renderers_over_one_buffer() {
        let (buffer, source) = animated_buffer(3);
        buffer.acquire(); // stand-in for the cache slot

        let mut first = Arc::clone(&buffer).create_renderer().unwrap();
        let mut second = Arc::clone(&buffer).create_renderer().unwrap();
        assert_eq!(source.live_cursors.load(Ordering::SeqCst), 2);

        first.advance();
        second.reset();
        assert_eq!(first.bitmap().unwrap().pixels()[0], 1);
        assert_eq!(second.bitmap().unwrap().pixels()[0], 0);

        first.recycle();
        second.recycle();
        assert_eq!(source.live_cursors.load(Ordering::SeqCst), 0);
        assert!(!buffer.is_recycled());

        buffer.release().unwrap();
        assert!(buffer.is_recycled());
    }

    #[test]
    fn test_recycle_is_idempotent() {
        let (buffer, _) = animated_buffer(2);
        buffer.acquire();
        let mut renderer = Arc::clone(&buffer).create_renderer().unwrap();

        renderer.recycle();
        renderer.recycle();
        assert!(renderer.is_recycled());
        assert!(renderer.bitmap().is_none());
        assert_eq!(renderer.current_delay(), None);

        // Exactly one reference was returned: the cache's is still there.
        assert!(buffer.is_referenced());
        buffer.release().unwrap();
        assert!(buffer.is_recycled());

        // Recycled renderers still answer geometry queries.
        assert_eq!(renderer.width(), 4);
        assert_eq!(renderer.height(), 2);
        renderer.reset();
        renderer.advance();
    }

    #[test]
    fn test_drop_releases_reference() {
        let (buffer, _) = animated_buffer(2);
        {
            let _renderer = Arc::clone(&buffer).create_renderer().unwrap();
            assert!(buffer.is_referenced());
        }
        assert!(!buffer.is_referenced());
        assert!(buffer.is_recycled());
    }
}
