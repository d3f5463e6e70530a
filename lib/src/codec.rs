//! Seam to the native image codec.
//!
//! The codec that turns compressed bytes into frames is an external
//! collaborator. This module defines the narrow interface the rest of the
//! library consumes it through:
//!
//! * [`Codec`] decodes a byte stream into a [`FrameSource`],
//! * [`FrameSource`] describes a decoded image (dimensions, opacity, frame
//!   count, per-frame delay) and hands out decode cursors,
//! * [`FrameCursor`] walks the frames of one source and renders the current
//!   one into a caller-provided [`Bitmap`].
//!
//! One source may serve several cursors at the same time, each at its own
//! position. This is what allows several renderers to display the same
//! animated buffer independently.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::{AllocError, Bitmap};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed or truncated image data")]
    Malformed,
    #[error("unsupported image format")]
    Unsupported,
    #[error("cannot allocate pixel storage")]
    Alloc(#[from] AllocError),
    #[error("error while reading image data")]
    Io(#[from] std::io::Error),
    #[error("codec error")]
    Codec(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot allocate pixel storage")]
    Alloc(#[from] AllocError),
    #[error("target surface is {target_width}x{target_height} but the frame is {frame_width}x{frame_height}")]
    SizeMismatch {
        target_width: u32,
        target_height: u32,
        frame_width: u32,
        frame_height: u32,
    },
    #[error("codec error")]
    Codec(#[from] anyhow::Error),
}

/// A decoded image, possibly made of several frames.
///
/// Sources are immutable and can be shared; all per-position state lives in
/// the cursors they produce.
pub trait FrameSource: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn is_opaque(&self) -> bool;
    /// Total number of frames. `1` means the image is static.
    fn frame_count(&self) -> usize;
    /// How long `frame` should remain displayed before advancing.
    fn delay(&self, frame: usize) -> Duration;
    /// Size of the decoded data in bytes, for cache accounting.
    fn byte_size(&self) -> usize;
    /// Open a new cursor positioned on frame 0.
    fn open_cursor(self: Arc<Self>) -> Box<dyn FrameCursor>;
}

/// A private decode position over one [`FrameSource`].
pub trait FrameCursor: Send {
    /// Rewind to frame 0.
    fn reset(&mut self);
    /// Move to the next frame, wrapping back to frame 0 after the last one.
    fn advance(&mut self);
    /// Delay of the current frame.
    fn current_delay(&self) -> Duration;
    /// Render the current frame into `target`, which must match the source
    /// dimensions.
    fn render_into(&mut self, target: &mut Bitmap) -> Result<(), RenderError>;
}

/// Entry point of the external codec.
pub trait Codec {
    /// Decode a full image from `reader`.
    ///
    /// The reader is consumed whole; classification of the result as static
    /// or animated is left to the caller (see the `cache` module).
    fn decode(&self, reader: &mut dyn Read) -> Result<Arc<dyn FrameSource>, DecodeError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A tiny in-memory codec used by the tests of the other modules.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source with a fixed number of frames. Frame `i` renders as a solid
    /// fill of value `i`, and its delay is `(i + 1) * 10ms` unless overridden.
    pub(crate) struct TestSource {
        pub width: u32,
        pub height: u32,
        pub opaque: bool,
        pub delays: Vec<Duration>,
        /// Number of cursors currently alive over this source.
        pub live_cursors: Arc<AtomicUsize>,
    }

    impl TestSource {
        pub fn new(frame_count: usize) -> Self {
            TestSource {
                width: 4,
                height: 2,
                opaque: false,
                delays: (0..frame_count)
                    .map(|i| Duration::from_millis((i as u64 + 1) * 10))
                    .collect(),
                live_cursors: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_delays(delays: Vec<Duration>) -> Self {
            TestSource {
                delays,
                ..Self::new(0)
            }
        }
    }

    impl FrameSource for TestSource {
        fn width(&self) -> u32 {
            self.width
        }

        fn height(&self) -> u32 {
            self.height
        }

        fn is_opaque(&self) -> bool {
            self.opaque
        }

        fn frame_count(&self) -> usize {
            self.delays.len()
        }

        fn delay(&self, frame: usize) -> Duration {
            self.delays[frame]
        }

        fn byte_size(&self) -> usize {
            self.delays.len() * (self.width * self.height) as usize * 4
        }

        fn open_cursor(self: Arc<Self>) -> Box<dyn FrameCursor> {
            self.live_cursors.fetch_add(1, Ordering::SeqCst);
            Box::new(TestCursor {
                source: self,
                frame: 0,
            })
        }
    }

    pub(crate) struct TestCursor {
        source: Arc<TestSource>,
        frame: usize,
    }

    impl Drop for TestCursor {
        fn drop(&mut self) {
            self.source.live_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FrameCursor for TestCursor {
        fn reset(&mut self) {
            self.frame = 0;
        }

        fn advance(&mut self) {
            self.frame = (self.frame + 1) % self.source.frame_count();
        }

        fn current_delay(&self) -> Duration {
            self.source.delays[self.frame]
        }

        fn render_into(&mut self, target: &mut Bitmap) -> Result<(), RenderError> {
            if target.width() != self.source.width || target.height() != self.source.height {
                return Err(RenderError::SizeMismatch {
                    target_width: target.width(),
                    target_height: target.height(),
                    frame_width: self.source.width,
                    frame_height: self.source.height,
                });
            }
            let value = self.frame as u32;
            target.pixels_mut().fill(value);
            Ok(())
        }
    }

    /// Codec for byte streams whose first byte is the frame count. A stream
    /// that is empty or starts with 0 is malformed.
    pub(crate) struct TestCodec;

    impl Codec for TestCodec {
        fn decode(&self, reader: &mut dyn Read) -> Result<Arc<dyn FrameSource>, DecodeError> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            match data.first().copied() {
                None | Some(0) => Err(DecodeError::Malformed),
                Some(n) => Ok(Arc::new(TestSource::new(n as usize))),
            }
        }
    }
}
