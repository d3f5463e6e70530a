//! Reference-counted decoded image payloads.
//!
//! An [`ImageBuffer`] owns one decoded payload, either a single static
//! surface or a multi-frame source, and is the only object allowed to free
//! it. Everyone keeping the payload alive (a memory cache slot, a renderer)
//! holds one reference obtained with [`ImageBuffer::acquire`] and returned
//! with [`ImageBuffer::release`]; the release that brings the count back to
//! zero frees the payload synchronously on the calling thread.
//!
//! Only the reference count and the payload slot itself are ever mutated
//! after construction. Metadata (dimensions, opacity, frame count) is
//! captured at construction and stays readable after the payload is gone.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};
use thiserror::Error;

use crate::codec::FrameSource;
use crate::renderer::Renderer;
use crate::{AllocError, Bitmap};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// A release was attempted on a buffer whose count is already zero.
    /// This is a caller bug: it means someone released a reference they
    /// never acquired, and honoring it would double-free the payload.
    #[error("reference count would drop below zero")]
    Underflow,
    /// A direct recycle was attempted while references are still held.
    /// Cache code must rely on reference counting instead of forcing the
    /// payload out from under its holders.
    #[error("buffer is still referenced")]
    StillReferenced,
    /// The operation requires a live payload but it has been freed.
    #[error("buffer is recycled")]
    Recycled,
}

#[derive(Debug, Error)]
pub enum CreateRendererError {
    #[error("buffer is recycled")]
    Recycled,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// The decoded payload variants. Selected once at decode time, never
/// re-tagged.
pub(crate) enum Payload {
    /// A single pixel surface. Shared with static renderers without copying.
    Static(Arc<Bitmap>),
    /// A frame-producing source for animated images.
    Sequence(Arc<dyn FrameSource>),
}

/// One decoded image payload plus its reference count.
///
/// Buffers start with a count of zero; the decode step hands them to the
/// cache adapter which acquires on behalf of the cache slot, and every
/// [`Renderer`] acquires for its own lifetime. See the module documentation
/// for the lifetime protocol.
pub struct ImageBuffer {
    refcount: AtomicIsize,
    /// `None` once recycled. The mutex doubles as the single-execution
    /// guard around the free: whoever `take`s the payload is the one
    /// thread that drops it.
    payload: Mutex<Option<Payload>>,

    width: u32,
    height: u32,
    opaque: bool,
    frame_count: usize,
    byte_size: usize,
}

impl ImageBuffer {
    /// Wrap a single decoded surface.
    pub fn new_static(bitmap: Bitmap) -> Self {
        ImageBuffer {
            refcount: AtomicIsize::new(0),
            width: bitmap.width(),
            height: bitmap.height(),
            opaque: bitmap.is_opaque(),
            frame_count: 1,
            byte_size: bitmap.byte_size(),
            payload: Mutex::new(Some(Payload::Static(Arc::new(bitmap)))),
        }
    }

    /// Wrap a multi-frame source.
    pub fn new_animated(source: Arc<dyn FrameSource>) -> Self {
        ImageBuffer {
            refcount: AtomicIsize::new(0),
            width: source.width(),
            height: source.height(),
            opaque: source.is_opaque(),
            frame_count: source.frame_count(),
            byte_size: source.byte_size(),
            payload: Mutex::new(Some(Payload::Sequence(source))),
        }
    }

    /// Take a reference on the payload, keeping it away from recycling.
    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Return a reference taken with [`acquire`](Self::acquire).
    ///
    /// The release that brings the count to zero frees the payload before
    /// returning.
    pub fn release(&self) -> Result<(), BufferError> {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            // Roll the counter back so a later legitimate release still
            // sees a consistent value.
            self.refcount.fetch_add(1, Ordering::AcqRel);
            error!("release() without a matching acquire()");
            return Err(BufferError::Underflow);
        }
        if previous == 1 {
            self.free_payload();
        }
        Ok(())
    }

    /// Free the payload of an unreferenced buffer.
    ///
    /// This is the path for owners that never acquired a reference, e.g.
    /// decode code disposing of a buffer that was refused by the cache.
    /// Referenced buffers cannot be recycled directly; their payload is
    /// freed by the last [`release`](Self::release).
    pub fn recycle(&self) -> Result<(), BufferError> {
        // The payload lock is held across the check and the free:
        // create_renderer acquires under the same lock, so it cannot slip
        // a new reference in between.
        let mut payload = self.payload.lock().unwrap();
        if self.is_referenced() {
            error!("attempted to recycle a referenced buffer");
            return Err(BufferError::StillReferenced);
        }
        self.free_locked(&mut payload);
        Ok(())
    }

    fn free_payload(&self) {
        let mut payload = self.payload.lock().unwrap();
        self.free_locked(&mut payload);
    }

    fn free_locked(&self, payload: &mut Option<Payload>) {
        if payload.take().is_some() {
            debug!(
                "freed {}x{} payload ({} bytes)",
                self.width, self.height, self.byte_size
            );
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.refcount.load(Ordering::Acquire) != 0
    }

    pub fn is_recycled(&self) -> bool {
        self.payload.lock().unwrap().is_none()
    }

    /// Size of the payload in bytes, for cache accounting.
    pub fn byte_size(&self) -> Result<usize, BufferError> {
        if self.is_recycled() {
            return Err(BufferError::Recycled);
        }
        Ok(self.byte_size)
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

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn is_animated(&self) -> bool {
        self.frame_count > 1
    }

    /// Create a new [`Renderer`] over this buffer.
    ///
    /// The renderer holds one reference for its whole lifetime and returns
    /// it when recycled. For static payloads this only aliases the surface;
    /// for sequences it opens a private decode cursor and allocates the
    /// renderer's output surface.
    pub fn create_renderer(self: Arc<Self>) -> Result<Renderer, CreateRendererError> {
        let guard = self.payload.lock().unwrap();
        match guard.as_ref() {
            None => Err(CreateRendererError::Recycled),
            Some(Payload::Static(bitmap)) => {
                self.acquire();
                let bitmap = Arc::clone(bitmap);
                drop(guard);
                Ok(Renderer::new_static(self, bitmap))
            }
            Some(Payload::Sequence(source)) => {
                // Allocate before acquiring so a failed allocation leaves
                // the reference count untouched.
                let output = Bitmap::new(source.width(), source.height(), source.is_opaque())?;
                let cursor = Arc::clone(source).open_cursor();
                self.acquire();
                drop(guard);
                Ok(Renderer::new_sequence(self, cursor, output))
            }
        }
    }
}

impl std::fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frame_count", &self.frame_count)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("recycled", &self.is_recycled())
            .finish()
    }
}
