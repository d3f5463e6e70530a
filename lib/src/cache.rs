//! Bridge between [`ImageBuffer`] reference counting and an external
//! key/value memory cache.
//!
//! The loader pipeline that fetches bytes and the memory cache that stores
//! decoded values are external collaborators. They drive this module
//! through the [`ValueHelper`] contract: the cache calls `decode` when
//! bytes arrive, `size_of` for accounting, and the add/remove hooks as
//! entries enter and leave memory. The hooks translate 1:1 into reference
//! operations, so an entry evicted while a renderer still displays it
//! simply loses the cache's reference and the payload survives until that
//! renderer recycles.
//!
//! There is no process-wide instance: build an [`ImageValueHelper`] with
//! [`Builder`] and hand it to the cache that needs it.

use std::io::Read;
use std::sync::Arc;

use log::{error, warn};

use crate::buffer::ImageBuffer;
use crate::codec::Codec;
use crate::Bitmap;

/// Admission policy hook. Returning `false` keeps a decoded value out of
/// the memory cache.
pub trait AdmitPolicy: Fn(&str, &ImageBuffer) -> bool + Send + Sync + 'static {}
impl<F> AdmitPolicy for F where F: Fn(&str, &ImageBuffer) -> bool + Send + Sync + 'static {}

/// The decode/size/add/remove contract an external memory cache consumes.
///
/// The cache guarantees it calls `on_add` at most once per successful
/// insert, `on_remove` exactly once per eviction of an added entry, and
/// never calls `size_of` on an evicted entry.
pub trait ValueHelper {
    /// Decode a byte stream into a buffer, or `None` on any decode
    /// failure. Never panics for malformed input.
    fn decode(&self, reader: &mut dyn Read) -> Option<Arc<ImageBuffer>>;

    /// Size in bytes the entry accounts for in the cache.
    fn size_of(&self, key: &str, value: &ImageBuffer) -> usize;

    /// The cache stored `value`; it now holds one reference.
    fn on_add(&self, key: &str, value: &ImageBuffer);

    /// The cache evicted `value`; its reference is returned. The payload
    /// is freed here if nobody else holds one.
    fn on_remove(&self, key: &str, value: &ImageBuffer);

    /// Whether `value` should enter the memory cache at all.
    fn admit(&self, key: &str, value: &ImageBuffer) -> bool;
}

/// One-time builder for [`ImageValueHelper`], consumed by
/// [`build`](Builder::build).
pub struct Builder<C: Codec> {
    codec: C,
    admit: Option<Box<dyn AdmitPolicy>>,
}

impl<C: Codec> Builder<C> {
    pub fn new(codec: C) -> Self {
        Builder { codec, admit: None }
    }

    /// Replace the default admit-everything policy.
    pub fn admit_policy(mut self, policy: impl AdmitPolicy) -> Self {
        self.admit = Some(Box::new(policy));
        self
    }

    pub fn build(self) -> ImageValueHelper<C> {
        ImageValueHelper {
            codec: self.codec,
            admit: self.admit,
        }
    }
}

/// [`ValueHelper`] implementation producing [`ImageBuffer`]s.
///
/// Decoding classifies the payload once: single-frame images are rendered
/// eagerly into a plain surface and stored as static buffers (no second
/// surface ever gets allocated for them), while multi-frame images keep
/// their frame source and render lazily, per renderer.
pub struct ImageValueHelper<C: Codec> {
    codec: C,
    admit: Option<Box<dyn AdmitPolicy>>,
}

impl<C: Codec> ValueHelper for ImageValueHelper<C> {
    fn decode(&self, reader: &mut dyn Read) -> Option<Arc<ImageBuffer>> {
        let source = match self.codec.decode(reader) {
            Ok(source) => source,
            Err(e) => {
                warn!("image decode failed: {}", e);
                return None;
            }
        };

        if source.frame_count() > 1 {
            return Some(Arc::new(ImageBuffer::new_animated(source)));
        }

        // Static image: materialize the single frame now and drop the
        // decode source with this scope.
        let mut bitmap = match Bitmap::new(source.width(), source.height(), source.is_opaque()) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let mut cursor = Arc::clone(&source).open_cursor();
        cursor.reset();
        if let Err(e) = cursor.render_into(&mut bitmap) {
            warn!("failed to render static image: {}", e);
            return None;
        }
        Some(Arc::new(ImageBuffer::new_static(bitmap)))
    }

    fn size_of(&self, key: &str, value: &ImageBuffer) -> usize {
        value.byte_size().unwrap_or_else(|e| {
            // The cache broke its contract by asking about an evicted
            // entry.
            error!("size_of({}) on a recycled buffer: {}", key, e);
            0
        })
    }

    fn on_add(&self, _key: &str, value: &ImageBuffer) {
        value.acquire();
    }

    fn on_remove(&self, key: &str, value: &ImageBuffer) {
        // The last release frees the payload; no explicit recycle here.
        if let Err(e) = value.release() {
            error!("cache released {} more times than it added: {}", key, e);
        }
    }

    fn admit(&self, key: &str, value: &ImageBuffer) -> bool {
        match &self.admit {
            Some(policy) => policy(key, value),
            None => true,
        }
    }
}
