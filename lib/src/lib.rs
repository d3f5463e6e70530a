//! This library provides the resource model used to display decoded images
//! that are shared between a memory cache and any number of display surfaces:
//!
//! * The `buffer` module contains [`buffer::ImageBuffer`], a reference-counted
//!   decoded payload. It is the only object allowed to free pixel storage,
//!   which happens automatically when the last reference is released.
//!
//! * The `renderer` module contains [`renderer::Renderer`], a per-surface view
//!   onto a buffer's current frame. Several renderers can display the same
//!   buffer at independent animation positions.
//!
//! * The `drawable` module contains [`drawable::AnimatedDrawable`], which
//!   drives a renderer's frame advancement on a dedicated worker thread so
//!   the consuming thread never blocks on frame decoding.
//!
//! * The `cache` module bridges the reference-counting protocol to an
//!   external key/value memory cache through its add/evict hooks.
//!
//! The actual image codec is external and consumed through the traits of the
//! `codec` module.

pub mod buffer;
pub mod cache;
pub mod codec;
pub mod drawable;
pub mod renderer;

use thiserror::Error;

/// Error returned when pixel storage cannot be allocated.
///
/// Allocation failures are expected, recoverable events: a huge image must
/// result in a failed load, not in taking the process down.
#[derive(Debug, Error)]
#[error("cannot allocate pixel storage for a {width}x{height} surface")]
pub struct AllocError {
    pub width: u32,
    pub height: u32,
}

/// An owned RGBA8888 pixel surface.
///
/// This is the unit of pixel storage throughout the library: static buffers
/// wrap one, and every sequence renderer owns a private one it re-renders
/// frames into.
///
/// # Examples
///
/// ```
/// # use framecell::Bitmap;
/// let b = Bitmap::new(100, 50, true).unwrap();
/// assert_eq!(b.width(), 100);
/// assert_eq!(b.height(), 50);
/// assert_eq!(b.byte_size(), 100 * 50 * 4);
/// ```
pub struct Bitmap {
    width: u32,
    height: u32,
    opaque: bool,
    pixels: Vec<u32>,
}

impl Bitmap {
    /// Allocate a zeroed surface of the given dimensions.
    pub fn new(width: u32, height: u32, opaque: bool) -> Result<Self, AllocError> {
        let num_pixels = (width as usize)
            .checked_mul(height as usize)
            .ok_or(AllocError { width, height })?;

        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(num_pixels)
            .map_err(|_| AllocError { width, height })?;
        pixels.resize(num_pixels, 0);

        Ok(Bitmap {
            width,
            height,
            opaque,
            pixels,
        })
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

    /// Size of the pixel storage in bytes, as reported to the memory cache.
    pub fn byte_size(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<u32>()
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        &mut self.pixels
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("opaque", &self.opaque)
            .finish()
    }
}
