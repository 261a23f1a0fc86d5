//! Typed views over register bytes.
//!
//! Register images arrive as plain byte slices: a segment buffer, or the
//! result of a cached read. These wrappers decode and encode the multi-byte
//! fields the drivers use (big-endian encoder counts, little-endian analog
//! and pulse values) without hand-written shifting at every call site.

#[macro_use]
mod macros;

/// Read-only view over register bytes.
#[derive(Clone, Copy)]
pub struct Registers<'a>(&'a [u8]);

impl<'a> Registers<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte at `offset`, or 0 when out of range.
    #[inline]
    pub fn u8_at(&self, offset: usize) -> u8 {
        self.0.get(offset).copied().unwrap_or(0)
    }

    register_getters!(u16, i16, u32, i32);
}

impl core::fmt::Debug for Registers<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registers").field("len", &self.0.len()).finish()
    }
}

/// Writable view over register bytes.
pub struct RegistersMut<'a>(&'a mut [u8]);

impl<'a> RegistersMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self(bytes)
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        &*self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn u8_at(&self, offset: usize) -> u8 {
        self.0.get(offset).copied().unwrap_or(0)
    }

    /// # Panics
    /// Panics if `offset >= len()`.
    #[inline]
    pub fn set_u8_at(&mut self, offset: usize, value: u8) {
        self.0[offset] = value;
    }

    register_getters!(u16, i16, u32, i32);
    register_setters!(u16, i16, u32, i32);
}

impl core::fmt::Debug for RegistersMut<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegistersMut")
            .field("len", &self.0.len())
            .finish()
    }
}
