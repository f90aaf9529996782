//! Shared signal memory.
//!
//! `SharedBuffer` is a fixed-size byte area that any number of threads may
//! read and write concurrently without locks. Every access is bounds checked
//! and reported through `CopyError` instead of touching memory out of range.
//! Cross-thread visibility is established by the Release/Acquire pair on the
//! data source's active buffer index, so bytes are accessed with `Relaxed`.

#![forbid(unsafe_code)]

use crate::error::CopyError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

pub struct SharedBuffer {
    bytes: Box<[AtomicU8]>,
}

impl SharedBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            bytes: data.iter().map(|&b| AtomicU8::new(b)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    fn span(&self, offset: usize, len: usize) -> Result<&[AtomicU8], CopyError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(CopyError::OutOfBounds {
                offset,
                len,
                capacity: self.bytes.len(),
            })
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    #[inline]
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<(), CopyError> {
        let src = self.span(offset, dst.len())?;
        for (d, s) in dst.iter_mut().zip(src) {
            *d = s.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy `src` into this buffer starting at `offset`.
    #[inline]
    pub fn write_from(&self, offset: usize, src: &[u8]) -> Result<(), CopyError> {
        let dst = self.span(offset, src.len())?;
        for (d, &s) in dst.iter().zip(src) {
            d.store(s, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Buffer-to-buffer copy. Both ranges are validated before any byte moves.
    #[inline]
    pub fn copy_to(
        &self,
        src_offset: usize,
        dst: &SharedBuffer,
        dst_offset: usize,
        len: usize,
    ) -> Result<(), CopyError> {
        let src = self.span(src_offset, len)?;
        let dst = dst.span(dst_offset, len)?;
        for (d, s) in dst.iter().zip(src) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn fill(&self, value: u8) {
        for b in self.bytes.iter() {
            b.store(value, Ordering::Relaxed);
        }
    }

    /// Copy of the whole content. Allocates; not for the real-time path.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}
