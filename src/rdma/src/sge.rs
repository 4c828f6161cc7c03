//! Scatter-gather lists for a single work request.
use thiserror::Error;

use crate::buffer::{self, Buffer};
use crate::ffi;

/// Verbs caps `num_sge` per WR well above this, but nothing in this system
/// gathers from more than a handful of regions.
pub const MAX_SGE: usize = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("scatter-gather list is full ({MAX_SGE} entries)")]
    TooManyEntries,
    #[error("range {offset}+{length} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        size: usize,
    },
    #[error(transparent)]
    Buffer(#[from] buffer::Error),
}

/// An ordered list of `(addr, length, lkey)` entries built from registered
/// buffers.
#[derive(Debug, Default, Clone)]
pub struct ScatterGatherList {
    sges: Vec<ffi::ibv_sge>,
}

impl ScatterGatherList {
    pub fn new() -> Self {
        ScatterGatherList::default()
    }

    /// One entry covering a whole buffer.
    pub fn from_buffer<T>(buf: &Buffer<T>) -> Result<Self, Error> {
        let mut list = Self::new();
        list.add(buf)?;
        Ok(list)
    }

    pub fn add<T>(&mut self, buf: &Buffer<T>) -> Result<&mut Self, Error> {
        self.add_range(buf, 0, buf.byte_len())
    }

    /// Add `length` bytes of `buf` starting `offset` bytes in. A zero
    /// `length` is allowed; see [`effective_num_sge`](Self::effective_num_sge).
    pub fn add_range<T>(
        &mut self,
        buf: &Buffer<T>,
        offset: usize,
        length: usize,
    ) -> Result<&mut Self, Error> {
        if self.sges.len() == MAX_SGE {
            return Err(Error::TooManyEntries);
        }
        if offset + length > buf.byte_len() {
            return Err(Error::OutOfBounds {
                offset,
                length,
                size: buf.byte_len(),
            });
        }
        let lkey = buf.lkey()?;
        self.push_raw(buf.ptr() + offset as u64, length as u32, lkey);
        Ok(self)
    }

    fn push_raw(&mut self, addr: u64, length: u32, lkey: u32) {
        self.sges.push(ffi::ibv_sge { addr, length, lkey });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sges.is_empty()
    }

    /// Total payload bytes across all entries.
    pub fn byte_len(&self) -> usize {
        self.sges.iter().map(|sge| sge.length as usize).sum()
    }

    #[inline]
    pub(crate) fn array(&self) -> *mut ffi::ibv_sge {
        self.sges.as_ptr() as *mut _
    }

    /// The `num_sge` to put in a work request. A single zero-length entry
    /// collapses to zero: the verbs library treats that as a valid zero-byte
    /// transfer, which is how a pure immediate-data signal is expressed.
    #[inline]
    pub(crate) fn effective_num_sge(&self) -> i32 {
        if self.sges.len() == 1 && self.sges[0].length == 0 {
            0
        } else {
            self.sges.len() as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_are_checked_before_keys() {
        let buf: Buffer<u8> = Buffer::allocate(64).unwrap();
        let mut list = ScatterGatherList::new();
        assert!(matches!(
            list.add_range(&buf, 32, 64),
            Err(Error::OutOfBounds { .. })
        ));
        // In range but unregistered: the lkey lookup fails instead.
        assert!(matches!(
            list.add_range(&buf, 0, 64),
            Err(Error::Buffer(buffer::Error::NotRegistered))
        ));
    }

    #[test]
    fn zero_length_entry_collapses() {
        let mut list = ScatterGatherList::new();
        list.push_raw(0x1000, 0, 7);
        assert_eq!(list.len(), 1);
        assert_eq!(list.effective_num_sge(), 0);

        list.push_raw(0x2000, 8, 7);
        assert_eq!(list.effective_num_sge(), 2);
    }

    #[test]
    fn entry_cap() {
        let mut list = ScatterGatherList::new();
        for i in 0..MAX_SGE {
            list.push_raw(i as u64, 1, 0);
        }
        let buf: Buffer<u8> = Buffer::allocate(8).unwrap();
        assert!(matches!(list.add(&buf), Err(Error::TooManyEntries)));
    }
}
