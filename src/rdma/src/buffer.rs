//! Pinned, registrable memory. A [`Buffer`] owns a page-aligned anonymous
//! mapping and, once registered with a protection domain, the memory region
//! the NIC uses to validate local and remote access to it.
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use thiserror::Error;

use api::{AccessFlags, RemoteBuffer};

use crate::ffi;
use crate::ibv::ProtectionDomain;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory mapping {0} bytes")]
    OutOfMemory(usize),
    #[error("mmap failed: {0}")]
    MmapFailed(nix::Error),
    #[error("memory registration failed: {0}")]
    RegistrationFailed(io::Error),
    #[error("buffer is already registered with a different domain or access")]
    AlreadyRegistered,
    #[error("buffer is not registered")]
    NotRegistered,
}

/// A pinned array of `count` elements of `T`, optionally registered as a
/// memory region. The base address and length never change after
/// allocation; registration can happen at most once.
pub struct Buffer<T> {
    ptr: *mut libc::c_void,
    bytes: usize,
    count: usize,
    mr: *mut ffi::ibv_mr,
    registered_with: Option<(*mut ffi::ibv_pd, AccessFlags)>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Buffer<T> {}

impl<T> Buffer<T> {
    pub fn allocate(count: usize) -> Result<Self, Error> {
        Self::allocate_with(count, false)
    }

    /// Anonymous private mapping; `huge_pages` asks the kernel for a
    /// hugetlb backing (the process must run with `RDMAV_HUGEPAGES_SAFE=1`
    /// for the verbs library to accept such regions).
    pub fn allocate_with(count: usize, huge_pages: bool) -> Result<Self, Error> {
        let bytes = count * mem::size_of::<T>();
        assert!(bytes > 0, "zero-sized buffer");
        let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        if huge_pages {
            flags |= MapFlags::MAP_HUGETLB;
        }
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                bytes,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
                -1,
                0,
            )
        }
        .map_err(|e| match e {
            nix::Error::ENOMEM => Error::OutOfMemory(bytes),
            other => Error::MmapFailed(other),
        })?;
        Ok(Buffer {
            ptr,
            bytes,
            count,
            mr: ptr::null_mut(),
            registered_with: None,
            _marker: PhantomData,
        })
    }

    /// Register the whole range with `pd`. Calling again with the same
    /// domain and access is a no-op; anything else fails.
    pub fn register(&mut self, pd: &ProtectionDomain, access: AccessFlags) -> Result<(), Error> {
        if let Some((prev_pd, prev_access)) = self.registered_with {
            return if prev_pd == pd.pd() && prev_access == access {
                Ok(())
            } else {
                Err(Error::AlreadyRegistered)
            };
        }
        let raw_access = ffi::ibv_access_flags::from(access);
        let mr = unsafe {
            ffi::ibv_reg_mr(pd.pd(), self.ptr, self.bytes, raw_access.0 as i32)
        };
        if mr.is_null() {
            return Err(Error::RegistrationFailed(io::Error::last_os_error()));
        }
        self.mr = mr;
        self.registered_with = Some((pd.pd(), access));
        Ok(())
    }

    #[inline]
    pub fn ptr(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr as *mut T
    }

    /// Element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn lkey(&self) -> Result<u32, Error> {
        if self.mr.is_null() {
            return Err(Error::NotRegistered);
        }
        Ok(unsafe { &*self.mr }.lkey)
    }

    pub fn rkey(&self) -> Result<u32, Error> {
        if self.mr.is_null() {
            return Err(Error::NotRegistered);
        }
        Ok(unsafe { &*self.mr }.rkey)
    }

    /// The descriptor a peer needs to target this buffer with one-sided
    /// operations.
    pub fn remote_descriptor(&self) -> Result<RemoteBuffer, Error> {
        Ok(RemoteBuffer::new(self.ptr(), self.rkey()?, self.bytes as u32))
    }

    pub fn data(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr as *const T, self.count) }
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut T, self.count) }
    }

    /// Reinterpret the byte range as a slice of `U`. The range must divide
    /// evenly.
    pub fn view_as<U: Copy>(&self) -> &[U] {
        assert_eq!(self.bytes % mem::size_of::<U>(), 0);
        unsafe { slice::from_raw_parts(self.ptr as *const U, self.bytes / mem::size_of::<U>()) }
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        if !self.mr.is_null() {
            let rc = unsafe { ffi::ibv_dereg_mr(self.mr) };
            if rc != 0 {
                let e = io::Error::from_raw_os_error(rc);
                panic!("ibv_dereg_mr: {}", e);
            }
        }
        unsafe {
            munmap(self.ptr, self.bytes)
                .unwrap_or_else(|e| log::error!("failed to munmap: {}", e));
        }
    }
}

/// A buffer the remote NIC may overwrite at any time after registration
/// with remote-write access. Reads return copies; the caller is expected to
/// observe a synchronizing completion (a write-with-immediate or a
/// round-trip) before trusting the bytes.
pub struct RemoteWritable<T: Copy> {
    buf: Buffer<T>,
}

impl<T: Copy> RemoteWritable<T> {
    /// Wraps a buffer already registered with remote-write access.
    pub fn new(buf: Buffer<T>) -> Result<Self, Error> {
        match buf.registered_with {
            Some((_, access)) if access.contains(AccessFlags::REMOTE_WRITE) => {
                Ok(RemoteWritable { buf })
            }
            Some(_) => Err(Error::AlreadyRegistered),
            None => Err(Error::NotRegistered),
        }
    }

    /// Copy out element `index`. Volatile: the compiler must not assume the
    /// bytes are stable across reads.
    pub fn read(&self, index: usize) -> T {
        assert!(index < self.buf.len());
        unsafe { ptr::read_volatile(self.buf.as_ptr().add(index) as *const T) }
    }

    /// Copy out `len` elements starting at `index`.
    pub fn read_slice(&self, index: usize, len: usize) -> Vec<T> {
        assert!(index + len <= self.buf.len());
        (index..index + len).map(|i| self.read(i)).collect()
    }

    #[inline]
    pub fn inner(&self) -> &Buffer<T> {
        &self.buf
    }

    pub fn remote_descriptor(&self) -> Result<RemoteBuffer, Error> {
        self.buf.remote_descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_page_aligned() {
        let buf: Buffer<u64> = Buffer::allocate(16).unwrap();
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        assert_eq!(buf.ptr() % page, 0);
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.byte_len(), 128);
    }

    #[test]
    fn data_roundtrip() {
        let mut buf: Buffer<u32> = Buffer::allocate(8).unwrap();
        for (i, slot) in buf.data_mut().iter_mut().enumerate() {
            *slot = i as u32 * 3;
        }
        assert_eq!(buf.data()[7], 21);
        assert_eq!(buf.view_as::<u8>().len(), 32);
    }

    #[test]
    fn keys_require_registration() {
        let buf: Buffer<u8> = Buffer::allocate(64).unwrap();
        assert!(matches!(buf.lkey(), Err(Error::NotRegistered)));
        assert!(matches!(buf.rkey(), Err(Error::NotRegistered)));
    }

    #[test]
    fn remote_writable_requires_registration() {
        let buf: Buffer<u8> = Buffer::allocate(64).unwrap();
        assert!(matches!(
            RemoteWritable::new(buf),
            Err(Error::NotRegistered)
        ));
    }
}
