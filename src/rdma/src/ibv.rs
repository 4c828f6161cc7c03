//! Thin wrappers over the verbs objects this crate actually owns or views.
//!
//! Queue pairs and completion queues are created and destroyed through the
//! connection-management layer, so the types here are either owned (the
//! protection domain) or borrowed views over pointers whose lifetime is
//! managed elsewhere.
use std::io;
use std::marker::PhantomData;
use std::ptr;

use thiserror::Error;

use api::AccessFlags;

use crate::ffi;

#[derive(Debug, Error)]
#[error("ibv_poll_cq returned a negative value")]
pub struct PollCqError;

/// An owned protection domain. All MRs and QPs of one endpoint hang off a
/// single domain; its lifetime is the endpoint's.
pub struct ProtectionDomain {
    pub(crate) pd: *mut ffi::ibv_pd,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl ProtectionDomain {
    /// # Safety
    ///
    /// `ctx` must be a live device context; the domain must be dropped
    /// before the context goes away.
    pub unsafe fn alloc(ctx: *mut ffi::ibv_context) -> io::Result<Self> {
        assert!(!ctx.is_null());
        let pd = ffi::ibv_alloc_pd(ctx);
        if pd.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ProtectionDomain { pd })
        }
    }

    #[inline]
    pub fn pd(&self) -> *mut ffi::ibv_pd {
        self.pd
    }

    #[inline]
    pub fn context(&self) -> *mut ffi::ibv_context {
        unsafe { &*self.pd }.context
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if rc != 0 {
            // A QP or MR still references the domain. That is a teardown
            // ordering bug in the caller, not a runtime condition.
            log::error!(
                "ibv_dealloc_pd failed: {}",
                io::Error::from_raw_os_error(rc)
            );
        }
    }
}

impl From<AccessFlags> for ffi::ibv_access_flags {
    fn from(access: AccessFlags) -> Self {
        let mut flags = ffi::ibv_access_flags(0);
        if access.contains(AccessFlags::LOCAL_WRITE) {
            flags |= ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
        }
        if access.contains(AccessFlags::REMOTE_WRITE) {
            flags |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
        }
        if access.contains(AccessFlags::REMOTE_READ) {
            flags |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        }
        if access.contains(AccessFlags::REMOTE_ATOMIC) {
            flags |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
        }
        flags
    }
}

/// A borrowed completion queue. Does not destroy the CQ on drop; the CQ
/// belongs to the queue pair it was created with.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct CompletionQueue<'res> {
    cq: *mut ffi::ibv_cq,
    _marker: PhantomData<&'res ()>,
}

impl<'res> CompletionQueue<'res> {
    /// # Safety
    ///
    /// `cq` must stay valid for `'res`.
    pub unsafe fn from_raw(cq: *mut ffi::ibv_cq) -> Self {
        assert!(!cq.is_null());
        CompletionQueue {
            cq,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_raw(&self) -> *mut ffi::ibv_cq {
        self.cq
    }

    /// Drain up to `completions.len()` completions. `ibv_poll_cq` is a
    /// static-inline entry point, so the call goes through the context ops
    /// table.
    #[inline]
    pub fn poll<'c>(
        &self,
        completions: &'c mut [ffi::ibv_wc],
    ) -> Result<&'c mut [ffi::ibv_wc], PollCqError> {
        let n = unsafe {
            let ctx = (*self.cq).context;
            let poll_cq = (*ctx).ops.poll_cq.as_ref().expect("poll_cq op");
            poll_cq(
                self.cq,
                completions.len() as i32,
                completions.as_mut_ptr() as *mut _,
            )
        };
        if n < 0 {
            Err(PollCqError)
        } else {
            Ok(&mut completions[..n as usize])
        }
    }

    /// Arm the CQ for the event channel. The verbs contract is return-zero;
    /// anything else is a programmer error on an init path.
    pub fn req_notify(&self, solicited_only: bool) {
        let rc = unsafe {
            let ctx = (*self.cq).context;
            let req_notify = (*ctx).ops.req_notify_cq.as_ref().expect("req_notify_cq op");
            req_notify(self.cq, solicited_only as i32)
        };
        assert_eq!(
            rc,
            0,
            "ibv_req_notify_cq failed: {}",
            io::Error::from_raw_os_error(rc)
        );
    }
}

/// Block on the completion channel until a CQ posts an event. Returns the
/// CQ that fired; the caller must acknowledge it with [`ack_cq_events`].
///
/// # Safety
///
/// `channel` must be a live completion channel.
pub unsafe fn get_cq_event<'res>(
    channel: *mut ffi::ibv_comp_channel,
) -> io::Result<CompletionQueue<'res>> {
    assert!(!channel.is_null());
    let mut cq = ptr::null_mut();
    let mut cq_ctx = ptr::null_mut();
    let rc = ffi::ibv_get_cq_event(channel, &mut cq, &mut cq_ctx);
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(CompletionQueue::from_raw(cq))
}

pub fn ack_cq_events(cq: CompletionQueue<'_>, nevents: u32) {
    unsafe { ffi::ibv_ack_cq_events(cq.as_raw(), nevents) };
}
