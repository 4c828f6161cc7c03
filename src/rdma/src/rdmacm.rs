//! Wrappers over the librdmacm connection-management surface: address
//! resolution, event channels, CM events, and communication identifiers.
//!
//! Ownership is deliberately split. `EventChannel` and `CmEvent` clean up
//! after themselves; `CmId` does not implement `Drop`, because a cm id is
//! torn down on one of two paths depending on which side created it (the
//! combined endpoint-destroy verb on the active side, QP-then-id on the
//! passive side) and the owner picks the path explicitly.
use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use socket2::SockAddr;

use crate::ffi;

#[derive(Debug, Clone, Copy)]
pub struct AddrInfoHints {
    pub flags: i32,
    pub family: i32,
    pub qp_type: i32,
    pub port_space: i32,
}

impl AddrInfoHints {
    /// Hints for an IPv4 reliable-connection endpoint in the TCP port space.
    pub fn reliable_ipv4(passive: bool) -> Self {
        AddrInfoHints {
            flags: if passive { ffi::RAI_PASSIVE as i32 } else { 0 },
            family: ffi::AF_INET as i32,
            qp_type: ffi::ibv_qp_type::IBV_QPT_RC as i32,
            port_space: ffi::rdma_port_space::RDMA_PS_TCP as i32,
        }
    }

    fn to_addrinfo(self) -> ffi::rdma_addrinfo {
        let mut ai: ffi::rdma_addrinfo = unsafe { mem::zeroed() };
        ai.ai_flags = self.flags;
        ai.ai_family = self.family;
        ai.ai_qp_type = self.qp_type;
        ai.ai_port_space = self.port_space;
        ai
    }
}

/// The resolved outcome of `rdma_getaddrinfo`, copied out of the C list so
/// no lifetime ties us to the library allocation.
#[derive(Debug)]
pub struct AddrInfo {
    pub src_addr: Option<SocketAddr>,
    pub dst_addr: Option<SocketAddr>,
}

/// # Safety
///
/// The caller must ensure that the address family and length match the type
/// of storage address.
unsafe fn sockaddr_from_raw(
    addr: *mut ffi::sockaddr,
    socklen: ffi::socklen_t,
) -> Option<SocketAddr> {
    if addr.is_null() || socklen == 0 {
        return None;
    }
    let ((), sockaddr) = SockAddr::init(|storage, len| {
        *len = socklen;
        std::ptr::copy_nonoverlapping(addr as *const u8, storage as *mut u8, socklen as usize);
        Ok(())
    })
    .ok()?;
    sockaddr.as_socket()
}

impl AddrInfo {
    pub fn getaddrinfo(
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&AddrInfoHints>,
    ) -> io::Result<AddrInfo> {
        let node = node.map(|s| CString::new(s).unwrap());
        let c_node = node.as_ref().map_or(ptr::null(), |s| s.as_ptr());
        let service = service.map(|s| CString::new(s).unwrap());
        let c_service = service.as_ref().map_or(ptr::null(), |s| s.as_ptr());
        let hints = hints.map(|h| h.to_addrinfo());
        let c_hints = hints.as_ref().map_or(ptr::null(), |h| h as *const _);
        let mut res = ptr::null_mut();
        let rc = unsafe { ffi::rdma_getaddrinfo(c_node, c_service, c_hints, &mut res) };
        match rc {
            0 => {
                assert!(!res.is_null());
                let a = unsafe { *res };
                let info = AddrInfo {
                    src_addr: unsafe { sockaddr_from_raw(a.ai_src_addr, a.ai_src_len) },
                    dst_addr: unsafe { sockaddr_from_raw(a.ai_dst_addr, a.ai_dst_len) },
                };
                unsafe { ffi::rdma_freeaddrinfo(res) };
                Ok(info)
            }
            -1 => Err(io::Error::last_os_error()),
            _ => Err(io::Error::from_raw_os_error(rc)),
        }
    }
}

#[repr(transparent)]
#[derive(Debug)]
pub struct EventChannel(*mut ffi::rdma_event_channel);

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl AsRawFd for EventChannel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.fd
    }
}

impl EventChannel {
    pub fn create() -> io::Result<Self> {
        let channel = unsafe { ffi::rdma_create_event_channel() };
        if channel.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(EventChannel(channel))
        }
    }

    #[inline]
    pub(crate) fn as_raw(&self) -> *mut ffi::rdma_event_channel {
        self.0
    }

    /// Blocking read of one CM event.
    pub fn get_cm_event(&self) -> io::Result<CmEvent> {
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(self.0, &mut event) };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(CmEvent(event))
        }
    }

    /// Non-blocking read of one CM event. `None` when the channel is empty.
    /// The channel must have been switched to non-blocking mode first.
    pub fn try_get_cm_event(&self) -> io::Result<Option<CmEvent>> {
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(self.0, &mut event) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(CmEvent(event)))
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut flags = unsafe { libc::fcntl(self.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if nonblocking {
            flags |= libc::O_NONBLOCK;
        } else {
            flags &= !libc::O_NONBLOCK;
        }
        let rc = unsafe { libc::fcntl(self.as_raw_fd(), libc::F_SETFL, flags) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_event_channel(self.0) };
    }
}

/// One CM event. All events obtained from `rdma_get_cm_event` must be
/// released, with a one-to-one correspondence between successful gets and
/// acks; the ack happens on drop. Anything the caller needs past the ack
/// (private data in particular) must be copied out first.
#[repr(transparent)]
#[derive(Debug)]
pub struct CmEvent(*mut ffi::rdma_cm_event);

unsafe impl Send for CmEvent {}

impl Drop for CmEvent {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_ack_cm_event(self.0) };
        if rc != 0 {
            log::debug!(
                "an error occurred on ack_cm_event: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = unsafe { CStr::from_ptr(ffi::rdma_event_str((*self.0).event)) };
        write!(f, "{}", msg.to_string_lossy())
    }
}

impl CmEvent {
    #[inline]
    pub fn status(&self) -> i32 {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.status
    }

    #[inline]
    pub fn event(&self) -> ffi::rdma_cm_event_type::Type {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.event
    }

    /// The cm id this event refers to. For a connect request this is the
    /// newly created child id, not the listener.
    #[inline]
    pub fn id(&self) -> CmId {
        assert!(!self.0.is_null());
        let id = unsafe { &*self.0 }.id;
        assert!(!id.is_null());
        CmId(id)
    }

    /// A copy of the connection private data attached to this event, if the
    /// peer supplied any. Copied out because the bytes live in the event
    /// allocation, which is released on ack.
    pub fn private_data(&self) -> Vec<u8> {
        assert!(!self.0.is_null());
        let conn = unsafe { &(*self.0).param.conn };
        if conn.private_data.is_null() || conn.private_data_len == 0 {
            return Vec::new();
        }
        unsafe {
            std::slice::from_raw_parts(
                conn.private_data as *const u8,
                conn.private_data_len as usize,
            )
        }
        .to_vec()
    }
}

/// A communication identifier. A plain view with no `Drop`: see the module
/// docs for why destruction is explicit.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct CmId(pub(crate) *mut ffi::rdma_cm_id);

unsafe impl Send for CmId {}

impl CmId {
    /// Create an id bound to `channel`. The channel must outlive the id.
    pub fn create_id(channel: &EventChannel) -> io::Result<CmId> {
        let mut cm_id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            ffi::rdma_create_id(
                channel.as_raw(),
                &mut cm_id,
                ptr::null_mut(),
                ffi::rdma_port_space::RDMA_PS_TCP,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        assert!(!cm_id.is_null());
        Ok(CmId(cm_id))
    }

    #[inline]
    pub fn as_raw(&self) -> *mut ffi::rdma_cm_id {
        self.0
    }

    #[inline]
    pub fn qp(&self) -> *mut ffi::ibv_qp {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.qp
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        let qp = self.qp();
        assert!(!qp.is_null());
        unsafe { &*qp }.qp_num
    }

    #[inline]
    pub fn verbs(&self) -> *mut ffi::ibv_context {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.verbs
    }

    #[inline]
    pub fn recv_cq_channel(&self) -> *mut ffi::ibv_comp_channel {
        assert!(!self.0.is_null());
        unsafe { &*self.0 }.recv_cq_channel
    }

    pub fn bind_addr(&self, sockaddr: &SocketAddr) -> io::Result<()> {
        let addr = SockAddr::from(*sockaddr);
        let rc = unsafe { ffi::rdma_bind_addr(self.0, addr.as_ptr() as *mut _) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_listen(self.0, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn resolve_addr(&self, dst: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let addr = SockAddr::from(*dst);
        let rc = unsafe {
            ffi::rdma_resolve_addr(self.0, ptr::null_mut(), addr.as_ptr() as *mut _, timeout_ms)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn resolve_route(&self, timeout_ms: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_resolve_route(self.0, timeout_ms) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Create a QP on this id against `pd`. The QP becomes part of the id;
    /// whoever destroys the id is responsible for destroying the QP first
    /// (or using the combined endpoint-destroy verb).
    pub fn create_qp(
        &self,
        pd: *mut ffi::ibv_pd,
        qp_init_attr: &ffi::ibv_qp_init_attr,
    ) -> io::Result<()> {
        assert!(!self.0.is_null());
        let rc = unsafe {
            ffi::rdma_create_qp(self.0, pd, qp_init_attr as *const _ as *mut _)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn connect(&self, conn_param: &ffi::rdma_conn_param) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_connect(self.0, conn_param as *const _ as *mut _) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn accept(&self, conn_param: &ffi::rdma_conn_param) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_accept(self.0, conn_param as *const _ as *mut _) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn reject(&self, private_data: &[u8]) -> io::Result<()> {
        assert!(private_data.len() <= u8::MAX as usize);
        let rc = unsafe {
            ffi::rdma_reject(
                self.0,
                private_data.as_ptr() as *const _,
                private_data.len() as u8,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disconnect(&self) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_disconnect(self.0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Active-side teardown: the combined verb destroys the QP (if any) and
    /// the id in one call.
    pub fn destroy_ep(self) {
        assert!(!self.0.is_null());
        unsafe { ffi::rdma_destroy_ep(self.0) };
    }

    /// Passive-side teardown: the QP and the id were created separately and
    /// are destroyed separately, QP first.
    pub fn destroy_qp_then_id(self) {
        assert!(!self.0.is_null());
        unsafe { ffi::rdma_destroy_qp(self.0) };
        let rc = unsafe { ffi::rdma_destroy_id(self.0) };
        if rc != 0 {
            log::debug!(
                "error occurred when destroying cm_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }

    /// Teardown for an id that never got a QP (a listener, or a failed
    /// connect attempt).
    pub fn destroy_id(self) {
        assert!(!self.0.is_null());
        let rc = unsafe { ffi::rdma_destroy_id(self.0) };
        if rc != 0 {
            log::debug!(
                "error occurred when destroying cm_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Build an `rdma_conn_param`. Responder resources and initiator depth are
/// non-zero so remote atomics work on these connections.
pub fn conn_param(private_data: Option<&[u8]>) -> ffi::rdma_conn_param {
    let mut param: ffi::rdma_conn_param = unsafe { mem::zeroed() };
    if let Some(data) = private_data {
        assert!(data.len() <= u8::MAX as usize);
        param.private_data = data.as_ptr() as *const _;
        param.private_data_len = data.len() as u8;
    }
    param.responder_resources = 4;
    param.initiator_depth = 4;
    param.retry_count = 3;
    param.rnr_retry_count = 7;
    param
}
