//! Connection-management endpoints. An [`ActiveEndpoint`] resolves, creates
//! a queue pair, and connects out; a [`PassiveEndpoint`] listens and accepts.
//! Both own the event channel and the protection domain shared by their
//! connections.
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use api::{private_data, RemoteBuffer};

use crate::connection::{Connection, QueueType};
use crate::ffi;
use crate::ibv::ProtectionDomain;
use crate::rdmacm::{conn_param, AddrInfo, AddrInfoHints, CmId, EventChannel};
use crate::sge::ScatterGatherList;

pub const LISTEN_BACKLOG: i32 = 128;
/// CM timeout for address and route resolution.
const CM_TIMEOUT_MS: i32 = 2000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("address resolution failed: {0}")]
    AddressResolutionFailed(io::Error),
    #[error("endpoint creation failed: {0}")]
    EndpointCreationFailed(io::Error),
    #[error("queue pair creation failed: {0}")]
    QueuePairCreationFailed(io::Error),
    #[error("connection management error: {0}")]
    Cm(io::Error),
    #[error("unexpected CM event: {0}")]
    UnexpectedEvent(String),
    #[error("malformed private data: {0}")]
    PrivateData(#[from] api::DecodeError),
}

/// Queue-pair dimensions negotiated at creation time.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub send_queue_depth: u32,
    pub recv_queue_depth: u32,
    pub max_sge: u32,
    pub max_inline_data: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            send_queue_depth: 64,
            recv_queue_depth: 64,
            max_sge: crate::sge::MAX_SGE as u32,
            max_inline_data: 64,
        }
    }
}

impl EndpointConfig {
    fn qp_init_attr(&self) -> ffi::ibv_qp_init_attr {
        let mut attr: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        attr.cap.max_send_wr = self.send_queue_depth;
        attr.cap.max_recv_wr = self.recv_queue_depth;
        attr.cap.max_send_sge = self.max_sge;
        attr.cap.max_recv_sge = self.max_sge;
        attr.cap.max_inline_data = self.max_inline_data;
        attr.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 0;
        attr
    }
}

/// Decode a peer's private-data block, tolerating its absence: transports
/// pad private data, so a peer that attached nothing shows up as garbage
/// and is treated as "no descriptors".
fn decode_peer_buffers(data: &[u8]) -> Vec<(u32, RemoteBuffer)> {
    match private_data::decode(data) {
        Ok(buffers) => buffers,
        Err(e) => {
            log::debug!("peer attached no usable private data: {}", e);
            Vec::new()
        }
    }
}

pub struct ActiveEndpoint {
    addr: SocketAddr,
    config: EndpointConfig,
    channel: Option<EventChannel>,
    id: Option<CmId>,
    pd: Option<ProtectionDomain>,
    connection: Option<Connection>,
    peer_buffers: Vec<(u32, RemoteBuffer)>,
}

impl ActiveEndpoint {
    pub fn new(ip: &str, port: u16, config: EndpointConfig) -> Result<Self, Error> {
        let hints = AddrInfoHints::reliable_ipv4(false);
        let info = AddrInfo::getaddrinfo(Some(ip), Some(&port.to_string()), Some(&hints))
            .map_err(Error::AddressResolutionFailed)?;
        let addr = info.dst_addr.ok_or_else(|| {
            Error::AddressResolutionFailed(io::Error::new(
                io::ErrorKind::Other,
                "no destination address resolved",
            ))
        })?;
        Ok(ActiveEndpoint {
            addr,
            config,
            channel: None,
            id: None,
            pd: None,
            connection: None,
            peer_buffers: Vec::new(),
        })
    }

    /// Resolve the address and route, then create the queue pair and the
    /// protection domain it lives in.
    pub fn allocate(&mut self) -> Result<(), Error> {
        let channel = EventChannel::create().map_err(Error::EndpointCreationFailed)?;
        let id = CmId::create_id(&channel).map_err(Error::EndpointCreationFailed)?;

        id.resolve_addr(&self.addr, CM_TIMEOUT_MS)
            .map_err(Error::AddressResolutionFailed)?;
        Self::expect_event(
            &channel,
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED,
        )
        .map_err(|e| {
            id.destroy_id();
            e
        })?;

        id.resolve_route(CM_TIMEOUT_MS)
            .map_err(Error::AddressResolutionFailed)?;
        Self::expect_event(
            &channel,
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED,
        )
        .map_err(|e| {
            id.destroy_id();
            e
        })?;

        let pd = unsafe { ProtectionDomain::alloc(id.verbs()) }.map_err(|e| {
            id.destroy_id();
            Error::EndpointCreationFailed(e)
        })?;
        id.create_qp(pd.pd(), &self.config.qp_init_attr())
            .map_err(|e| {
                id.destroy_id();
                Error::QueuePairCreationFailed(e)
            })?;

        self.channel = Some(channel);
        self.id = Some(id);
        self.pd = Some(pd);
        Ok(())
    }

    fn expect_event(
        channel: &EventChannel,
        expected: ffi::rdma_cm_event_type::Type,
    ) -> Result<(), Error> {
        let event = channel.get_cm_event().map_err(Error::Cm)?;
        if event.event() == expected && event.status() == 0 {
            Ok(())
        } else if event.status() != 0 {
            Err(Error::AddressResolutionFailed(io::Error::from_raw_os_error(
                event.status().abs(),
            )))
        } else {
            Err(Error::UnexpectedEvent(event.to_string()))
        }
    }

    /// Drive the CM state machine to `Established`, advertising
    /// `descriptors` in the request private data and capturing whatever the
    /// peer advertises back. `Ok(false)` means the peer rejected the
    /// connection or was unreachable; the endpoint remains valid for reuse
    /// of its teardown path.
    pub fn connect(&mut self, descriptors: &[(u32, RemoteBuffer)]) -> Result<bool, Error> {
        let id = self.id.expect("allocate() must succeed before connect()");
        let payload = private_data::encode(descriptors)?;
        let param = conn_param(Some(&payload));
        id.connect(&param).map_err(Error::Cm)?;

        let channel = self.channel.as_ref().expect("allocated");
        let event = channel.get_cm_event().map_err(Error::Cm)?;
        match event.event() {
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                self.peer_buffers = decode_peer_buffers(&event.private_data());
                drop(event);
                self.connection = Some(Connection::new(id, false));
                self.id = None;
                Ok(true)
            }
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_REJECTED
            | ffi::rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE
            | ffi::rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => {
                log::warn!("connection attempt to {} failed: {}", self.addr, event);
                Ok(false)
            }
            _ => Err(Error::UnexpectedEvent(event.to_string())),
        }
    }

    pub fn pd(&self) -> &ProtectionDomain {
        self.pd.as_ref().expect("endpoint not allocated")
    }

    pub fn qp(&self) -> *mut ffi::ibv_qp {
        match (&self.connection, self.id) {
            (Some(connection), _) => connection.qp(),
            (None, Some(id)) => id.qp(),
            (None, None) => std::ptr::null_mut(),
        }
    }

    pub fn connection(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("endpoint not connected")
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Descriptors the peer advertised during connection establishment.
    pub fn peer_buffers(&self) -> &[(u32, RemoteBuffer)] {
        &self.peer_buffers
    }

    pub fn peer_buffer(&self, tag: u32) -> Option<RemoteBuffer> {
        self.peer_buffers
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, buf)| *buf)
    }

    pub fn post_recv(
        &mut self,
        elems: &ScatterGatherList,
        id: Option<u64>,
        count: usize,
    ) -> Result<u64, crate::connection::Error> {
        self.connection().post_recv(elems, id, count)
    }

    pub fn post_write(
        &mut self,
        elems: &ScatterGatherList,
        remote: &RemoteBuffer,
        force_inline: bool,
    ) -> Result<u64, crate::connection::Error> {
        self.connection().post_write(elems, remote, force_inline)
    }

    pub fn post_cas(
        &mut self,
        elems: &ScatterGatherList,
        remote: &RemoteBuffer,
        compare: u64,
        swap: u64,
    ) -> Result<u64, crate::connection::Error> {
        self.connection().post_cas(elems, remote, compare, swap)
    }
}

impl Drop for ActiveEndpoint {
    fn drop(&mut self) {
        // Connection first (it owns the qp and id), then the domain, then
        // the event channel the id was bound to.
        self.connection.take();
        if let Some(id) = self.id.take() {
            id.destroy_ep();
        }
        self.pd.take();
        self.channel.take();
    }
}

/// A connection accepted but not yet promoted by an `Established` event.
struct PendingConnection {
    id: CmId,
    peer_buffers: Vec<(u32, RemoteBuffer)>,
}

/// What a single CM poll step observed.
pub enum EndpointEvent {
    /// A connect request was answered with `accept_payload`. The caller can
    /// commit whatever state that payload advertised to this queue-pair
    /// number before the connection surfaces as `Established`.
    Requested { qp_num: u32 },
    /// A connection reached `Established` and is ready for use. Ownership
    /// moves to the caller; the endpoint keeps no reference.
    Established {
        connection: Connection,
        peer_buffers: Vec<(u32, RemoteBuffer)>,
    },
    /// The peer with this queue-pair number went away. The caller drops its
    /// `Connection` to complete the teardown; for a connection that never
    /// reached `Established` the endpoint has already torn it down.
    Disconnected { qp_num: u32 },
}

pub struct PassiveEndpoint {
    addr: SocketAddr,
    config: EndpointConfig,
    channel: Option<EventChannel>,
    listen_id: Option<CmId>,
    pd: Option<ProtectionDomain>,
    pending: Vec<PendingConnection>,
}

impl PassiveEndpoint {
    pub fn new(ip: &str, port: u16, config: EndpointConfig) -> Result<Self, Error> {
        let hints = AddrInfoHints::reliable_ipv4(true);
        let info = AddrInfo::getaddrinfo(Some(ip), Some(&port.to_string()), Some(&hints))
            .map_err(Error::AddressResolutionFailed)?;
        let addr = info.src_addr.ok_or_else(|| {
            Error::AddressResolutionFailed(io::Error::new(
                io::ErrorKind::Other,
                "no source address resolved",
            ))
        })?;
        Ok(PassiveEndpoint {
            addr,
            config,
            channel: None,
            listen_id: None,
            pd: None,
            pending: Vec::new(),
        })
    }

    /// Create the event channel, bind, and listen. The channel is switched
    /// to non-blocking so [`poll_events`](Self::poll_events) is a true
    /// single step.
    pub fn allocate(&mut self) -> Result<(), Error> {
        let channel = EventChannel::create().map_err(Error::EndpointCreationFailed)?;
        channel
            .set_nonblocking(true)
            .map_err(Error::EndpointCreationFailed)?;
        let listen_id = CmId::create_id(&channel).map_err(Error::EndpointCreationFailed)?;
        listen_id
            .bind_addr(&self.addr)
            .map_err(Error::AddressResolutionFailed)?;
        listen_id
            .listen(LISTEN_BACKLOG)
            .map_err(Error::EndpointCreationFailed)?;
        let pd = unsafe { ProtectionDomain::alloc(listen_id.verbs()) }
            .map_err(Error::EndpointCreationFailed)?;

        self.channel = Some(channel);
        self.listen_id = Some(listen_id);
        self.pd = Some(pd);
        log::info!("listening on {}", self.addr);
        Ok(())
    }

    pub fn pd(&self) -> &ProtectionDomain {
        self.pd.as_ref().expect("endpoint not allocated")
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// One non-blocking step of the CM state machine.
    ///
    /// A connect request is answered immediately: a queue pair is created
    /// against the shared protection domain and the connection is accepted
    /// with `accept_payload` as the reply private data. The connection
    /// surfaces once its `Established` event arrives. Events that concern
    /// nobody are consumed silently.
    pub fn poll_events(
        &mut self,
        accept_payload: &[(u32, RemoteBuffer)],
    ) -> Result<Option<EndpointEvent>, Error> {
        let payload = private_data::encode(accept_payload)?;
        let channel = self.channel.as_ref().expect("endpoint not allocated");
        let event = match channel.try_get_cm_event().map_err(Error::Cm)? {
            Some(event) => event,
            None => return Ok(None),
        };
        match event.event() {
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                let id = event.id();
                let peer_buffers = decode_peer_buffers(&event.private_data());
                if let Err(e) = id.create_qp(self.pd().pd(), &self.config.qp_init_attr()) {
                    log::error!("queue pair creation for incoming connection failed: {}", e);
                    let _ = id.reject(&[]);
                    // The event must be acked before the id can go away.
                    drop(event);
                    id.destroy_id();
                    return Err(Error::QueuePairCreationFailed(e));
                }
                if let Err(e) = id.accept(&conn_param(Some(&payload))) {
                    log::error!("rdma_accept failed: {}", e);
                    drop(event);
                    id.destroy_qp_then_id();
                    return Err(Error::Cm(e));
                }
                let qp_num = id.qp_num();
                self.pending.push(PendingConnection { id, peer_buffers });
                Ok(Some(EndpointEvent::Requested { qp_num }))
            }
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                let id_ptr = event.id().as_raw();
                match self
                    .pending
                    .iter()
                    .position(|p| p.id.as_raw() == id_ptr)
                {
                    Some(index) => {
                        let pending = self.pending.swap_remove(index);
                        drop(event);
                        Ok(Some(EndpointEvent::Established {
                            connection: Connection::new(pending.id, true),
                            peer_buffers: pending.peer_buffers,
                        }))
                    }
                    None => {
                        log::warn!("established event for an unknown connection");
                        Ok(None)
                    }
                }
            }
            ffi::rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => {
                let id = event.id();
                if let Some(index) = self
                    .pending
                    .iter()
                    .position(|p| p.id.as_raw() == id.as_raw())
                {
                    // Never promoted; tear it down here but still report
                    // the disappearance so the caller can roll back state
                    // committed at request time.
                    let pending = self.pending.swap_remove(index);
                    let qp_num = pending.id.qp_num();
                    drop(event);
                    pending.id.destroy_qp_then_id();
                    return Ok(Some(EndpointEvent::Disconnected { qp_num }));
                }
                let qp = id.qp();
                let qp_num = if qp.is_null() {
                    0
                } else {
                    unsafe { &*qp }.qp_num
                };
                Ok(Some(EndpointEvent::Disconnected { qp_num }))
            }
            _ => {
                log::debug!("consumed CM event: {}", event);
                Ok(None)
            }
        }
    }

    pub fn post_send(
        &self,
        conn: &mut Connection,
        elems: &ScatterGatherList,
    ) -> Result<u64, crate::connection::Error> {
        conn.post_send(elems, None, false)
    }

    pub fn post_recv(
        &self,
        conn: &mut Connection,
        elems: &ScatterGatherList,
    ) -> Result<u64, crate::connection::Error> {
        conn.post_recv(elems, None, 1)
    }

    pub fn poll_wc<'c>(
        &self,
        conn: &'c mut Connection,
        queue: QueueType,
        blocking: bool,
    ) -> Result<&'c [ffi::ibv_wc], crate::connection::Error> {
        conn.poll_wc(queue, blocking)
    }
}

impl Drop for PassiveEndpoint {
    fn drop(&mut self) {
        // Pending connections, then the listener, then the event channel,
        // then the protection domain.
        for pending in self.pending.drain(..) {
            pending.id.destroy_qp_then_id();
        }
        if let Some(listen_id) = self.listen_id.take() {
            listen_id.destroy_id();
        }
        self.channel.take();
        self.pd.take();
    }
}
