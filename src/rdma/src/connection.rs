//! One established connection: a queue pair, its two completion queues, and
//! the typed post/poll surface over them.
use std::io;
use std::mem;
use std::ptr;

use thiserror::Error;

use api::RemoteBuffer;

use crate::buffer::Buffer;
use crate::ffi;
use crate::ibv::{self, CompletionQueue};
use crate::rdmacm::CmId;
use crate::sge::ScatterGatherList;

/// Length of the pre-built chain of empty receive work requests.
pub const RECV_BATCH: usize = 32;
/// Completions drained per poll call.
pub const WC_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Send,
    Recv,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("posting {verb} failed: {source}")]
    PostFailed {
        verb: &'static str,
        source: io::Error,
    },
    #[error("polling the {queue:?} completion queue failed")]
    PollFailed { queue: QueueType },
}

/// Which creation path produced the underlying cm id, and therefore which
/// teardown path applies. Active ids go through the combined
/// endpoint-destroy verb; passive ids destroy the QP and the id separately.
enum ConnectionHandle {
    Active(CmId),
    Passive(CmId),
}

pub struct Connection {
    handle: ConnectionHandle,
    qp: *mut ffi::ibv_qp,
    channel: *mut ffi::ibv_comp_channel,
    send_flags: ffi::ibv_send_flags,
    /// Allocator for work-request ids. Monotonic, bumped when an id is
    /// handed out; submission failures are not rolled back, so this is not
    /// a count of outstanding requests.
    req_counter: u64,
    /// Optional per-slot scatter entries for the empty-receive chain. A
    /// `None` slot posts with no scatter list at all.
    batch_sges: [Option<ffi::ibv_sge>; RECV_BATCH],
    recv_wcs: [ffi::ibv_wc; WC_BATCH],
    send_wcs: [ffi::ibv_wc; WC_BATCH],
}

unsafe impl Send for Connection {}

impl Connection {
    pub(crate) fn new(id: CmId, passive: bool) -> Self {
        let qp = id.qp();
        assert!(!qp.is_null());
        Connection {
            handle: if passive {
                ConnectionHandle::Passive(id)
            } else {
                ConnectionHandle::Active(id)
            },
            qp,
            channel: id.recv_cq_channel(),
            send_flags: ffi::ibv_send_flags::IBV_SEND_SIGNALED,
            req_counter: 0,
            batch_sges: [None; RECV_BATCH],
            recv_wcs: [ffi::ibv_wc::default(); WC_BATCH],
            send_wcs: [ffi::ibv_wc::default(); WC_BATCH],
        }
    }

    fn id(&self) -> CmId {
        match self.handle {
            ConnectionHandle::Active(id) => id,
            ConnectionHandle::Passive(id) => id,
        }
    }

    #[inline]
    pub fn qp(&self) -> *mut ffi::ibv_qp {
        self.qp
    }

    /// Stable identity of this connection, used to correlate CM events
    /// (disconnects in particular) with owners of the connection.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        unsafe { &*self.qp }.qp_num
    }

    /// Toggle inline sends for subsequent posts. Inline payloads are copied
    /// into the work request itself and must fit the queue pair's
    /// negotiated `max_inline_data`.
    pub fn inlining(&mut self, enable: bool) {
        self.send_flags = if enable {
            ffi::ibv_send_flags::IBV_SEND_SIGNALED | ffi::ibv_send_flags::IBV_SEND_INLINE
        } else {
            ffi::ibv_send_flags::IBV_SEND_SIGNALED
        };
    }

    fn flags_for(&self, force_inline: bool) -> ffi::ibv_send_flags {
        if force_inline {
            ffi::ibv_send_flags::IBV_SEND_SIGNALED | ffi::ibv_send_flags::IBV_SEND_INLINE
        } else {
            self.send_flags
        }
    }

    fn alloc_wr_id(&mut self, id: Option<u64>) -> u64 {
        match id {
            Some(chosen) => chosen,
            None => {
                let id = self.req_counter;
                self.req_counter += 1;
                id
            }
        }
    }

    fn submit_send_wr(
        &self,
        wr: &mut ffi::ibv_send_wr,
        verb: &'static str,
    ) -> Result<(), Error> {
        let mut bad: *mut ffi::ibv_send_wr = ptr::null_mut();
        let rc = unsafe {
            let ctx = (*self.qp).context;
            let post_send = (*ctx).ops.post_send.as_ref().expect("post_send op");
            post_send(self.qp, wr, &mut bad)
        };
        if rc != 0 {
            let source = if rc == -1 {
                io::Error::last_os_error()
            } else {
                io::Error::from_raw_os_error(rc)
            };
            log::error!(
                "post {} unsuccessful, wr_id {} num_sge {}: {}",
                verb,
                wr.wr_id,
                wr.num_sge,
                source
            );
            return Err(Error::PostFailed { verb, source });
        }
        log::trace!("post {} successful, wr_id {}", verb, wr.wr_id);
        Ok(())
    }

    fn submit_recv_wr(
        &self,
        wr: &mut ffi::ibv_recv_wr,
        verb: &'static str,
    ) -> Result<(), Error> {
        let mut bad: *mut ffi::ibv_recv_wr = ptr::null_mut();
        let rc = unsafe {
            let ctx = (*self.qp).context;
            let post_recv = (*ctx).ops.post_recv.as_ref().expect("post_recv op");
            post_recv(self.qp, wr, &mut bad)
        };
        if rc != 0 {
            let source = if rc == -1 {
                io::Error::last_os_error()
            } else {
                io::Error::from_raw_os_error(rc)
            };
            log::error!("post {} unsuccessful: {}", verb, source);
            return Err(Error::PostFailed { verb, source });
        }
        log::trace!("post {} successful, wr_id {}", verb, wr.wr_id);
        Ok(())
    }

    /// Post a send. `id` overrides the automatically allocated wr id.
    pub fn post_send(
        &mut self,
        elems: &ScatterGatherList,
        id: Option<u64>,
        force_inline: bool,
    ) -> Result<u64, Error> {
        let wr_id = self.alloc_wr_id(id);
        let mut wr: ffi::ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = ptr::null_mut();
        wr.sg_list = elems.array();
        wr.num_sge = elems.effective_num_sge();
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = self.flags_for(force_inline).0;
        self.submit_send_wr(&mut wr, "send")?;
        Ok(wr_id)
    }

    /// Post the same receive `count` times. All postings share one wr id,
    /// so their completions cannot be told apart; callers that care post
    /// one at a time with distinct ids.
    pub fn post_recv(
        &mut self,
        elems: &ScatterGatherList,
        id: Option<u64>,
        count: usize,
    ) -> Result<u64, Error> {
        let wr_id = self.alloc_wr_id(id);
        let mut wr: ffi::ibv_recv_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = ptr::null_mut();
        wr.sg_list = elems.array();
        wr.num_sge = elems.effective_num_sge();
        for _ in 0..count {
            self.submit_recv_wr(&mut wr, "recv")?;
        }
        Ok(wr_id)
    }

    /// Point entry `i` of the empty-receive chain at consecutive
    /// `stride`-byte slots of `buf`. Slots past the end of the buffer stay
    /// empty receives.
    pub fn initialize_batched_recv<T>(&mut self, buf: &Buffer<T>, stride: usize) {
        let lkey = match buf.lkey() {
            Ok(lkey) => lkey,
            Err(_) => {
                // An unregistered buffer cannot back receives.
                self.batch_sges = [None; RECV_BATCH];
                return;
            }
        };
        for (i, slot) in self.batch_sges.iter_mut().enumerate() {
            *slot = if (i + 1) * stride <= buf.byte_len() {
                Some(ffi::ibv_sge {
                    addr: buf.ptr() + (i * stride) as u64,
                    length: stride as u32,
                    lkey,
                })
            } else {
                None
            };
        }
    }

    /// Post `count` empty receives, `RECV_BATCH` at a time: full chains
    /// first, then one fix-up chain for the remainder. Entry `i` always
    /// posts with `wr_id = i`.
    pub fn post_batched_empty_recv(&mut self, count: usize) -> Result<usize, Error> {
        if count == 0 {
            return Ok(0);
        }
        let (loops, remainder) = chain_segments(count);
        for _ in 0..loops {
            self.post_recv_chain(RECV_BATCH)?;
        }
        if remainder > 0 {
            self.post_recv_chain(remainder)?;
        }
        Ok(count)
    }

    /// Build a stack-local view of the first `n` chain entries, linked in
    /// order and null-terminated, and hand it to the verbs library in a
    /// single call.
    fn post_recv_chain(&mut self, n: usize) -> Result<(), Error> {
        assert!(n >= 1 && n <= RECV_BATCH);
        let mut wrs: [ffi::ibv_recv_wr; RECV_BATCH] = unsafe { mem::zeroed() };
        let mut sges: [ffi::ibv_sge; RECV_BATCH] = unsafe { mem::zeroed() };
        for i in 0..n {
            let wr = &mut wrs[i];
            wr.wr_id = i as u64;
            match self.batch_sges[i] {
                Some(sge) => {
                    sges[i] = sge;
                    wr.sg_list = &mut sges[i];
                    wr.num_sge = 1;
                }
                None => {
                    wr.sg_list = ptr::null_mut();
                    wr.num_sge = 0;
                }
            }
        }
        let base = wrs.as_mut_ptr();
        for i in 0..n - 1 {
            unsafe { (*base.add(i)).next = base.add(i + 1) };
        }
        unsafe { (*base.add(n - 1)).next = ptr::null_mut() };
        let mut bad: *mut ffi::ibv_recv_wr = ptr::null_mut();
        let rc = unsafe {
            let ctx = (*self.qp).context;
            let post_recv = (*ctx).ops.post_recv.as_ref().expect("post_recv op");
            post_recv(self.qp, base, &mut bad)
        };
        if rc != 0 {
            let source = if rc == -1 {
                io::Error::last_os_error()
            } else {
                io::Error::from_raw_os_error(rc)
            };
            log::error!("batched post of {} empty recvs unsuccessful: {}", n, source);
            return Err(Error::PostFailed {
                verb: "batched empty recv",
                source,
            });
        }
        Ok(())
    }

    /// Shared tail of the write-family posts. The wr id is allocated before
    /// submission and not reclaimed on failure.
    fn post_write_impl(
        &mut self,
        elems: &ScatterGatherList,
        mut wr: ffi::ibv_send_wr,
        force_inline: bool,
    ) -> Result<u64, Error> {
        let wr_id = self.req_counter;
        self.req_counter += 1;
        wr.wr_id = wr_id;
        wr.next = ptr::null_mut();
        wr.sg_list = elems.array();
        wr.num_sge = elems.effective_num_sge();
        wr.send_flags = self.flags_for(force_inline).0;
        self.submit_send_wr(&mut wr, "write")?;
        Ok(wr_id)
    }

    /// One-sided write. Produces no completion at the peer; remote
    /// visibility is only guaranteed after a subsequent write-with-immediate
    /// or an explicit round-trip.
    pub fn post_write(
        &mut self,
        elems: &ScatterGatherList,
        remote: &RemoteBuffer,
        force_inline: bool,
    ) -> Result<u64, Error> {
        let mut wr: ffi::ibv_send_wr = unsafe { mem::zeroed() };
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.wr = ffi::ibv_send_wr__bindgen_ty_2 {
            rdma: ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_1 {
                remote_addr: remote.addr,
                rkey: remote.rkey,
            },
        };
        self.post_write_impl(elems, wr, force_inline)
    }

    /// One-sided write that also delivers 32 bits of immediate data to the
    /// peer's receive queue. The immediate travels in network byte order.
    pub fn post_write_with_imm(
        &mut self,
        elems: &ScatterGatherList,
        remote: &RemoteBuffer,
        immediate: u32,
        force_inline: bool,
    ) -> Result<u64, Error> {
        let mut wr: ffi::ibv_send_wr = unsafe { mem::zeroed() };
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
        wr.__bindgen_anon_1 = ffi::ibv_send_wr__bindgen_ty_1 {
            imm_data: immediate.to_be(),
        };
        wr.wr = ffi::ibv_send_wr__bindgen_ty_2 {
            rdma: ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_1 {
                remote_addr: remote.addr,
                rkey: remote.rkey,
            },
        };
        self.post_write_impl(elems, wr, force_inline)
    }

    /// Atomic compare-and-swap on an 8-byte-aligned remote word. The prior
    /// remote value lands in the local scatter entry. Always signaled,
    /// never inline.
    pub fn post_cas(
        &mut self,
        elems: &ScatterGatherList,
        remote: &RemoteBuffer,
        compare: u64,
        swap: u64,
    ) -> Result<u64, Error> {
        let wr_id = self.req_counter;
        self.req_counter += 1;
        let mut wr: ffi::ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = wr_id;
        wr.next = ptr::null_mut();
        wr.sg_list = elems.array();
        wr.num_sge = elems.effective_num_sge();
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
        wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr = ffi::ibv_send_wr__bindgen_ty_2 {
            atomic: ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_2 {
                remote_addr: remote.addr,
                compare_add: compare,
                swap,
                rkey: remote.rkey,
            },
        };
        self.submit_send_wr(&mut wr, "atomic cas")?;
        Ok(wr_id)
    }

    /// Drain up to [`WC_BATCH`] completions from the selected queue.
    /// `blocking` spin-polls until at least one completion appears or the
    /// queue reports an error. Completions are returned in the order the
    /// hardware posted them.
    pub fn poll_wc(
        &mut self,
        queue: QueueType,
        blocking: bool,
    ) -> Result<&[ffi::ibv_wc], Error> {
        let cq_ptr = match queue {
            QueueType::Recv => unsafe { &*self.qp }.recv_cq,
            QueueType::Send => unsafe { &*self.qp }.send_cq,
        };
        let cq = unsafe { CompletionQueue::from_raw(cq_ptr) };
        let scratch = match queue {
            QueueType::Recv => &mut self.recv_wcs,
            QueueType::Send => &mut self.send_wcs,
        };
        let drained = loop {
            let n = match cq.poll(&mut scratch[..]) {
                Ok(completions) => completions.len(),
                Err(_) => {
                    log::error!(
                        "failure polling completions from the {:?} queue, errno {}",
                        queue,
                        io::Error::last_os_error()
                    );
                    return Err(Error::PollFailed { queue });
                }
            };
            if n > 0 || !blocking {
                break n;
            }
        };
        let completions = &scratch[..drained];
        if log::log_enabled!(log::Level::Trace) {
            for (i, wc) in completions.iter().enumerate() {
                log::trace!(
                    "queue {:?} wc {}/{} wr_id {} status {}",
                    queue,
                    i + 1,
                    drained,
                    wc.wr_id,
                    wc.status_str()
                );
            }
        }
        Ok(completions)
    }

    /// Arm the receive CQ so the next completion raises a channel event.
    pub fn notify_events(&self) {
        let cq = unsafe { CompletionQueue::from_raw((*self.qp).recv_cq) };
        cq.req_notify(false);
    }

    /// Block on the CQ channel until an armed completion queue fires.
    /// The returned queue must be acknowledged with [`ack_events`](Self::ack_events).
    pub fn wait_events(&self) -> io::Result<CompletionQueue<'_>> {
        unsafe { ibv::get_cq_event(self.channel) }
    }

    pub fn ack_events(&self, cq: CompletionQueue<'_>, nevents: u32) {
        ibv::ack_cq_events(cq, nevents);
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.id().disconnect() {
            log::debug!("rdma_disconnect: {}", e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        match self.handle {
            ConnectionHandle::Active(id) => id.destroy_ep(),
            ConnectionHandle::Passive(id) => id.destroy_qp_then_id(),
        }
    }
}

/// Split a posting of `count` empty receives into full `RECV_BATCH` chains
/// and a trailing partial chain.
fn chain_segments(count: usize) -> (usize, usize) {
    (count / RECV_BATCH, count % RECV_BATCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_segmentation() {
        assert_eq!(chain_segments(1), (0, 1));
        assert_eq!(chain_segments(RECV_BATCH - 1), (0, RECV_BATCH - 1));
        assert_eq!(chain_segments(RECV_BATCH), (1, 0));
        assert_eq!(chain_segments(RECV_BATCH + 1), (1, 1));
        assert_eq!(chain_segments(3 * RECV_BATCH + 7), (3, 7));
    }
}
