//! The accept/dispatch loop. One thread services the CM event channel,
//! drains allocation completions, keeps receive queues at depth, and sweeps
//! executor lifecycles.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use api::allocation::{status, AllocationRequest, REQUEST_BYTES};
use api::{tags, AccessFlags, ManagerCredentials, RemoteBuffer};
use rdma::{
    Buffer, Connection, EndpointConfig, EndpointEvent, PassiveEndpoint, QueueType, RecvQueue,
    RemoteWritable, ScatterGatherList,
};

use crate::config::Settings;
use crate::executor::{ActiveExecutor, ExecutorSpawner, ExecutorStatus};
use crate::resmgr::ResourceManagerClient;

/// Allocation-request slots exposed for remote writes. One slot is leased
/// to each connected client for the lifetime of its connection.
pub const RECV_SLOTS: usize = 32;
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Endpoint(#[from] rdma::endpoint::Error),
    #[error(transparent)]
    Buffer(#[from] rdma::buffer::Error),
    #[error(transparent)]
    Connection(#[from] rdma::connection::Error),
}

struct ClientSession {
    connection: Connection,
    recv_queue: RecvQueue,
    slot: usize,
    /// The client's response buffer, advertised in its connect request.
    response: Option<RemoteBuffer>,
    /// Local source for status write-backs.
    status_source: Buffer<i32>,
    executor: Option<i32>,
}

pub struct Manager {
    // Field order doubles as teardown order: sessions and buffers hold
    // queue pairs and memory regions that must go before the endpoint
    // releases the protection domain.
    sessions: HashMap<u32, ClientSession>,
    slots: RemoteWritable<u8>,
    accounting: Buffer<u64>,
    executors: HashMap<i32, ActiveExecutor>,
    spawner: ExecutorSpawner,
    slot_owner: [Option<u32>; RECV_SLOTS],
    total_cores: i16,
    used_cores: i16,
    secret_counter: u32,
    address: String,
    port: u16,
    recv_depth: usize,
    resmgr: Option<ResourceManagerClient>,
    endpoint: PassiveEndpoint,
}

impl Manager {
    pub fn new(
        settings: &Settings,
        spawner: ExecutorSpawner,
        resmgr: Option<ResourceManagerClient>,
    ) -> Result<Self, ManagerError> {
        let device = settings.device();
        let recv_depth = settings.executor.recv_buffer_size as usize;
        let endpoint_config = EndpointConfig {
            recv_queue_depth: (recv_depth + 1) as u32,
            max_inline_data: settings.executor.max_inline_data,
            ..EndpointConfig::default()
        };
        let mut endpoint = PassiveEndpoint::new(
            &device.ip_address,
            settings.config.rdma_device_port,
            endpoint_config,
        )?;
        endpoint.allocate()?;

        let mut slots: Buffer<u8> = Buffer::allocate(RECV_SLOTS * REQUEST_BYTES)?;
        slots.register(
            endpoint.pd(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )?;
        let slots = RemoteWritable::new(slots)?;

        let mut accounting: Buffer<u64> = Buffer::allocate(RECV_SLOTS)?;
        accounting.register(
            endpoint.pd(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC,
        )?;

        let total_cores = std::thread::available_parallelism()
            .map(|n| n.get() as i16)
            .unwrap_or(1);

        Ok(Manager {
            sessions: HashMap::new(),
            slots,
            accounting,
            executors: HashMap::new(),
            spawner,
            slot_owner: [None; RECV_SLOTS],
            total_cores,
            used_cores: 0,
            secret_counter: 0,
            address: device.ip_address.clone(),
            port: settings.config.rdma_device_port,
            recv_depth,
            resmgr,
            endpoint,
        })
    }

    pub fn run(&mut self, closing: &AtomicBool) -> Result<(), ManagerError> {
        self.announce();
        let mut last_check = Instant::now();
        while !closing.load(Ordering::Relaxed) {
            self.poll_cm()?;
            self.poll_allocations();
            if last_check.elapsed() >= CHECK_INTERVAL {
                self.check_executors();
                last_check = Instant::now();
            }
        }
        log::info!("closing down, reaping {} executors", self.executors.len());
        self.shutdown();
        Ok(())
    }

    fn announce(&self) {
        if let Some(resmgr) = &self.resmgr {
            resmgr.announce(
                self.total_cores - self.used_cores,
                self.executors.len() as u16,
            );
        }
    }

    fn slot_descriptor(&self, slot: usize) -> RemoteBuffer {
        let base = self.slots.inner();
        RemoteBuffer::new(
            base.ptr() + (slot * REQUEST_BYTES) as u64,
            base.rkey().expect("slot region is registered"),
            REQUEST_BYTES as u32,
        )
    }

    fn free_slot(&self) -> Option<usize> {
        self.slot_owner.iter().position(|owner| owner.is_none())
    }

    fn free_slots_of(&mut self, qp_num: u32) {
        for owner in self.slot_owner.iter_mut() {
            if *owner == Some(qp_num) {
                *owner = None;
            }
        }
    }

    /// One step of the CM state machine. The accept payload advertises the
    /// next free allocation slot; the slot is leased to the connection when
    /// the request is answered and reclaimed on disconnect.
    fn poll_cm(&mut self) -> Result<(), ManagerError> {
        let payload = match self.free_slot() {
            Some(slot) => vec![(tags::ALLOCATION_SLOT, self.slot_descriptor(slot))],
            None => Vec::new(),
        };
        match self.endpoint.poll_events(&payload)? {
            None => {}
            Some(EndpointEvent::Requested { qp_num }) => {
                match self.free_slot() {
                    Some(slot) => self.slot_owner[slot] = Some(qp_num),
                    None => log::warn!(
                        "accepted qp {} with no free allocation slot; it cannot allocate",
                        qp_num
                    ),
                }
            }
            Some(EndpointEvent::Established {
                mut connection,
                peer_buffers,
            }) => {
                let qp_num = connection.qp_num();
                let Some(slot) = self
                    .slot_owner
                    .iter()
                    .position(|owner| *owner == Some(qp_num))
                else {
                    log::warn!("no slot leased to qp {}, dropping the connection", qp_num);
                    connection.disconnect();
                    return Ok(());
                };
                connection.initialize_batched_recv(self.slots.inner(), REQUEST_BYTES);
                let mut recv_queue = RecvQueue::new(self.recv_depth);
                if let Err(e) = recv_queue.prime(&mut connection) {
                    log::error!("cannot prime receives for qp {}: {}", qp_num, e);
                    self.free_slots_of(qp_num);
                    connection.disconnect();
                    return Ok(());
                }
                let mut status_source: Buffer<i32> = Buffer::allocate(1)?;
                status_source.register(self.endpoint.pd(), AccessFlags::LOCAL_WRITE)?;
                let response = peer_buffers
                    .iter()
                    .find(|(tag, _)| *tag == tags::RESPONSE)
                    .map(|(_, buf)| *buf);
                log::info!("client connected: qp {}, slot {}", qp_num, slot);
                self.sessions.insert(
                    qp_num,
                    ClientSession {
                        connection,
                        recv_queue,
                        slot,
                        response,
                        status_source,
                        executor: None,
                    },
                );
            }
            Some(EndpointEvent::Disconnected { qp_num }) => {
                log::info!("client disconnected: qp {}", qp_num);
                self.reap_session(qp_num);
            }
        }
        Ok(())
    }

    /// Drain every session's receive queue and dispatch the allocation
    /// requests that arrived, re-posting consumed receives in batches.
    fn poll_allocations(&mut self) {
        let qp_nums: Vec<u32> = self.sessions.keys().copied().collect();
        for qp_num in qp_nums {
            let completions: Vec<Option<u32>> = {
                let session = self.sessions.get_mut(&qp_num).expect("session exists");
                match session.connection.poll_wc(QueueType::Recv, false) {
                    Ok(completions) => completions
                        .iter()
                        .filter(|wc| {
                            if !wc.is_success() {
                                log::warn!(
                                    "receive completion error on qp {}: {}",
                                    qp_num,
                                    wc.status_str()
                                );
                            }
                            wc.is_success()
                        })
                        .map(|wc| wc.imm_data())
                        .collect(),
                    Err(e) => {
                        log::error!("receive poll failed on qp {}: {}", qp_num, e);
                        continue;
                    }
                }
            };
            if completions.is_empty() {
                continue;
            }
            {
                let session = self.sessions.get_mut(&qp_num).expect("session exists");
                session.recv_queue.consumed(completions.len());
                if let Err(e) = session.recv_queue.refill(&mut session.connection) {
                    log::error!("cannot refill receives on qp {}: {}", qp_num, e);
                }
                // Opportunistically drain send completions from earlier
                // write-backs so the send queue never fills.
                let _ = session.connection.poll_wc(QueueType::Send, false);
            }
            for immediate in completions {
                self.handle_allocation(qp_num, immediate);
            }
        }
    }

    fn handle_allocation(&mut self, qp_num: u32, immediate: Option<u32>) {
        // The slot was leased at accept time; the immediate is merely the
        // client's sequence tag for the signal.
        let Some(slot) = self
            .slot_owner
            .iter()
            .position(|owner| *owner == Some(qp_num))
        else {
            log::warn!("qp {} signalled but owns no allocation slot", qp_num);
            return;
        };
        log::debug!(
            "allocation signal {:?} from qp {} in slot {}",
            immediate,
            qp_num,
            slot
        );
        let bytes = self.slots.read_slice(slot * REQUEST_BYTES, REQUEST_BYTES);
        let request = match AllocationRequest::from_bytes(&bytes) {
            Ok(request) => request,
            Err(e) => {
                log::error!("malformed allocation request in slot {}: {}", slot, e);
                self.write_status(qp_num, status::REJECTED_SPAWN_FAILED);
                if let Some(session) = self.sessions.get(&qp_num) {
                    session.connection.disconnect();
                }
                return;
            }
        };
        log::info!(
            "allocation request: {} cores for client {}:{}, hot timeout {} ms",
            request.cores,
            request.listen_address,
            request.listen_port,
            request.hot_timeout_ms
        );

        if request.cores <= 0 || self.used_cores + request.cores > self.total_cores {
            log::warn!(
                "rejecting allocation of {} cores ({}/{} in use)",
                request.cores,
                self.used_cores,
                self.total_cores
            );
            self.write_status(qp_num, status::REJECTED_NO_CORES);
            if let Some(session) = self.sessions.get(&qp_num) {
                session.connection.disconnect();
            }
            return;
        }

        self.secret_counter += 1;
        let credentials = ManagerCredentials {
            addr: self.address.clone(),
            port: self.port,
            secret: self.secret_counter,
            r_addr: self.accounting.ptr() + (slot * std::mem::size_of::<u64>()) as u64,
            r_key: self
                .accounting
                .rkey()
                .expect("accounting region is registered"),
        };
        match self.spawner.spawn(&request, &credentials) {
            Ok(executor) => {
                let pid = executor.id();
                self.used_cores += request.cores;
                self.executors.insert(pid, executor);
                if let Some(session) = self.sessions.get_mut(&qp_num) {
                    session.executor = Some(pid);
                }
                self.write_status(qp_num, status::ACCEPTED);
                self.announce();
            }
            Err(e) => {
                log::error!("executor spawn failed: {}", e);
                self.write_status(qp_num, status::REJECTED_SPAWN_FAILED);
                if let Some(session) = self.sessions.get(&qp_num) {
                    session.connection.disconnect();
                }
            }
        }
    }

    /// Deposit a status word in the client's response buffer, immediate
    /// data carrying the same value so the client sees a completion.
    fn write_status(&mut self, qp_num: u32, value: i32) {
        let Some(session) = self.sessions.get_mut(&qp_num) else {
            return;
        };
        let Some(response) = session.response else {
            log::debug!("qp {} advertised no response buffer", qp_num);
            return;
        };
        session.status_source.data_mut()[0] = value;
        let sge = match ScatterGatherList::from_buffer(&session.status_source) {
            Ok(sge) => sge,
            Err(e) => {
                log::error!("cannot build status write: {}", e);
                return;
            }
        };
        if let Err(e) =
            session
                .connection
                .post_write_with_imm(&sge, &response, value as u32, true)
        {
            log::error!("status write-back to qp {} failed: {}", qp_num, e);
        }
    }

    fn reap_session(&mut self, qp_num: u32) {
        self.free_slots_of(qp_num);
        let Some(session) = self.sessions.remove(&qp_num) else {
            return;
        };
        log::debug!("released slot {} of qp {}", session.slot, qp_num);
        if let Some(pid) = session.executor {
            if let Some(executor) = self.executors.get(&pid) {
                log::info!("killing executor {} of departed qp {}", pid, qp_num);
                executor.kill();
            }
        }
        // Dropping the session tears down the QP and id.
    }

    /// Sweep executor lifecycles; transition the finished ones out and
    /// report the freed lease.
    fn check_executors(&mut self) {
        let mut finished: Vec<(i32, ExecutorStatus)> = Vec::new();
        for (pid, executor) in &mut self.executors {
            match executor.check() {
                ExecutorStatus::Running => {}
                done => {
                    executor.allocation_finished = Some(Instant::now());
                    finished.push((*pid, done));
                }
            }
        }
        for (pid, done) in finished {
            let executor = self.executors.remove(&pid).expect("present");
            self.used_cores -= executor.cores;
            match done {
                ExecutorStatus::Finished(code) => {
                    log::info!("executor {} finished with exit code {}", pid, code)
                }
                ExecutorStatus::FinishedFail(sig) => {
                    log::warn!("executor {} failed (signal or unknown: {})", pid, sig)
                }
                ExecutorStatus::Running => unreachable!(),
            }
            for session in self.sessions.values_mut() {
                if session.executor == Some(pid) {
                    session.executor = None;
                }
            }
            self.announce();
        }
    }

    fn shutdown(&mut self) {
        for executor in self.executors.values() {
            executor.kill();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.executors.is_empty() && Instant::now() < deadline {
            self.check_executors();
            std::thread::sleep(Duration::from_millis(20));
        }
        self.sessions.clear();
        self.announce();
    }
}
