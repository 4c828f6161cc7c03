//! Loopback exercises against a real RDMA device. SoftRoCE (rdma_rxe on
//! any ethernet interface) is enough. Ignored by default so the suite can
//! run on machines without a fabric.
use std::thread;

use api::{tags, AccessFlags, RemoteBuffer};
use rdma::connection::RECV_BATCH;
use rdma::{
    ActiveEndpoint, Buffer, Connection, EndpointConfig, EndpointEvent, PassiveEndpoint,
    QueueType, RecvQueue, ScatterGatherList,
};

const IP: &str = "127.0.0.1";

fn wait_established(
    listener: &mut PassiveEndpoint,
    payload: &[(u32, RemoteBuffer)],
) -> Connection {
    loop {
        if let Some(EndpointEvent::Established { connection, .. }) =
            listener.poll_events(payload).unwrap()
        {
            return connection;
        }
    }
}

fn connect_client(port: u16, config: EndpointConfig) -> ActiveEndpoint {
    let mut client = ActiveEndpoint::new(IP, port, config).unwrap();
    client.allocate().unwrap();
    assert!(client.connect(&[]).unwrap());
    client
}

#[test]
#[ignore = "requires an RDMA device"]
fn zero_length_write_with_immediate() {
    let port = 17710;
    let mut listener = PassiveEndpoint::new(IP, port, EndpointConfig::default()).unwrap();
    listener.allocate().unwrap();

    let server = thread::spawn(move || {
        let mut target: Buffer<u8> = Buffer::allocate(64).unwrap();
        target
            .register(
                listener.pd(),
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )
            .unwrap();
        let descriptor = target.remote_descriptor().unwrap();
        let mut conn = wait_established(&mut listener, &[(tags::RESPONSE, descriptor)]);
        conn.post_batched_empty_recv(16).unwrap();
        let wcs = conn.poll_wc(QueueType::Recv, true).unwrap();
        assert!(wcs[0].is_success());
        assert_eq!(wcs[0].byte_len(), 0);
        assert_eq!(wcs[0].imm_data(), Some(0xfeed));
    });

    let mut client = connect_client(port, EndpointConfig::default());
    let target = client.peer_buffer(tags::RESPONSE).unwrap();
    let mut src: Buffer<u8> = Buffer::allocate(1).unwrap();
    src.register(client.pd(), AccessFlags::LOCAL_WRITE).unwrap();
    let mut sge = ScatterGatherList::new();
    sge.add_range(&src, 0, 0).unwrap();
    let conn = client.connection();
    conn.post_write_with_imm(&sge, &target, 0xfeed, false).unwrap();
    let wcs = conn.poll_wc(QueueType::Send, true).unwrap();
    assert!(wcs[0].is_success());
    server.join().unwrap();
}

#[test]
#[ignore = "requires an RDMA device"]
fn inline_threshold() {
    let port = 17711;
    let config = EndpointConfig {
        max_inline_data: 220,
        ..EndpointConfig::default()
    };
    let mut listener = PassiveEndpoint::new(IP, port, config).unwrap();
    listener.allocate().unwrap();

    let server = thread::spawn(move || {
        let mut conn = wait_established(&mut listener, &[]);
        let mut slots: Buffer<u8> = Buffer::allocate(1024).unwrap();
        slots
            .register(listener.pd(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        conn.initialize_batched_recv(&slots, 256);
        conn.post_batched_empty_recv(4).unwrap();
        let wcs = conn.poll_wc(QueueType::Recv, true).unwrap();
        assert!(wcs[0].is_success());
        assert_eq!(wcs[0].byte_len(), 220);
    });

    let mut client = connect_client(port, config);
    let mut payload: Buffer<u8> = Buffer::allocate(256).unwrap();
    payload
        .register(client.pd(), AccessFlags::LOCAL_WRITE)
        .unwrap();

    // One byte past the negotiated maximum must fail at post time.
    let mut oversized = ScatterGatherList::new();
    oversized.add_range(&payload, 0, 221).unwrap();
    assert!(client
        .connection()
        .post_send(&oversized, None, true)
        .is_err());

    // At exactly the maximum it goes through.
    let mut exact = ScatterGatherList::new();
    exact.add_range(&payload, 0, 220).unwrap();
    client.connection().post_send(&exact, None, true).unwrap();
    let wcs = client.connection().poll_wc(QueueType::Send, true).unwrap();
    assert!(wcs[0].is_success());
    server.join().unwrap();
}

#[test]
#[ignore = "requires an RDMA device"]
fn receive_recycler_keeps_depth() {
    let port = 17712;
    let depth = 64;
    let sends = 200;
    let mut listener = PassiveEndpoint::new(IP, port, EndpointConfig::default()).unwrap();
    listener.allocate().unwrap();

    let server = thread::spawn(move || {
        let mut conn = wait_established(&mut listener, &[]);
        let mut queue = RecvQueue::new(depth);
        queue.prime(&mut conn).unwrap();
        let mut seen = 0;
        while seen < sends {
            let n = conn.poll_wc(QueueType::Recv, true).unwrap().len();
            seen += n;
            queue.consumed(n);
            queue.refill(&mut conn).unwrap();
        }
        assert!(queue.posted() >= depth - RECV_BATCH);
    });

    let mut client = connect_client(port, EndpointConfig::default());
    let empty = ScatterGatherList::new();
    let conn = client.connection();
    let mut outstanding = 0;
    for _ in 0..sends {
        conn.post_send(&empty, None, false).unwrap();
        outstanding += 1;
        // Keep the send queue shallow; every send is signaled.
        if outstanding >= 32 {
            outstanding -= conn.poll_wc(QueueType::Send, true).unwrap().len();
        }
    }
    while outstanding > 0 {
        outstanding -= conn.poll_wc(QueueType::Send, true).unwrap().len();
    }
    server.join().unwrap();
}

#[test]
#[ignore = "requires an RDMA device"]
fn cas_swaps_exactly_once() {
    let port = 17713;
    let mut listener = PassiveEndpoint::new(IP, port, EndpointConfig::default()).unwrap();
    listener.allocate().unwrap();

    let server = thread::spawn(move || {
        let mut word: Buffer<u64> = Buffer::allocate(1).unwrap();
        word.data_mut()[0] = 0xDEAD_BEEF;
        word.register(
            listener.pd(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC,
        )
        .unwrap();
        let descriptor = word.remote_descriptor().unwrap();
        let mut conn = wait_established(&mut listener, &[(tags::RESPONSE, descriptor)]);
        conn.post_batched_empty_recv(4).unwrap();
        // The client signals with an immediate once both CAS attempts are
        // done; the word must reflect exactly one successful swap.
        let wcs = conn.poll_wc(QueueType::Recv, true).unwrap();
        assert!(wcs[0].is_success());
        assert_eq!(word.data()[0], 0xCAFE_BABE);
    });

    let mut client = connect_client(port, EndpointConfig::default());
    let target = client.peer_buffer(tags::RESPONSE).unwrap();
    let mut local: Buffer<u64> = Buffer::allocate(1).unwrap();
    local
        .register(client.pd(), AccessFlags::LOCAL_WRITE)
        .unwrap();
    let sge = ScatterGatherList::from_buffer(&local).unwrap();

    let conn = client.connection();
    conn.post_cas(&sge, &target, 0xDEAD_BEEF, 0xCAFE_BABE).unwrap();
    let wcs = conn.poll_wc(QueueType::Send, true).unwrap();
    assert!(wcs[0].is_success());
    // The previous value comes back on success.
    assert_eq!(local.data()[0], 0xDEAD_BEEF);

    // Same compare again: the word no longer matches, so no swap happens
    // and the current value comes back instead.
    conn.post_cas(&sge, &target, 0xDEAD_BEEF, 0x0BAD_F00D).unwrap();
    let wcs = conn.poll_wc(QueueType::Send, true).unwrap();
    assert!(wcs[0].is_success());
    assert_eq!(local.data()[0], 0xCAFE_BABE);

    let empty = ScatterGatherList::new();
    conn.post_write_with_imm(&empty, &target, 1, false).unwrap();
    conn.poll_wc(QueueType::Send, true).unwrap();
    server.join().unwrap();
}
