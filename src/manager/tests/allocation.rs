//! End-to-end allocation against a live manager over loopback RDMA.
//! Ignored by default; SoftRoCE on the loopback-routed interface is enough.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use api::allocation::{status, AllocationRequest, REQUEST_BYTES};
use api::devices::DeviceDatabase;
use api::{tags, AccessFlags};
use executor_manager::config::Settings;
use executor_manager::executor::ExecutorSpawner;
use executor_manager::manager::Manager;
use rdma::{
    ActiveEndpoint, Buffer, EndpointConfig, QueueType, RemoteWritable, ScatterGatherList,
};

static CLOSING: AtomicBool = AtomicBool::new(false);

const DEVICES: &str = r#"{
    "lo": {
        "ip_address": "127.0.0.1",
        "port": 11500,
        "default_receive_buffer_size": 32,
        "max_inline_data": 64
    }
}"#;

const CONFIG: &str = r#"{
    "config": {
        "rdma_device": "lo",
        "rdma_device_port": 11500,
        "resource_manager_address": "127.0.0.1",
        "resource_manager_port": 11999,
        "resource_manager_secret": 1
    },
    "executor": {
        "repetitions": 1,
        "warmup_iters": 0,
        "pin_threads": false,
        "docker": {
            "use_docker": false,
            "image": "unused",
            "network": "unused",
            "ip": "0.0.0.0",
            "volume": "/tmp",
            "registry_ip": "127.0.0.1",
            "registry_port": 5000
        }
    }
}"#;

#[test]
#[ignore = "requires an RDMA device"]
fn single_allocation_end_to_end() {
    let devices = DeviceDatabase::from_str(DEVICES).unwrap();
    let settings = Settings::from_json(CONFIG, &devices).unwrap();
    let mut spawner = ExecutorSpawner::new(settings.executor.clone(), None).unwrap();
    spawner.set_executor_path(PathBuf::from("/bin/true"));
    let mut manager = Manager::new(&settings, spawner, None).unwrap();
    let server = thread::spawn(move || manager.run(&CLOSING).unwrap());

    let mut client = ActiveEndpoint::new("127.0.0.1", 11500, EndpointConfig::default()).unwrap();
    client.allocate().unwrap();

    let mut response: Buffer<i32> = Buffer::allocate(1).unwrap();
    response
        .register(
            client.pd(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )
        .unwrap();
    let response = RemoteWritable::new(response).unwrap();

    assert!(client
        .connect(&[(tags::RESPONSE, response.remote_descriptor().unwrap())])
        .unwrap());
    let slot = client
        .peer_buffer(tags::ALLOCATION_SLOT)
        .expect("manager advertised an allocation slot");

    // Receives must be up before the manager's status write-back.
    client.connection().post_batched_empty_recv(4).unwrap();

    let request = AllocationRequest {
        listen_address: "127.0.0.1".to_owned(),
        listen_port: 20000,
        cores: 1,
        hot_timeout_ms: 5000,
        input_buf_size: 1024,
        func_buf_size: 4096,
    };
    let mut payload: Buffer<u8> = Buffer::allocate(REQUEST_BYTES).unwrap();
    payload
        .register(client.pd(), AccessFlags::LOCAL_WRITE)
        .unwrap();
    payload
        .data_mut()
        .copy_from_slice(&request.to_bytes().unwrap());
    let sge = ScatterGatherList::from_buffer(&payload).unwrap();

    let conn = client.connection();
    conn.post_write_with_imm(&sge, &slot, 1, false).unwrap();
    let wcs = conn.poll_wc(QueueType::Send, true).unwrap();
    assert!(wcs[0].is_success());

    // The manager acknowledges with a status write-back carrying the same
    // value as immediate data.
    let wcs = conn.poll_wc(QueueType::Recv, true).unwrap();
    assert!(wcs[0].is_success());
    assert_eq!(wcs[0].imm_data(), Some(status::ACCEPTED as u32));
    assert_eq!(response.read(0), status::ACCEPTED);

    // Dropping the client disconnects; the manager reaps the session and
    // kills the (already finished) executor.
    drop(client);
    CLOSING.store(true, Ordering::Relaxed);
    server.join().unwrap();
}
