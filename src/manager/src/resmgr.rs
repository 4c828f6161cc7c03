//! Best-effort handshake with the cluster resource manager. The manager
//! announces itself at startup and re-announces whenever its lease
//! accounting changes; a resource manager that is down never blocks the
//! allocation path.
use api::node::NodeStatus;
use api::AccessFlags;
use rdma::{ActiveEndpoint, Buffer, EndpointConfig, QueueType, ScatterGatherList};

use crate::config::ManagerConfig;

pub struct ResourceManagerClient {
    address: String,
    port: u16,
    secret: u32,
    manager_port: u16,
}

impl ResourceManagerClient {
    pub fn new(config: &ManagerConfig) -> Self {
        ResourceManagerClient {
            address: config.resource_manager_address.clone(),
            port: config.resource_manager_port,
            secret: config.resource_manager_secret,
            manager_port: config.rdma_device_port,
        }
    }

    /// Connect, deliver one status record inline, disconnect. Returns
    /// whether the resource manager acknowledged the connection at all.
    pub fn announce(&self, cores_free: i16, executors_active: u16) -> bool {
        let status = NodeStatus {
            secret: self.secret,
            port: self.manager_port,
            cores_free,
            executors_active,
        };
        match self.try_announce(&status) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "resource manager at {}:{} not reachable: {}",
                    self.address,
                    self.port,
                    e
                );
                false
            }
        }
    }

    fn try_announce(&self, status: &NodeStatus) -> anyhow::Result<()> {
        let mut endpoint =
            ActiveEndpoint::new(&self.address, self.port, EndpointConfig::default())?;
        endpoint.allocate()?;
        if !endpoint.connect(&[])? {
            anyhow::bail!("connection rejected");
        }

        let mut record: Buffer<u8> = Buffer::allocate(api::node::STATUS_BYTES)?;
        record.register(endpoint.pd(), AccessFlags::LOCAL_WRITE)?;
        record.data_mut().copy_from_slice(&status.to_bytes());
        let sge = ScatterGatherList::from_buffer(&record)?;

        let conn = endpoint.connection();
        conn.post_send(&sge, None, true)?;
        let completions = conn.poll_wc(QueueType::Send, true)?;
        if !completions.iter().all(|wc| wc.is_success()) {
            anyhow::bail!("status send did not complete");
        }
        conn.disconnect();
        Ok(())
    }
}
