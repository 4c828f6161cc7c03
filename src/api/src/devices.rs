//! The device database: a JSON mapping from RDMA device name to the
//! fabric-facing parameters a node needs before it can open an endpoint.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read device database: {0}")]
    Io(#[from] io::Error),
    #[error("malformed device database: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceData {
    pub ip_address: String,
    pub port: u16,
    pub default_receive_buffer_size: i32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceDatabase {
    devices: HashMap<String, DeviceData>,
}

impl DeviceDatabase {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn from_str(content: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceData> {
        self.devices.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"{
        "mlx5_0": {
            "ip_address": "192.168.0.12",
            "port": 10000,
            "default_receive_buffer_size": 32,
            "max_inline_data": 220
        }
    }"#;

    #[test]
    fn lookup() {
        let db = DeviceDatabase::from_str(DB).unwrap();
        let dev = db.device("mlx5_0").expect("device present");
        assert_eq!(dev.ip_address, "192.168.0.12");
        assert_eq!(dev.max_inline_data, 220);
        assert!(db.device("mlx4_1").is_none());
    }

    #[test]
    fn unknown_fields_rejected() {
        let malformed = r#"{ "mlx5_0": { "ip_address": "1.2.3.4", "port": 1,
            "default_receive_buffer_size": 1, "max_inline_data": 1,
            "surprise": true } }"#;
        assert!(DeviceDatabase::from_str(malformed).is_err());
    }
}
