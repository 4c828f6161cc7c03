//! Manager configuration: one JSON document with `config`, `executor`, and
//! `sandbox-configuration` sections, plus the device database that fills in
//! the fabric-dependent executor parameters.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use api::devices::{DeviceData, DeviceDatabase};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration field: {0}")]
    Invalid(&'static str),
    #[error("data for device {0} not found")]
    UnknownDevice(String),
    #[error("sandbox {0:?} selected but has no sandbox-configuration entry")]
    SandboxUnavailable(SandboxType),
    #[error(transparent)]
    Devices(#[from] api::devices::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxType {
    Process,
    Docker,
    Sarus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    pub rdma_device: String,
    pub rdma_device_port: u16,
    pub resource_manager_address: String,
    pub resource_manager_port: u16,
    pub resource_manager_secret: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerSettings {
    pub use_docker: bool,
    pub image: String,
    pub network: String,
    pub ip: String,
    pub volume: String,
    pub registry_ip: String,
    pub registry_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    pub repetitions: i32,
    pub warmup_iters: i32,
    pub pin_threads: bool,
    /// Overrides the sandbox implied by `docker.use_docker`.
    #[serde(default)]
    pub sandbox_type: Option<SandboxType>,
    pub docker: DockerSettings,
    /// Filled from the device database, not the configuration file.
    #[serde(skip)]
    pub max_inline_data: u32,
    #[serde(skip)]
    pub recv_buffer_size: i32,
}

impl ExecutorSettings {
    pub fn sandbox(&self) -> SandboxType {
        self.sandbox_type.unwrap_or(if self.docker.use_docker {
            SandboxType::Docker
        } else {
            SandboxType::Process
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SandboxConfiguration {
    pub devices: Vec<String>,
    pub mounts: Vec<String>,
    /// Bind mounts with a `{user}` placeholder substituted at spawn time.
    pub mount_filesystem: Vec<String>,
    pub env: HashMap<String, String>,
    pub user: String,
    pub name: String,
}

impl SandboxConfiguration {
    /// The extra container flags this sandbox carries: device passthrough,
    /// bind mounts, and environment variables, in that order.
    pub fn generate_args(&self, args: &mut Vec<String>, user: &str) {
        for dev in &self.devices {
            args.push(format!("--device={}", dev));
        }
        for mount in &self.mount_filesystem {
            let path = mount.replace("{user}", user);
            args.push(format!(
                "--mount=type=bind,source={},destination={}",
                path, path
            ));
        }
        for mount in &self.mounts {
            args.push(format!(
                "--mount=type=bind,source={},destination={}",
                mount, mount
            ));
        }
        let mut env: Vec<_> = self.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_owned());
            args.push(format!("{}={}", key, value));
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub config: ManagerConfig,
    pub executor: ExecutorSettings,
    #[serde(rename = "sandbox-configuration", default)]
    pub sandboxes: HashMap<SandboxType, SandboxConfiguration>,
    #[serde(skip)]
    pub device: Option<DeviceData>,
}

impl Settings {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        config_path: P,
        device_db_path: Q,
    ) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(config_path)?;
        let devices = DeviceDatabase::from_path(device_db_path)?;
        Self::from_json(&content, &devices)
    }

    pub fn from_json(content: &str, devices: &DeviceDatabase) -> Result<Self, ConfigError> {
        let mut settings: Settings = serde_json::from_str(content)?;

        let device = devices
            .device(&settings.config.rdma_device)
            .ok_or_else(|| ConfigError::UnknownDevice(settings.config.rdma_device.clone()))?
            .clone();
        settings.executor.max_inline_data = device.max_inline_data;
        settings.executor.recv_buffer_size = device.default_receive_buffer_size;

        if settings.config.rdma_device_port == 0 {
            return Err(ConfigError::Invalid("config.rdma_device_port"));
        }
        if settings.executor.recv_buffer_size <= 0 {
            return Err(ConfigError::Invalid(
                "device.default_receive_buffer_size",
            ));
        }
        let sandbox = settings.executor.sandbox();
        if sandbox != SandboxType::Process && !settings.sandboxes.contains_key(&sandbox) {
            return Err(ConfigError::SandboxUnavailable(sandbox));
        }

        settings.device = Some(device);
        Ok(settings)
    }

    pub fn device(&self) -> &DeviceData {
        self.device.as_ref().expect("settings are validated on load")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = r#"{
        "mlx5_0": {
            "ip_address": "127.0.0.1",
            "port": 10000,
            "default_receive_buffer_size": 32,
            "max_inline_data": 220
        }
    }"#;

    fn config(extra_executor: &str, sandboxes: &str) -> String {
        format!(
            r#"{{
                "config": {{
                    "rdma_device": "mlx5_0",
                    "rdma_device_port": 10000,
                    "resource_manager_address": "127.0.0.1",
                    "resource_manager_port": 11000,
                    "resource_manager_secret": 42
                }},
                "executor": {{
                    "repetitions": 100,
                    "warmup_iters": 10,
                    "pin_threads": false{extra_executor},
                    "docker": {{
                        "use_docker": false,
                        "image": "rdma-executor",
                        "network": "testnet",
                        "ip": "172.31.82.200",
                        "volume": "/shared/build",
                        "registry_ip": "127.0.0.1",
                        "registry_port": 5000
                    }}
                }}{sandboxes}
            }}"#
        )
    }

    #[test]
    fn device_parameters_are_merged() {
        let db = DeviceDatabase::from_str(DEVICES).unwrap();
        let settings = Settings::from_json(&config("", ""), &db).unwrap();
        assert_eq!(settings.executor.max_inline_data, 220);
        assert_eq!(settings.executor.recv_buffer_size, 32);
        assert_eq!(settings.executor.sandbox(), SandboxType::Process);
        assert_eq!(settings.device().ip_address, "127.0.0.1");
    }

    #[test]
    fn unknown_device_fails() {
        let db = DeviceDatabase::from_str("{}").unwrap();
        assert!(matches!(
            Settings::from_json(&config("", ""), &db),
            Err(ConfigError::UnknownDevice(name)) if name == "mlx5_0"
        ));
    }

    #[test]
    fn sandbox_without_configuration_fails() {
        let db = DeviceDatabase::from_str(DEVICES).unwrap();
        let content = config(r#", "sandbox_type": "sarus""#, "");
        assert!(matches!(
            Settings::from_json(&content, &db),
            Err(ConfigError::SandboxUnavailable(SandboxType::Sarus))
        ));
    }

    #[test]
    fn sandbox_configuration_is_parsed() {
        let db = DeviceDatabase::from_str(DEVICES).unwrap();
        let sandboxes = r#",
            "sandbox-configuration": {
                "sarus": {
                    "devices": ["/dev/infiniband"],
                    "mounts": ["/scratch"],
                    "mount_filesystem": ["/home/{user}"],
                    "env": {"LD_LIBRARY_PATH": "/usr/lib64"},
                    "user": "svc",
                    "name": "ember-executor"
                }
            }"#;
        let content = config(r#", "sandbox_type": "sarus""#, sandboxes);
        let settings = Settings::from_json(&content, &db).unwrap();
        let sarus = &settings.sandboxes[&SandboxType::Sarus];
        assert_eq!(sarus.user, "svc");

        let mut args = Vec::new();
        sarus.generate_args(&mut args, &sarus.user);
        assert_eq!(
            args,
            vec![
                "--device=/dev/infiniband",
                "--mount=type=bind,source=/home/svc,destination=/home/svc",
                "--mount=type=bind,source=/scratch,destination=/scratch",
                "-e",
                "LD_LIBRARY_PATH=/usr/lib64",
            ]
        );
    }
}
