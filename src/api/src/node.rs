//! The record an executor manager sends to the resource manager: on
//! registration and whenever its lease accounting changes. Fixed layout,
//! native byte order, small enough for an inline send.
use crate::DecodeError;

pub const STATUS_BYTES: usize = 4 + 2 + 2 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    /// Shared secret from the configuration; the resource manager drops
    /// announcements that do not carry it.
    pub secret: u32,
    /// Port the manager's passive endpoint listens on.
    pub port: u16,
    pub cores_free: i16,
    pub executors_active: u16,
}

impl NodeStatus {
    pub fn to_bytes(&self) -> [u8; STATUS_BYTES] {
        let mut out = [0u8; STATUS_BYTES];
        out[0..4].copy_from_slice(&self.secret.to_ne_bytes());
        out[4..6].copy_from_slice(&self.port.to_ne_bytes());
        out[6..8].copy_from_slice(&self.cores_free.to_ne_bytes());
        out[8..10].copy_from_slice(&self.executors_active.to_ne_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < STATUS_BYTES {
            return Err(DecodeError::Truncated {
                need: STATUS_BYTES,
                have: data.len(),
            });
        }
        Ok(NodeStatus {
            secret: u32::from_ne_bytes(data[0..4].try_into().unwrap()),
            port: u16::from_ne_bytes(data[4..6].try_into().unwrap()),
            cores_free: i16::from_ne_bytes(data[6..8].try_into().unwrap()),
            executors_active: u16::from_ne_bytes(data[8..10].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let status = NodeStatus {
            secret: 0x5eed,
            port: 10000,
            cores_free: -3,
            executors_active: 12,
        };
        let bytes = status.to_bytes();
        assert_eq!(NodeStatus::from_bytes(&bytes).unwrap(), status);
    }
}
