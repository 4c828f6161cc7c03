//! Plain-data types exchanged between clients, the executor manager, and
//! spawned executors. Everything here is either a fixed-layout wire record
//! written through one-sided RDMA or a serde type loaded from JSON; nothing
//! touches the verbs library.
use bitflags::bitflags;
use thiserror::Error;

pub mod allocation;
pub mod devices;
pub mod node;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("descriptor count {0} exceeds the private-data capacity")]
    TooManyDescriptors(usize),
    #[error("listen address is not null-terminated ASCII")]
    BadAddress,
}

bitflags! {
    /// Memory-region access rights requested at registration time.
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b0001;
        const REMOTE_WRITE = 0b0010;
        const REMOTE_READ = 0b0100;
        const REMOTE_ATOMIC = 0b1000;
    }
}

/// An advisory descriptor of a peer's memory region. The holder never
/// dereferences `addr` locally; it is only ever handed back to the NIC as
/// the target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBuffer {
    pub addr: u64,
    pub rkey: u32,
    pub size: u32,
}

impl RemoteBuffer {
    pub fn new(addr: u64, rkey: u32, size: u32) -> Self {
        RemoteBuffer { addr, rkey, size }
    }
}

/// Well-known descriptor tags used in the connection handshake.
pub mod tags {
    /// The manager's allocation-request slot assigned to this client.
    pub const ALLOCATION_SLOT: u32 = 1;
    /// The client's response buffer, target of status write-backs.
    pub const RESPONSE: u32 = 2;
    /// The manager's accounting word an executor CASes on its first contact.
    pub const ACCOUNTING: u32 = 3;
}

/// Connection credentials handed to a spawned executor so it can report
/// back to the manager that scheduled it. `secret` is a one-time nonce the
/// executor echoes in its first message, letting the manager correlate the
/// process with the allocation request that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerCredentials {
    pub addr: String,
    pub port: u16,
    pub secret: u32,
    pub r_addr: u64,
    pub r_key: u32,
}

/// Encoding of tagged remote-buffer descriptors into the CM private-data
/// block: a u16 count followed by `(addr: u64, rkey: u32, size: u32,
/// tag: u32)` records, native byte order. RC private data is small, so the
/// count is capped; two descriptors cover every handshake in the protocol.
pub mod private_data {
    use super::{DecodeError, RemoteBuffer};

    pub const MAX_DESCRIPTORS: usize = 2;
    const RECORD_BYTES: usize = 20;

    pub fn encoded_len(count: usize) -> usize {
        2 + count * RECORD_BYTES
    }

    pub fn encode(descriptors: &[(u32, RemoteBuffer)]) -> Result<Vec<u8>, DecodeError> {
        if descriptors.len() > MAX_DESCRIPTORS {
            return Err(DecodeError::TooManyDescriptors(descriptors.len()));
        }
        let mut out = Vec::with_capacity(encoded_len(descriptors.len()));
        out.extend_from_slice(&(descriptors.len() as u16).to_ne_bytes());
        for (tag, buf) in descriptors {
            out.extend_from_slice(&buf.addr.to_ne_bytes());
            out.extend_from_slice(&buf.rkey.to_ne_bytes());
            out.extend_from_slice(&buf.size.to_ne_bytes());
            out.extend_from_slice(&tag.to_ne_bytes());
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Vec<(u32, RemoteBuffer)>, DecodeError> {
        if data.len() < 2 {
            return Err(DecodeError::Truncated {
                need: 2,
                have: data.len(),
            });
        }
        let count = u16::from_ne_bytes([data[0], data[1]]) as usize;
        if count > MAX_DESCRIPTORS {
            return Err(DecodeError::TooManyDescriptors(count));
        }
        let need = encoded_len(count);
        if data.len() < need {
            return Err(DecodeError::Truncated {
                need,
                have: data.len(),
            });
        }
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let rec = &data[2 + i * RECORD_BYTES..2 + (i + 1) * RECORD_BYTES];
            let addr = u64::from_ne_bytes(rec[0..8].try_into().unwrap());
            let rkey = u32::from_ne_bytes(rec[8..12].try_into().unwrap());
            let size = u32::from_ne_bytes(rec[12..16].try_into().unwrap());
            let tag = u32::from_ne_bytes(rec[16..20].try_into().unwrap());
            out.push((tag, RemoteBuffer { addr, rkey, size }));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_data_roundtrip() {
        let descriptors = vec![
            (tags::ALLOCATION_SLOT, RemoteBuffer::new(0xdead_beef_0000, 42, 256)),
            (tags::RESPONSE, RemoteBuffer::new(0x1000, 7, 64)),
        ];
        let encoded = private_data::encode(&descriptors).unwrap();
        assert_eq!(encoded.len(), private_data::encoded_len(2));
        let decoded = private_data::decode(&encoded).unwrap();
        assert_eq!(decoded, descriptors);
    }

    #[test]
    fn private_data_empty() {
        let encoded = private_data::encode(&[]).unwrap();
        assert_eq!(encoded.len(), 2);
        assert!(private_data::decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn private_data_rejects_short_input() {
        let descriptors = vec![(tags::RESPONSE, RemoteBuffer::new(1, 2, 3))];
        let mut encoded = private_data::encode(&descriptors).unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            private_data::decode(&encoded),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn private_data_rejects_oversized_count() {
        let many = vec![(0u32, RemoteBuffer::new(0, 0, 0)); 3];
        assert!(matches!(
            private_data::encode(&many),
            Err(DecodeError::TooManyDescriptors(3))
        ));
    }
}
