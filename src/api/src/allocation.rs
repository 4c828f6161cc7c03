//! The allocation-request record a client writes into the manager's
//! pre-advertised receive slot. Fixed layout, native byte order: both ends
//! sit on the same homogeneous fabric, and the record is deposited by a
//! one-sided write, so there is no negotiation step that could reorder it.
use crate::DecodeError;

/// Maximum length of the null-padded ASCII listen address.
pub const ADDRESS_BYTES: usize = 16;

/// Total serialized size. Small enough to travel as a single inline send.
pub const REQUEST_BYTES: usize = ADDRESS_BYTES + 2 + 2 + 4 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// IPv4 address the client's passive endpoint listens on.
    pub listen_address: String,
    pub listen_port: u16,
    /// Cores requested; admission is gated on this.
    pub cores: i16,
    /// How long the spawned executor stays hot with no invocations.
    pub hot_timeout_ms: i32,
    pub input_buf_size: i32,
    pub func_buf_size: i32,
}

impl AllocationRequest {
    pub fn to_bytes(&self) -> Result<[u8; REQUEST_BYTES], DecodeError> {
        if !self.listen_address.is_ascii() || self.listen_address.len() >= ADDRESS_BYTES {
            return Err(DecodeError::BadAddress);
        }
        let mut out = [0u8; REQUEST_BYTES];
        out[..self.listen_address.len()].copy_from_slice(self.listen_address.as_bytes());
        let mut off = ADDRESS_BYTES;
        out[off..off + 2].copy_from_slice(&self.listen_port.to_ne_bytes());
        off += 2;
        out[off..off + 2].copy_from_slice(&self.cores.to_ne_bytes());
        off += 2;
        out[off..off + 4].copy_from_slice(&self.hot_timeout_ms.to_ne_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.input_buf_size.to_ne_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.func_buf_size.to_ne_bytes());
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < REQUEST_BYTES {
            return Err(DecodeError::Truncated {
                need: REQUEST_BYTES,
                have: data.len(),
            });
        }
        let addr_raw = &data[..ADDRESS_BYTES];
        let end = addr_raw.iter().position(|&b| b == 0).unwrap_or(ADDRESS_BYTES);
        let listen_address = std::str::from_utf8(&addr_raw[..end])
            .map_err(|_| DecodeError::BadAddress)?
            .to_owned();
        if !listen_address.is_ascii() {
            return Err(DecodeError::BadAddress);
        }
        let mut off = ADDRESS_BYTES;
        let listen_port = u16::from_ne_bytes(data[off..off + 2].try_into().unwrap());
        off += 2;
        let cores = i16::from_ne_bytes(data[off..off + 2].try_into().unwrap());
        off += 2;
        let hot_timeout_ms = i32::from_ne_bytes(data[off..off + 4].try_into().unwrap());
        off += 4;
        let input_buf_size = i32::from_ne_bytes(data[off..off + 4].try_into().unwrap());
        off += 4;
        let func_buf_size = i32::from_ne_bytes(data[off..off + 4].try_into().unwrap());
        Ok(AllocationRequest {
            listen_address,
            listen_port,
            cores,
            hot_timeout_ms,
            input_buf_size,
            func_buf_size,
        })
    }
}

/// Status word written back into the client's response buffer. Negative
/// values are rejections; positive values acknowledge the allocation.
pub mod status {
    pub const ACCEPTED: i32 = 1;
    pub const REJECTED_NO_CORES: i32 = -1;
    pub const REJECTED_SPAWN_FAILED: i32 = -2;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AllocationRequest {
        AllocationRequest {
            listen_address: "127.0.0.1".to_owned(),
            listen_port: 20000,
            cores: 4,
            hot_timeout_ms: 5000,
            input_buf_size: 1024,
            func_buf_size: 4096,
        }
    }

    #[test]
    fn roundtrip() {
        let req = request();
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), REQUEST_BYTES);
        assert_eq!(AllocationRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn address_is_null_padded() {
        let bytes = request().to_bytes().unwrap();
        assert_eq!(&bytes[..9], b"127.0.0.1");
        assert!(bytes[9..ADDRESS_BYTES].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_address_rejected() {
        let mut req = request();
        req.listen_address = "255.255.255.255x".to_owned();
        assert!(matches!(req.to_bytes(), Err(DecodeError::BadAddress)));
    }

    #[test]
    fn short_input_rejected() {
        let bytes = request().to_bytes().unwrap();
        assert!(AllocationRequest::from_bytes(&bytes[..REQUEST_BYTES - 1]).is_err());
    }
}
