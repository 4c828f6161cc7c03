//! Bindgen output over librdmacm/libibverbs, plus the hand-written pieces
//! bindgen cannot express.
#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

use std::ffi::CStr;
use std::fmt;

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

/// `ibv_wc` is blocklisted in build.rs and defined by hand: the field
/// carrying the immediate is a union with the invalidated rkey, and the
/// accessors below need to know which interpretation is live.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ibv_wc {
    pub wr_id: u64,
    pub status: ibv_wc_status::Type,
    pub opcode: ibv_wc_opcode::Type,
    pub vendor_err: u32,
    pub byte_len: u32,
    /// Union with `invalidated_rkey`; big-endian when it is an immediate.
    imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: ibv_wc_flags,
    pub pkey_index: u16,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
}

impl Default for ibv_wc {
    fn default() -> Self {
        // Plain-old-data record filled in by the NIC; all-zeroes is the
        // "no completion" state.
        unsafe { std::mem::zeroed() }
    }
}

impl ibv_wc {
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    #[inline]
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// The 32-bit immediate attached by the sender, decoded from network
    /// byte order. `None` if this completion carries no immediate.
    #[inline]
    pub fn imm_data(&self) -> Option<u32> {
        if self.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM != ibv_wc_flags(0) {
            Some(u32::from_be(self.imm_data))
        } else {
            None
        }
    }

    pub fn status_str(&self) -> &'static str {
        // ibv_wc_status_str returns a pointer into a static table.
        unsafe { CStr::from_ptr(ibv_wc_status_str(self.status)) }
            .to_str()
            .unwrap_or("<unknown status>")
    }
}

impl fmt::Debug for ibv_wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ibv_wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status_str())
            .field("opcode", &self.opcode)
            .field("byte_len", &self.byte_len)
            .field("imm_data", &self.imm_data())
            .field("qp_num", &self.qp_num)
            .finish()
    }
}
