//! # TRDP wire codec
//!
//! Encoding and decoding of Train Real-time Data Protocol frames.
//!
//! A frame on the wire is `header || payload || payload FCS`. Process
//! data (PD) frames carry a 40-byte header, message data (MD) frames a
//! 116-byte header; both end in a 32-bit header FCS computed over the
//! preceding header bytes. All multi-byte fields are network byte order.
//!
//! The codec is stateless and endian-agnostic: any accepted frame
//! round-trips bit-exactly, and corrupt input is rejected with a
//! [`WireError`] rather than propagated upward.

pub mod constants;
pub mod crc;
pub mod error;
pub mod frame;
pub mod header;

pub use constants::{
    FCS_SIZE, MD_HEADER_SIZE, MD_MAX_PAYLOAD, PD_HEADER_SIZE, PD_MAX_PAYLOAD, PROTO_VERSION,
};
pub use crc::safety_crc;
pub use error::WireError;
pub use frame::{md_wire_len, Frame};
pub use header::{topo_accepted, MdHeader, MsgType, PdHeader, SessionId, Uri};
