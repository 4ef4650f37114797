//! Wire-level constants shared by both traffic planes.

/// Protocol version transmitted in every header (major.minor as two bytes).
/// Only the major byte participates in the acceptance check.
pub const PROTO_VERSION: u16 = 0x0100;

/// Default UDP port for process data.
pub const PD_PORT: u16 = 17224;
/// Default UDP and TCP port for message data.
pub const MD_PORT: u16 = 17225;

/// Size of the fixed PD header including its FCS.
pub const PD_HEADER_SIZE: usize = 40;
/// Size of the fixed MD header including its FCS.
pub const MD_HEADER_SIZE: usize = 116;
/// Size of each frame check sequence on the wire.
pub const FCS_SIZE: usize = 4;

/// Largest PD payload that stays fragment-free on a standard Ethernet MTU.
pub const PD_MAX_PAYLOAD: usize = 1432;
/// Largest MD payload: 64 KiB minus the MD header and trailer overhead.
pub const MD_MAX_PAYLOAD: usize = 65536 - MD_HEADER_SIZE - FCS_SIZE;

/// Length of the MD session identifier field.
pub const SESSION_ID_LEN: usize = 16;
/// Length of the MD source/destination URI fields.
pub const URI_LEN: usize = 32;
