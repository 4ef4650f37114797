//! Fixed header layouts for both traffic planes.

use std::fmt;
use std::net::Ipv4Addr;

use crate::constants::{PROTO_VERSION, SESSION_ID_LEN, URI_LEN};

/// The two-ASCII-byte message type magic, transmitted as a big-endian u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    /// PD data (cyclic push).
    Pd = 0x5064,
    /// PD reply (pull response).
    Pp = 0x5070,
    /// PD request (pull).
    Pr = 0x5072,
    /// MD notification (fire-and-forget).
    Mn = 0x4d6e,
    /// MD request expecting a reply.
    Mr = 0x4d72,
    /// MD reply without confirmation.
    Mp = 0x4d70,
    /// MD reply query (confirmation required).
    Mq = 0x4d71,
    /// MD confirmation.
    Mc = 0x4d63,
    /// MD error.
    Me = 0x4d65,
}

impl MsgType {
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0x5064 => Some(MsgType::Pd),
            0x5070 => Some(MsgType::Pp),
            0x5072 => Some(MsgType::Pr),
            0x4d6e => Some(MsgType::Mn),
            0x4d72 => Some(MsgType::Mr),
            0x4d70 => Some(MsgType::Mp),
            0x4d71 => Some(MsgType::Mq),
            0x4d63 => Some(MsgType::Mc),
            0x4d65 => Some(MsgType::Me),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }

    /// True for the three process-data magics (40-byte header).
    pub fn is_pd(self) -> bool {
        matches!(self, MsgType::Pd | MsgType::Pp | MsgType::Pr)
    }

    /// True for the six message-data magics (116-byte header).
    pub fn is_md(self) -> bool {
        !self.is_pd()
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.to_wire().to_be_bytes();
        write!(f, "{}{}", raw[0] as char, raw[1] as char)
    }
}

/// 128-bit transaction identifier carried by every MD frame.
///
/// All-zeros is the nil id used by notifications, which have no session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub [u8; SESSION_ID_LEN]);

impl SessionId {
    pub const NIL: SessionId = SessionId([0; SESSION_ID_LEN]);

    pub fn is_nil(&self) -> bool {
        self.0 == [0; SESSION_ID_LEN]
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Fixed-width, zero-padded user URI as carried in MD headers.
///
/// Comparison is byte-exact; the all-zero URI acts as a wildcard in
/// listener patterns.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uri(pub [u8; URI_LEN]);

impl Uri {
    pub const ANY: Uri = Uri([0; URI_LEN]);

    /// Builds a URI from a string, zero-padding to the wire width.
    /// Returns `None` if the string does not fit.
    pub fn new(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() > URI_LEN {
            return None;
        }
        let mut buf = [0u8; URI_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Uri(buf))
    }

    pub fn is_any(&self) -> bool {
        self.0 == [0; URI_LEN]
    }

    /// The URI text up to the first NUL, if valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(URI_LEN);
        std::str::from_utf8(&self.0[..end]).ok()
    }

    /// Listener-pattern match: the zero-length pattern matches anything,
    /// otherwise bytes must be identical.
    pub fn accepts(&self, actual: &Uri) -> bool {
        self.is_any() || self.0 == actual.0
    }
}

impl Default for Uri {
    fn default() -> Self {
        Uri::ANY
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => write!(f, "Uri({:?})", s),
            None => write!(f, "Uri(<binary>)"),
        }
    }
}

/// Topology-epoch acceptance check.
///
/// A packet is accepted when each of its topo counters either matches
/// the expected value or one of the pair is zero (unknown topology).
pub fn topo_accepted(expected: (u32, u32), packet: (u32, u32)) -> bool {
    let ok = |want: u32, got: u32| want == 0 || got == 0 || want == got;
    ok(expected.0, packet.0) && ok(expected.1, packet.1)
}

/// The 40-byte process-data header.
///
/// `dataset_length` is not stored here; it is derived from the payload
/// at encode time and checked at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdHeader {
    pub sequence_counter: u32,
    pub proto_version: u16,
    pub msg_type: MsgType,
    pub com_id: u32,
    pub etb_topo_count: u32,
    pub op_trn_topo_count: u32,
    pub reserved: u32,
    /// ComId the pull reply shall carry; zero for push data.
    pub reply_com_id: u32,
    /// Unicast or multicast address the pull reply shall be sent to;
    /// 0.0.0.0 means "reply to the requester's source address".
    pub reply_ip: Ipv4Addr,
}

impl PdHeader {
    pub fn new(msg_type: MsgType, com_id: u32) -> Self {
        PdHeader {
            sequence_counter: 0,
            proto_version: PROTO_VERSION,
            msg_type,
            com_id,
            etb_topo_count: 0,
            op_trn_topo_count: 0,
            reserved: 0,
            reply_com_id: 0,
            reply_ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// The 116-byte message-data header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdHeader {
    pub sequence_counter: u32,
    pub proto_version: u16,
    pub msg_type: MsgType,
    pub com_id: u32,
    pub etb_topo_count: u32,
    pub op_trn_topo_count: u32,
    pub reserved: u32,
    pub session_id: SessionId,
    /// Reply timeout in microseconds, zero for none.
    pub reply_timeout: u32,
    pub source_uri: Uri,
    pub destination_uri: Uri,
}

impl MdHeader {
    pub fn new(msg_type: MsgType, com_id: u32, session_id: SessionId) -> Self {
        MdHeader {
            sequence_counter: 0,
            proto_version: PROTO_VERSION,
            msg_type,
            com_id,
            etb_topo_count: 0,
            op_trn_topo_count: 0,
            reserved: 0,
            session_id,
            reply_timeout: 0,
            source_uri: Uri::ANY,
            destination_uri: Uri::ANY,
        }
    }
}
