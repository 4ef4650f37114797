//! Callback indications.
//!
//! Every engine-to-application notification is one [`TrdpEvent`]
//! variant, dispatched from the scheduler thread after the engine lock
//! has been released. Blocking inside a callback therefore stalls the
//! scheduler; callbacks may re-enter the session only through the
//! documented `reply`/`reply_query`/`confirm`/`put` operations.

use std::net::{Ipv4Addr, SocketAddr};

use trdp_proto::{MsgType, SessionId, Uri};

use crate::registry::{LsnHandle, SubHandle};

/// Result code mirrored into indications, matching the operation-level
/// error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    /// Receive, reply or confirm deadline expired.
    Timeout,
    /// TCP connection dropped before the exchange finished.
    NoConn,
    /// Session closed while the exchange was still in flight.
    Aborted,
    /// The peer answered with an `Me` error frame.
    RemoteError,
}

/// Wire-side facts about a delivered PD sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdInfo {
    pub com_id: u32,
    pub sequence_counter: u32,
    pub msg_type: MsgType,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Wire-side facts about an MD message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdInfo {
    pub session_id: SessionId,
    pub com_id: u32,
    pub msg_type: MsgType,
    pub peer: SocketAddr,
    pub source_uri: Uri,
    pub destination_uri: Uri,
}

/// A queued application notification.
#[derive(Debug)]
pub enum TrdpEvent {
    /// Fresh sample for a push-mode subscription.
    PdData {
        sub: SubHandle,
        info: PdInfo,
        payload: Vec<u8>,
    },
    /// A subscription's receive timeout fired. Reported exactly once
    /// per data gap, at the moment it first elapses.
    PdTimeout { sub: SubHandle, com_id: u32 },
    /// An inbound request or notification matched a listener.
    MdIndication {
        listener: LsnHandle,
        info: MdInfo,
        payload: Vec<u8>,
    },
    /// A reply arrived for a request this session initiated.
    /// `result` is [`ResultCode::RemoteError`] for an `Me` frame.
    MdReply {
        info: MdInfo,
        payload: Vec<u8>,
        result: ResultCode,
    },
    /// A confirmation arrived for a reply-query this session sent.
    /// `listener` names the responder-side listener that owns the
    /// transaction.
    MdConfirm {
        listener: Option<LsnHandle>,
        info: MdInfo,
    },
    /// A transaction ended without its expected peer message.
    /// `listener` is set when the failing side is a responder.
    MdFailed {
        listener: Option<LsnHandle>,
        session_id: SessionId,
        com_id: u32,
        result: ResultCode,
    },
}
