//! The MD session table: per-transaction state machines correlated by
//! sessionId, with listener matching, retries, timeouts and a reaper
//! that absorbs duplicate traffic after a transaction completes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace, warn};

use trdp_proto::frame::encode_md;
use trdp_proto::{MdHeader, MsgType, SessionId, Uri};

use crate::error::{TrdpError, TrdpResult};
use crate::event::{MdInfo, ResultCode, TrdpEvent};
use crate::fingerprint::Fingerprint;
use crate::md::session_id::SessionIdGen;
use crate::registry::{LsnHandle, Registry};
use crate::stats::MdStatistics;

/// How long a finished transaction lingers to absorb duplicates.
const REAP_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePattern {
    Notify,
    RequestReply,
    RequestReplyConfirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdState {
    /// Allocated, nothing sent yet.
    Idle,
    /// Request handed to the mux.
    Sent,
    /// Initiator waiting for `Mp`/`Mq`.
    AwaitReply,
    /// Responder holding a request, waiting for the application's reply.
    Received,
    /// Responder reply in flight.
    Replying,
    /// Waiting for `Mc` (responder) or for the application's confirm
    /// call (initiator).
    AwaitConfirm,
    Done,
    TimedOut,
    Aborted,
}

impl MdState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MdState::Done | MdState::TimedOut | MdState::Aborted)
    }
}

/// A registered server-side pattern that materializes responder sessions.
pub struct Listener {
    pub pattern: Fingerprint,
    /// Destination-URI filter; the all-zero URI matches any.
    pub dest_uri: Uri,
    /// Whether a callback is installed for this listener.
    pub push: bool,
}

/// One transaction.
pub struct MdSession {
    pub id: SessionId,
    pub role: MdRole,
    pub pattern: ExchangePattern,
    pub com_id: u32,
    pub peer: SocketAddr,
    pub transport: Transport,
    pub state: MdState,
    pub retries_left: u32,
    pub reply_timeout: Duration,
    /// Next state deadline: reply or confirm, when armed.
    pub deadline: Option<Instant>,
    /// Encoded request kept for retransmission.
    request_wire: Vec<u8>,
    /// Last reply sent by a responder, replayed on duplicate requests.
    last_reply_wire: Option<Vec<u8>>,
    /// Listener that materialized this responder session.
    pub listener: Option<LsnHandle>,
    pub source_uri: Uri,
    pub destination_uri: Uri,
    reap_at: Option<Instant>,
}

impl MdSession {
    fn finish(&mut self, state: MdState, now: Instant) {
        self.state = state;
        self.deadline = None;
        self.reap_at = Some(now + REAP_DELAY);
    }

    fn info(&self, msg_type: MsgType) -> MdInfo {
        MdInfo {
            session_id: self.id,
            com_id: self.com_id,
            msg_type,
            peer: self.peer,
            source_uri: self.source_uri,
            destination_uri: self.destination_uri,
        }
    }
}

/// An encoded MD frame ready for the mux.
#[derive(Debug)]
pub struct MdSend {
    pub peer: SocketAddr,
    pub transport: Transport,
    pub frame: Vec<u8>,
}

pub struct MdTable {
    sessions: HashMap<SessionId, MdSession>,
    pub listeners: Registry<Listener>,
    id_gen: SessionIdGen,
    sequence_counter: u32,
    /// Topology counters stamped on outbound frames.
    pub etb_topo_count: u32,
    pub op_trn_topo_count: u32,
    /// Source URI stamped on outbound frames.
    pub host_uri: Uri,
}

impl MdTable {
    pub fn new(rng: &mut dyn RngCore) -> Self {
        MdTable {
            sessions: HashMap::new(),
            listeners: Registry::new(),
            id_gen: SessionIdGen::new(rng),
            sequence_counter: 0,
            etb_topo_count: 0,
            op_trn_topo_count: 0,
            host_uri: Uri::ANY,
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<&MdSession> {
        self.sessions.get(id)
    }

    pub fn live_sessions_on(&self, peer: SocketAddr) -> usize {
        self.sessions
            .values()
            .filter(|s| s.transport == Transport::Tcp && s.peer == peer && !s.state.is_terminal())
            .count()
    }

    /// Snapshot of live TCP-bound sessions per peer, consumed by the
    /// idle reaper without holding the engine lock.
    pub fn tcp_session_counts(&self) -> HashMap<SocketAddr, usize> {
        let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
        for s in self.sessions.values() {
            if s.transport == Transport::Tcp && !s.state.is_terminal() {
                *counts.entry(s.peer).or_insert(0) += 1;
            }
        }
        counts
    }

    fn next_seq(&mut self) -> u32 {
        self.sequence_counter = self.sequence_counter.wrapping_add(1);
        self.sequence_counter
    }

    fn encode(
        &mut self,
        msg_type: MsgType,
        com_id: u32,
        session_id: SessionId,
        reply_timeout: Duration,
        destination_uri: Uri,
        payload: &[u8],
    ) -> TrdpResult<Vec<u8>> {
        let mut header = MdHeader::new(msg_type, com_id, session_id);
        header.sequence_counter = self.next_seq();
        header.etb_topo_count = self.etb_topo_count;
        header.op_trn_topo_count = self.op_trn_topo_count;
        header.reply_timeout = reply_timeout.as_micros().min(u128::from(u32::MAX)) as u32;
        header.source_uri = self.host_uri;
        header.destination_uri = destination_uri;
        encode_md(&header, payload).map_err(TrdpError::from)
    }

    /// Fire-and-forget notification: no session state, nil sessionId.
    pub fn notify(
        &mut self,
        com_id: u32,
        peer: SocketAddr,
        transport: Transport,
        destination_uri: Uri,
        payload: &[u8],
    ) -> TrdpResult<MdSend> {
        let frame = self.encode(
            MsgType::Mn,
            com_id,
            SessionId::NIL,
            Duration::ZERO,
            destination_uri,
            payload,
        )?;
        Ok(MdSend {
            peer,
            transport,
            frame,
        })
    }

    /// Opens an initiator transaction and produces the request frame.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        com_id: u32,
        peer: SocketAddr,
        transport: Transport,
        destination_uri: Uri,
        payload: &[u8],
        reply_timeout: Duration,
        retries: u32,
        unix_ms: i64,
        now: Instant,
    ) -> TrdpResult<(SessionId, MdSend)> {
        if reply_timeout.is_zero() {
            return Err(TrdpError::Param);
        }
        let id = self.id_gen.next(unix_ms);
        let frame = self.encode(
            MsgType::Mr,
            com_id,
            id,
            reply_timeout,
            destination_uri,
            payload,
        )?;
        // The frame is handed to the mux by the caller in the same
        // mutation window, so the session never rests in Idle or Sent.
        let session = MdSession {
            id,
            role: MdRole::Initiator,
            pattern: ExchangePattern::RequestReply,
            com_id,
            peer,
            transport,
            state: MdState::AwaitReply,
            retries_left: retries,
            reply_timeout,
            deadline: Some(now + reply_timeout),
            request_wire: frame.clone(),
            last_reply_wire: None,
            listener: None,
            source_uri: self.host_uri,
            destination_uri,
            reap_at: None,
        };
        self.sessions.insert(id, session);
        trace!(session = %id, com_id, "request opened");
        Ok((
            id,
            MdSend {
                peer,
                transport,
                frame,
            },
        ))
    }

    /// Responder reply without confirmation; closes the transaction.
    pub fn reply(&mut self, id: SessionId, payload: &[u8], now: Instant) -> TrdpResult<MdSend> {
        self.respond(id, MsgType::Mp, payload, None, now)
    }

    /// Responder reply requiring an `Mc` within `confirm_timeout`.
    pub fn reply_query(
        &mut self,
        id: SessionId,
        payload: &[u8],
        confirm_timeout: Duration,
        now: Instant,
    ) -> TrdpResult<MdSend> {
        if confirm_timeout.is_zero() {
            return Err(TrdpError::Param);
        }
        self.respond(id, MsgType::Mq, payload, Some(confirm_timeout), now)
    }

    fn respond(
        &mut self,
        id: SessionId,
        msg_type: MsgType,
        payload: &[u8],
        confirm_timeout: Option<Duration>,
        now: Instant,
    ) -> TrdpResult<MdSend> {
        let (com_id, peer, transport, requester_uri) = {
            let session = self.sessions.get(&id).ok_or(TrdpError::NoSub)?;
            if session.role != MdRole::Responder || session.state != MdState::Received {
                return Err(TrdpError::Param);
            }
            (
                session.com_id,
                session.peer,
                session.transport,
                session.source_uri,
            )
        };
        let frame = self.encode(
            msg_type,
            com_id,
            id,
            confirm_timeout.unwrap_or(Duration::ZERO),
            requester_uri,
            payload,
        )?;
        let session = self.sessions.get_mut(&id).ok_or(TrdpError::NoSub)?;
        session.state = MdState::Replying;
        session.last_reply_wire = Some(frame.clone());
        match confirm_timeout {
            Some(timeout) => {
                session.state = MdState::AwaitConfirm;
                session.deadline = Some(now + timeout);
            }
            None => session.finish(MdState::Done, now),
        }
        Ok(MdSend {
            peer,
            transport,
            frame,
        })
    }

    /// Initiator confirmation of a reply-query; closes the transaction.
    pub fn confirm(&mut self, id: SessionId, now: Instant) -> TrdpResult<MdSend> {
        let (com_id, peer, transport, destination_uri) = {
            let session = self.sessions.get(&id).ok_or(TrdpError::NoSub)?;
            if session.role != MdRole::Initiator || session.state != MdState::AwaitConfirm {
                return Err(TrdpError::Param);
            }
            (
                session.com_id,
                session.peer,
                session.transport,
                session.destination_uri,
            )
        };
        let frame = self.encode(MsgType::Mc, com_id, id, Duration::ZERO, destination_uri, &[])?;
        let session = self.sessions.get_mut(&id).ok_or(TrdpError::NoSub)?;
        session.finish(MdState::Done, now);
        Ok(MdSend {
            peer,
            transport,
            frame,
        })
    }

    /// Dispatches one decoded inbound MD frame.
    #[allow(clippy::too_many_arguments)]
    pub fn on_frame(
        &mut self,
        header: &MdHeader,
        payload: &[u8],
        peer: SocketAddr,
        via: Transport,
        actual: &Fingerprint,
        now: Instant,
        stats: &mut MdStatistics,
    ) -> (Vec<MdSend>, Vec<TrdpEvent>) {
        let mut sends = Vec::new();
        let mut events = Vec::new();
        stats.received += 1;

        match header.msg_type {
            MsgType::Mn => {
                let mut matched = false;
                for (handle, listener) in self.listeners.iter() {
                    if listener.pattern.accepts(actual)
                        && listener.dest_uri.accepts(&header.destination_uri)
                    {
                        matched = true;
                        if listener.push {
                            events.push(TrdpEvent::MdIndication {
                                listener: LsnHandle(handle),
                                info: MdInfo {
                                    session_id: SessionId::NIL,
                                    com_id: header.com_id,
                                    msg_type: MsgType::Mn,
                                    peer,
                                    source_uri: header.source_uri,
                                    destination_uri: header.destination_uri,
                                },
                                payload: payload.to_vec(),
                            });
                        }
                    }
                }
                if !matched {
                    stats.no_listener_drops += 1;
                }
            }
            MsgType::Mr => {
                self.on_request(header, payload, peer, via, actual, now, stats, &mut sends, &mut events);
            }
            MsgType::Mp | MsgType::Mq => {
                self.on_reply(header, payload, peer, now, &mut events);
            }
            MsgType::Mc => {
                if let Some(session) = self.sessions.get_mut(&header.session_id) {
                    if session.role == MdRole::Responder
                        && session.state == MdState::AwaitConfirm
                    {
                        session.finish(MdState::Done, now);
                        events.push(TrdpEvent::MdConfirm {
                            listener: session.listener,
                            info: session.info(MsgType::Mc),
                        });
                    }
                } else {
                    trace!(session = %header.session_id, "confirm for unknown session dropped");
                }
            }
            MsgType::Me => {
                if let Some(session) = self.sessions.get_mut(&header.session_id) {
                    if !session.state.is_terminal() {
                        session.finish(MdState::Done, now);
                        events.push(TrdpEvent::MdFailed {
                            listener: session.listener,
                            session_id: header.session_id,
                            com_id: header.com_id,
                            result: ResultCode::RemoteError,
                        });
                    }
                }
            }
            // PD magics cannot reach the MD table.
            _ => {}
        }
        (sends, events)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request(
        &mut self,
        header: &MdHeader,
        payload: &[u8],
        peer: SocketAddr,
        via: Transport,
        actual: &Fingerprint,
        now: Instant,
        stats: &mut MdStatistics,
        sends: &mut Vec<MdSend>,
        events: &mut Vec<TrdpEvent>,
    ) {
        if let Some(session) = self.sessions.get(&header.session_id) {
            // Duplicate of a transaction we already hold. If our reply
            // was lost, replay it; otherwise absorb silently.
            if let Some(wire) = &session.last_reply_wire {
                debug!(session = %header.session_id, "replaying reply for duplicate request");
                sends.push(MdSend {
                    peer,
                    transport: via,
                    frame: wire.clone(),
                });
            }
            return;
        }

        let matched = self.listeners.iter().find(|(_, l)| {
            l.pattern.accepts(actual) && l.dest_uri.accepts(&header.destination_uri)
        });
        let (handle, push) = match matched {
            Some((h, l)) => (LsnHandle(h), l.push),
            None => {
                stats.no_listener_drops += 1;
                warn!(com_id = header.com_id, "no listener for request, answering Me");
                if let Ok(frame) = self.encode(
                    MsgType::Me,
                    header.com_id,
                    header.session_id,
                    Duration::ZERO,
                    header.source_uri,
                    &[],
                ) {
                    sends.push(MdSend {
                        peer,
                        transport: via,
                        frame,
                    });
                }
                return;
            }
        };

        let session = MdSession {
            id: header.session_id,
            role: MdRole::Responder,
            pattern: ExchangePattern::RequestReply,
            com_id: header.com_id,
            peer,
            transport: via,
            state: MdState::Received,
            retries_left: 0,
            reply_timeout: Duration::from_micros(u64::from(header.reply_timeout)),
            deadline: None,
            request_wire: Vec::new(),
            last_reply_wire: None,
            listener: Some(handle),
            source_uri: header.source_uri,
            destination_uri: header.destination_uri,
            reap_at: None,
        };
        let info = session.info(MsgType::Mr);
        self.sessions.insert(header.session_id, session);
        if push {
            events.push(TrdpEvent::MdIndication {
                listener: handle,
                info,
                payload: payload.to_vec(),
            });
        }
    }

    fn on_reply(
        &mut self,
        header: &MdHeader,
        payload: &[u8],
        peer: SocketAddr,
        now: Instant,
        events: &mut Vec<TrdpEvent>,
    ) {
        let session = match self.sessions.get_mut(&header.session_id) {
            Some(s) => s,
            None => {
                trace!(session = %header.session_id, "reply for unknown session dropped");
                return;
            }
        };
        if session.role != MdRole::Initiator || session.state != MdState::AwaitReply {
            return;
        }
        let mut info = session.info(header.msg_type);
        info.peer = peer;
        info.source_uri = header.source_uri;
        match header.msg_type {
            MsgType::Mp => {
                session.finish(MdState::Done, now);
            }
            MsgType::Mq => {
                session.pattern = ExchangePattern::RequestReplyConfirm;
                session.state = MdState::AwaitConfirm;
                // The confirm is owed by our application; the peer's
                // confirm timeout polices it.
                session.deadline = None;
            }
            _ => unreachable!(),
        }
        events.push(TrdpEvent::MdReply {
            info,
            payload: payload.to_vec(),
            result: ResultCode::Ok,
        });
    }

    /// The earliest reply/confirm deadline or reap time.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| match (s.deadline, s.reap_at) {
                (Some(d), _) => Some(d),
                (None, Some(r)) => Some(r),
                (None, None) => None,
            })
            .min()
    }

    /// Sweeps timeouts: retries requests with budget left, fails
    /// exhausted or unconfirmed transactions, reaps finished ones.
    pub fn sweep(&mut self, now: Instant, stats: &mut MdStatistics) -> (Vec<MdSend>, Vec<TrdpEvent>) {
        let mut sends = Vec::new();
        let mut events = Vec::new();

        for session in self.sessions.values_mut() {
            match session.deadline {
                Some(d) if d <= now => {}
                _ => continue,
            }
            match session.state {
                MdState::AwaitReply => {
                    if session.retries_left > 0 {
                        session.retries_left -= 1;
                        session.deadline = Some(now + session.reply_timeout);
                        stats.retries += 1;
                        debug!(session = %session.id, left = session.retries_left, "retrying request");
                        sends.push(MdSend {
                            peer: session.peer,
                            transport: session.transport,
                            frame: session.request_wire.clone(),
                        });
                    } else {
                        stats.reply_timeouts += 1;
                        session.finish(MdState::TimedOut, now);
                        events.push(TrdpEvent::MdFailed {
                            listener: session.listener,
                            session_id: session.id,
                            com_id: session.com_id,
                            result: ResultCode::Timeout,
                        });
                    }
                }
                MdState::AwaitConfirm => {
                    stats.confirm_timeouts += 1;
                    session.finish(MdState::TimedOut, now);
                    events.push(TrdpEvent::MdFailed {
                        listener: session.listener,
                        session_id: session.id,
                        com_id: session.com_id,
                        result: ResultCode::Timeout,
                    });
                }
                _ => {}
            }
        }

        self.sessions
            .retain(|_, s| !matches!(s.reap_at, Some(r) if r <= now));
        (sends, events)
    }

    /// Fails every live transaction bound to a dropped TCP connection.
    pub fn on_conn_closed(&mut self, peer: SocketAddr, now: Instant) -> Vec<TrdpEvent> {
        let mut events = Vec::new();
        for session in self.sessions.values_mut() {
            if session.transport == Transport::Tcp
                && session.peer == peer
                && !session.state.is_terminal()
            {
                session.finish(MdState::Aborted, now);
                events.push(TrdpEvent::MdFailed {
                    listener: session.listener,
                    session_id: session.id,
                    com_id: session.com_id,
                    result: ResultCode::NoConn,
                });
            }
        }
        events
    }

    /// Drains every unfinished transaction to `Aborted` without network
    /// traffic. Used at session close; no callbacks fire afterwards.
    pub fn abort_all(&mut self) -> usize {
        let mut n = 0;
        for session in self.sessions.values_mut() {
            if !session.state.is_terminal() {
                session.state = MdState::Aborted;
                session.deadline = None;
                n += 1;
            }
        }
        self.sessions.clear();
        n
    }
}
