//! The per-session engine core.
//!
//! Everything here is sans-IO: operations and inbound frames mutate the
//! indexes and queue outbound work plus application events; the
//! scheduler applies the queued work to the socket mux and dispatches
//! the events once the engine lock is released.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace};

use trdp_proto::frame::encode_pd;
use trdp_proto::{topo_accepted, Frame, MsgType, PdHeader, SessionId, Uri, WireError};

use crate::config::SessionConfig;
use crate::error::{TrdpError, TrdpResult};
use crate::event::{PdInfo, TrdpEvent};
use crate::fingerprint::Fingerprint;
use crate::md::{MdSend, MdTable, Transport};
use crate::pd::{
    GetOutcome, Publication, PublisherIndex, SendCallback, SubscriberIndex, Subscription,
    TimeoutPolicy,
};
use crate::registry::{LsnHandle, PubHandle, Registry, SubHandle};
use crate::stats::Statistics;
use crate::time::TimeProvider;

/// Deferred socket work queued by operations and inbound processing.
#[derive(Debug)]
pub(crate) enum MuxCmd {
    JoinGroup(Ipv4Addr),
    LeaveGroup(Ipv4Addr),
    SendPd { dest: SocketAddrV4, frame: Vec<u8> },
    SendMd(MdSend),
}

pub(crate) struct Engine {
    pub config: SessionConfig,
    pub clock: Arc<dyn TimeProvider>,
    pub pubs: Registry<Publication>,
    pub subs: Registry<Subscription>,
    pub pd_pub: PublisherIndex,
    pub pd_sub: SubscriberIndex,
    pub md: MdTable,
    pub stats: Statistics,
    pub events: VecDeque<TrdpEvent>,
    pub cmds: VecDeque<MuxCmd>,
    pub running: bool,
    /// Sequence counter for locally issued PD pull requests.
    pd_request_seq: u32,
}

impl Engine {
    pub fn new(config: SessionConfig, clock: Arc<dyn TimeProvider>, rng: &mut dyn RngCore) -> Self {
        let now = clock.now_instant();
        let mut pd_pub = PublisherIndex::new(now, config.cycle);
        pd_pub.etb_topo_count = config.etb_topo_count;
        pd_pub.op_trn_topo_count = config.op_trn_topo_count;
        let mut md = MdTable::new(rng);
        md.etb_topo_count = config.etb_topo_count;
        md.op_trn_topo_count = config.op_trn_topo_count;
        md.host_uri = config.host_uri;
        Engine {
            pubs: Registry::with_capacity(config.reserve.publications),
            subs: Registry::with_capacity(config.reserve.subscriptions),
            pd_pub,
            pd_sub: SubscriberIndex::new(),
            md,
            stats: Statistics::default(),
            events: VecDeque::new(),
            cmds: VecDeque::new(),
            running: true,
            pd_request_seq: 0,
            config,
            clock,
        }
    }

    fn ensure_running(&self) -> TrdpResult<()> {
        if self.running {
            Ok(())
        } else {
            Err(TrdpError::Init)
        }
    }

    /// Applies new topology counters to every outbound stamp and to
    /// inbound acceptance.
    pub fn update_topo(&mut self, etb: u32, op_trn: u32) {
        self.config.etb_topo_count = etb;
        self.config.op_trn_topo_count = op_trn;
        self.pd_pub.etb_topo_count = etb;
        self.pd_pub.op_trn_topo_count = op_trn;
        self.md.etb_topo_count = etb;
        self.md.op_trn_topo_count = op_trn;
    }

    // ------------------------------------------------------------------
    // PD operations
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        com_id: u32,
        dest: SocketAddrV4,
        interval: Option<Duration>,
        redundancy_group: Option<u32>,
        payload: &[u8],
        on_send: Option<SendCallback>,
    ) -> TrdpResult<PubHandle> {
        self.ensure_running()?;
        if com_id == 0 || payload.len() > trdp_proto::PD_MAX_PAYLOAD {
            return Err(TrdpError::Param);
        }
        if matches!(interval, Some(i) if i < self.config.cycle) {
            return Err(TrdpError::Param);
        }
        let now = self.clock.now_instant();
        let fingerprint = Fingerprint {
            com_id,
            src: self.config.host_ip,
            dst: *dest.ip(),
            ..Default::default()
        };
        let publication = Publication {
            fingerprint,
            dest,
            interval,
            redundancy_group,
            payload: payload.to_vec(),
            sequence_counter: 0,
            next_emit: now + interval.unwrap_or(Duration::ZERO),
            on_send,
        };
        let handle = PubHandle(self.pubs.insert(publication));
        let publication = self.pubs.get(handle.0).ok_or(TrdpError::Mem)?;
        self.pd_pub.schedule(handle, publication);
        trace!(com_id, ?interval, "published");
        Ok(handle)
    }

    pub fn unpublish(&mut self, handle: PubHandle) -> TrdpResult<()> {
        let publication = self.pubs.remove(handle.0).ok_or(TrdpError::NoPub)?;
        self.pd_pub
            .unschedule(handle, publication.fingerprint.com_id);
        Ok(())
    }

    pub fn put(&mut self, handle: PubHandle, payload: &[u8]) -> TrdpResult<()> {
        self.ensure_running()?;
        self.pd_pub.put(&mut self.pubs, handle, payload)
    }

    pub fn set_redundant(&mut self, group: u32, leader: bool) {
        self.pd_pub.set_redundant(group, leader);
    }

    pub fn subscribe(
        &mut self,
        pattern: Fingerprint,
        timeout: Option<Duration>,
        policy: TimeoutPolicy,
        push: bool,
    ) -> TrdpResult<SubHandle> {
        self.ensure_running()?;
        if self.pd_sub.duplicate_of(&self.subs, &pattern).is_some() {
            return Err(TrdpError::Param);
        }
        // An unnamed timeout takes the session default; an explicit
        // zero disables supervision.
        let timeout = match timeout {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => {
                let d = self.config.pd.default_timeout;
                (!d.is_zero()).then_some(d)
            }
        };
        let mut subscription = Subscription::new(pattern, timeout, policy);
        subscription.push = push;
        let mc_group = (pattern.dst.is_multicast()).then_some(pattern.dst);
        subscription.mc_group = mc_group;
        let handle = SubHandle(self.subs.insert(subscription));
        self.pd_sub.index(handle, &pattern);
        if let Some(group) = mc_group {
            self.cmds.push_back(MuxCmd::JoinGroup(group));
        }
        trace!(com_id = pattern.com_id, "subscribed");
        Ok(handle)
    }

    pub fn unsubscribe(&mut self, handle: SubHandle) -> TrdpResult<()> {
        let subscription = self.subs.remove(handle.0).ok_or(TrdpError::NoSub)?;
        self.pd_sub.unindex(handle, &subscription.pattern);
        if let Some(group) = subscription.mc_group {
            self.cmds.push_back(MuxCmd::LeaveGroup(group));
        }
        Ok(())
    }

    pub fn get(&mut self, handle: SubHandle) -> TrdpResult<GetOutcome> {
        self.ensure_running()?;
        let now = self.clock.now_instant();
        self.pd_sub
            .get(&mut self.subs, handle, now)
            .ok_or(TrdpError::NoSub)
    }

    /// Issues a PD pull request (`Pr`) toward `dest`. The publisher
    /// answers with a `Pp` to `reply_ip` (or to our source address when
    /// unspecified), carrying `reply_com_id` when nonzero.
    pub fn pd_request(
        &mut self,
        com_id: u32,
        dest: SocketAddrV4,
        reply_com_id: u32,
        reply_ip: Ipv4Addr,
    ) -> TrdpResult<()> {
        self.ensure_running()?;
        if com_id == 0 {
            return Err(TrdpError::Param);
        }
        self.pd_request_seq = self.pd_request_seq.wrapping_add(1);
        let mut header = PdHeader::new(MsgType::Pr, com_id);
        header.sequence_counter = self.pd_request_seq;
        header.etb_topo_count = self.config.etb_topo_count;
        header.op_trn_topo_count = self.config.op_trn_topo_count;
        header.reply_com_id = reply_com_id;
        header.reply_ip = reply_ip;
        let frame = encode_pd(&header, &[])?;
        self.cmds.push_back(MuxCmd::SendPd { dest, frame });
        Ok(())
    }

    // ------------------------------------------------------------------
    // MD operations
    // ------------------------------------------------------------------

    pub fn md_notify(
        &mut self,
        com_id: u32,
        peer: SocketAddr,
        transport: Transport,
        destination_uri: Uri,
        payload: &[u8],
    ) -> TrdpResult<()> {
        self.ensure_running()?;
        let send = self
            .md
            .notify(com_id, peer, transport, destination_uri, payload)?;
        self.stats.md.sent += 1;
        self.cmds.push_back(MuxCmd::SendMd(send));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn md_request(
        &mut self,
        com_id: u32,
        peer: SocketAddr,
        transport: Transport,
        destination_uri: Uri,
        payload: &[u8],
        reply_timeout: Option<Duration>,
        retries: Option<u32>,
    ) -> TrdpResult<SessionId> {
        self.ensure_running()?;
        let reply_timeout = reply_timeout.unwrap_or(self.config.md.reply_timeout);
        let retries = retries.unwrap_or(self.config.md.retries);
        let now = self.clock.now_instant();
        let unix_ms = self.clock.now_unix_ms();
        let (id, send) = self.md.request(
            com_id,
            peer,
            transport,
            destination_uri,
            payload,
            reply_timeout,
            retries,
            unix_ms,
            now,
        )?;
        self.stats.md.sent += 1;
        self.cmds.push_back(MuxCmd::SendMd(send));
        Ok(id)
    }

    pub fn md_reply(&mut self, id: SessionId, payload: &[u8]) -> TrdpResult<()> {
        self.ensure_running()?;
        let now = self.clock.now_instant();
        let send = self.md.reply(id, payload, now)?;
        self.stats.md.sent += 1;
        self.cmds.push_back(MuxCmd::SendMd(send));
        Ok(())
    }

    pub fn md_reply_query(
        &mut self,
        id: SessionId,
        payload: &[u8],
        confirm_timeout: Option<Duration>,
    ) -> TrdpResult<()> {
        self.ensure_running()?;
        let confirm_timeout = confirm_timeout.unwrap_or(self.config.md.confirm_timeout);
        let now = self.clock.now_instant();
        let send = self.md.reply_query(id, payload, confirm_timeout, now)?;
        self.stats.md.sent += 1;
        self.cmds.push_back(MuxCmd::SendMd(send));
        Ok(())
    }

    pub fn md_confirm(&mut self, id: SessionId) -> TrdpResult<()> {
        self.ensure_running()?;
        let now = self.clock.now_instant();
        let send = self.md.confirm(id, now)?;
        self.stats.md.sent += 1;
        self.cmds.push_back(MuxCmd::SendMd(send));
        Ok(())
    }

    pub fn add_listener(
        &mut self,
        pattern: Fingerprint,
        dest_uri: Uri,
        push: bool,
    ) -> TrdpResult<LsnHandle> {
        self.ensure_running()?;
        let listener = crate::md::Listener {
            pattern,
            dest_uri,
            push,
        };
        Ok(LsnHandle(self.md.listeners.insert(listener)))
    }

    pub fn del_listener(&mut self, handle: LsnHandle) -> TrdpResult<()> {
        self.md.listeners.remove(handle.0).ok_or(TrdpError::NoSub)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Decodes and dispatches one inbound PD datagram.
    pub fn on_pd_datagram(&mut self, data: &[u8], src: SocketAddrV4, dst: Option<Ipv4Addr>) {
        let (header, payload) = match Frame::decode(data) {
            Ok(Frame::Pd { header, payload }) => (header, payload),
            Ok(Frame::Md { .. }) => {
                self.stats.pd.wire_errors += 1;
                return;
            }
            Err(e) => {
                self.count_pd_wire_error(e);
                return;
            }
        };
        let expected = (self.config.etb_topo_count, self.config.op_trn_topo_count);
        if !topo_accepted(expected, (header.etb_topo_count, header.op_trn_topo_count)) {
            self.stats.pd.topo_drops += 1;
            return;
        }
        let now = self.clock.now_instant();
        match header.msg_type {
            MsgType::Pd | MsgType::Pp => {
                self.stats.pd.received += 1;
                let dst = dst.unwrap_or(self.config.host_ip);
                let actual = Fingerprint {
                    com_id: header.com_id,
                    etb_topo_count: header.etb_topo_count,
                    op_trn_topo_count: header.op_trn_topo_count,
                    src: *src.ip(),
                    dst,
                    service_id: header.reserved,
                };
                let info = PdInfo {
                    com_id: header.com_id,
                    sequence_counter: header.sequence_counter,
                    msg_type: header.msg_type,
                    src: *src.ip(),
                    dst,
                };
                let (events, matches) =
                    self.pd_sub
                        .deliver(&mut self.subs, &actual, info, &payload, now);
                if matches == 0 {
                    self.stats.pd.no_sub_drops += 1;
                }
                self.events.extend(events);
            }
            MsgType::Pr => {
                // An unspecified reply address answers the requester's
                // own source endpoint.
                let reply_dest = if header.reply_ip.is_unspecified() {
                    src
                } else {
                    SocketAddrV4::new(header.reply_ip, self.config.pd.port)
                };
                let emits = self.pd_pub.pull(
                    &mut self.pubs,
                    header.com_id,
                    header.reply_com_id,
                    reply_dest,
                );
                for emit in emits {
                    self.cmds.push_back(MuxCmd::SendPd {
                        dest: emit.dest,
                        frame: emit.frame,
                    });
                }
            }
            _ => self.stats.pd.wire_errors += 1,
        }
    }

    /// Decodes and dispatches one inbound MD frame from either
    /// transport.
    pub fn on_md_frame(&mut self, data: &[u8], peer: SocketAddr, via: Transport) {
        let (header, payload) = match Frame::decode(data) {
            Ok(Frame::Md { header, payload }) => (header, payload),
            Ok(Frame::Pd { .. }) => {
                self.stats.md.wire_errors += 1;
                return;
            }
            Err(e) => {
                self.count_md_wire_error(e);
                return;
            }
        };
        let expected = (self.config.etb_topo_count, self.config.op_trn_topo_count);
        if !topo_accepted(expected, (header.etb_topo_count, header.op_trn_topo_count)) {
            self.stats.md.topo_drops += 1;
            return;
        }
        let peer_ip = match peer {
            SocketAddr::V4(a) => *a.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let actual = Fingerprint {
            com_id: header.com_id,
            etb_topo_count: header.etb_topo_count,
            op_trn_topo_count: header.op_trn_topo_count,
            src: peer_ip,
            dst: self.config.host_ip,
            service_id: header.reserved,
        };
        let now = self.clock.now_instant();
        let (sends, events) =
            self.md
                .on_frame(&header, &payload, peer, via, &actual, now, &mut self.stats.md);
        for send in sends {
            self.stats.md.sent += 1;
            self.cmds.push_back(MuxCmd::SendMd(send));
        }
        self.events.extend(events);
    }

    /// A pooled TCP connection died; fail its sessions.
    pub fn on_conn_closed(&mut self, peer: SocketAddr) {
        let now = self.clock.now_instant();
        let events = self.md.on_conn_closed(peer, now);
        self.events.extend(events);
    }

    fn count_pd_wire_error(&mut self, e: WireError) {
        match e {
            WireError::BadHeaderCrc | WireError::BadPayloadCrc => self.stats.pd.crc_errors += 1,
            _ => self.stats.pd.wire_errors += 1,
        }
        debug!(error = %e, "PD datagram dropped");
    }

    fn count_md_wire_error(&mut self, e: WireError) {
        match e {
            WireError::BadHeaderCrc | WireError::BadPayloadCrc => self.stats.md.crc_errors += 1,
            _ => self.stats.md.wire_errors += 1,
        }
        debug!(error = %e, "MD frame dropped");
    }

    // ------------------------------------------------------------------
    // Time-driven work
    // ------------------------------------------------------------------

    /// Runs one scheduler tick: cyclic emission plus both timeout
    /// sweeps.
    pub fn tick(&mut self, now: Instant) {
        let emits = self.pd_pub.tick(&mut self.pubs, now);
        for emit in emits {
            self.cmds.push_back(MuxCmd::SendPd {
                dest: emit.dest,
                frame: emit.frame,
            });
        }
        let pd_events = self.pd_sub.sweep(&mut self.subs, now);
        self.stats.pd.timeouts += pd_events.len() as u64;
        self.events.extend(pd_events);

        let (md_sends, md_events) = self.md.sweep(now, &mut self.stats.md);
        for send in md_sends {
            self.cmds.push_back(MuxCmd::SendMd(send));
        }
        self.events.extend(md_events);
    }

    /// The earliest engine deadline: next PD emission, PD receive
    /// timeout, or MD reply/confirm/reap deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.pd_pub.next_deadline(&self.pubs),
            self.pd_sub.next_deadline(),
            self.md.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drains queued socket work.
    pub fn take_cmds(&mut self) -> Vec<MuxCmd> {
        self.cmds.drain(..).collect()
    }

    /// Drains queued application events.
    pub fn take_events(&mut self) -> Vec<TrdpEvent> {
        self.events.drain(..).collect()
    }

    /// Session teardown: aborts transactions and clears registries.
    /// No further callbacks fire.
    pub fn shutdown(&mut self) {
        self.running = false;
        let aborted = self.md.abort_all();
        if aborted > 0 {
            debug!(aborted, "sessions drained to Aborted at close");
        }
        self.pubs.drain();
        self.subs.drain();
        self.events.clear();
        self.cmds.clear();
    }
}
