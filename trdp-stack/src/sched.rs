//! The time-driven scheduler.
//!
//! One cooperative iteration applies queued socket work, blocks on the
//! mux until the unified deadline (earliest PD emission, PD receive
//! timeout, MD deadline, TCP expiry), dispatches inbound traffic, runs
//! the tick work, and hands the drained application events back to the
//! caller for dispatch outside every lock.
//!
//! The mux is only ever touched from here; user operations queue
//! commands and wake the poll instead.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{Engine, MuxCmd};
use crate::error::{TrdpError, TrdpResult};
use crate::event::TrdpEvent;
use crate::mux::{MuxIn, SendOutcome, SocketMux};

/// Longest poll when nothing is scheduled, so close requests and new
/// deadlines are always observed promptly even without a waker.
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub(crate) struct SchedState {
    pub engine: Mutex<Engine>,
    pub mux: Mutex<SocketMux>,
}

/// Applies one batch of queued socket work.
fn apply_cmds(mux: &mut SocketMux, engine: &Mutex<Engine>, cmds: Vec<MuxCmd>, now: Instant) {
    let mut pd_sent = 0u64;
    let mut pd_blocked = 0u64;
    let mut failed_peers: Vec<SocketAddr> = Vec::new();

    for cmd in cmds {
        match cmd {
            MuxCmd::JoinGroup(group) => {
                if let Err(e) = mux.join_group(group) {
                    debug!(%group, error = %e, "multicast join failed");
                }
            }
            MuxCmd::LeaveGroup(group) => mux.leave_group(group),
            MuxCmd::SendPd { dest, frame } => match mux.send_pd(dest, &frame) {
                // PD never queues or retries: a blocked send skips
                // this emission.
                Ok(SendOutcome::Sent) => pd_sent += 1,
                Ok(SendOutcome::Block) => pd_blocked += 1,
                Err(e) => debug!(error = %e, "PD send failed"),
            },
            MuxCmd::SendMd(send) => {
                let peer = send.peer;
                match mux.send_md(&send, now) {
                    Ok(()) => {}
                    Err(TrdpError::NoConn) => failed_peers.push(peer),
                    Err(e) => debug!(%peer, error = %e, "MD send failed"),
                }
            }
        }
    }

    if pd_sent != 0 || pd_blocked != 0 || !failed_peers.is_empty() {
        let mut engine = engine.lock();
        engine.stats.pd.sent += pd_sent;
        engine.stats.pd.send_blocks += pd_blocked;
        for peer in failed_peers {
            engine.on_conn_closed(peer);
        }
    }
}

/// One scheduler iteration. Returns the application events to dispatch;
/// `Err(Init)` once the session has been shut down.
pub(crate) fn iterate(state: &SchedState, max_wait: Duration) -> TrdpResult<Vec<TrdpEvent>> {
    let mut mux = state.mux.lock();

    let now = {
        let engine = state.engine.lock();
        if !engine.running {
            return Err(TrdpError::Init);
        }
        engine.clock.now_instant()
    };

    // Outbound work queued by API calls since the last iteration.
    let cmds = state.engine.lock().take_cmds();
    apply_cmds(&mut mux, &state.engine, cmds, now);

    // Unified deadline: engine timeouts and mux (TCP) expiries.
    let deadline = {
        let engine = state.engine.lock();
        match (engine.next_deadline(), mux.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    };
    let wait = match deadline {
        Some(d) => d.saturating_duration_since(now).min(max_wait),
        None => max_wait.min(IDLE_WAIT),
    };

    let inbound = mux.poll_wait(Some(wait), now)?;

    let (cmds, now) = {
        let mut engine = state.engine.lock();
        for item in inbound {
            match item {
                MuxIn::Pd { data, src, dst } => engine.on_pd_datagram(&data, src, dst),
                MuxIn::MdUdp { data, src } => {
                    engine.on_md_frame(&data, SocketAddr::V4(src), crate::md::Transport::Udp)
                }
                MuxIn::MdTcp { data, peer } => {
                    engine.on_md_frame(&data, peer, crate::md::Transport::Tcp)
                }
                MuxIn::ConnClosed { peer } => engine.on_conn_closed(peer),
                MuxIn::Woken => {}
            }
        }
        let now = engine.clock.now_instant();
        engine.tick(now);
        (engine.take_cmds(), now)
    };
    apply_cmds(&mut mux, &state.engine, cmds, now);

    // TCP reclamation with a lock-free liveness snapshot.
    let counts = state.engine.lock().md.tcp_session_counts();
    let abandoned = mux.reap_tcp(now, |peer| counts.get(&peer).copied().unwrap_or(0));
    let events = {
        let mut engine = state.engine.lock();
        for peer in abandoned {
            engine.on_conn_closed(peer);
        }
        engine.take_events()
    };
    Ok(events)
}
