//! The session façade.
//!
//! A [`TrdpSession`] owns both traffic planes, their sockets and the
//! scheduler. Operations are callable from any thread: they take the
//! engine lock for their mutation window, queue socket work, and wake
//! the scheduler. Callbacks fire on the scheduler thread after the
//! engine lock is released; blocking inside one blocks the scheduler.
//! From inside a callback only `reply`, `reply_query`, `confirm`,
//! `put` and `get` may re-enter the session.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use trdp_proto::{SessionId, Uri};

use crate::config::SessionConfig;
use crate::engine::Engine;
use crate::error::{TrdpError, TrdpResult};
use crate::event::TrdpEvent;
use crate::fingerprint::Fingerprint;
use crate::md::Transport;
use crate::mux::SocketMux;
use crate::pd::{GetOutcome, SendCallback, TimeoutPolicy};
use crate::registry::{LsnHandle, PubHandle, SubHandle};
use crate::sched::{self, SchedState};
use crate::stats::Statistics;
use crate::time::{SystemTimeProvider, TimeProvider};

/// Application callback, invoked from the scheduler thread.
pub type EventCallback = Box<dyn FnMut(&TrdpEvent) + Send>;

#[derive(Default)]
struct Callbacks {
    subs: HashMap<SubHandle, EventCallback>,
    listeners: HashMap<LsnHandle, EventCallback>,
    md: HashMap<SessionId, EventCallback>,
}

impl Callbacks {
    fn clear(&mut self) {
        self.subs.clear();
        self.listeners.clear();
        self.md.clear();
    }
}

struct Shared {
    sched: SchedState,
    callbacks: Mutex<Callbacks>,
    waker: Arc<mio::Waker>,
    stop: AtomicBool,
    cycle: Duration,
}

/// An open TRDP session.
pub struct TrdpSession {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TrdpSession {
    /// Opens a session on the OS clock.
    pub fn open(config: SessionConfig) -> TrdpResult<Self> {
        Self::open_with_clock(config, Arc::new(SystemTimeProvider))
    }

    /// Opens a session with an injected clock (deterministic tests).
    pub fn open_with_clock(
        config: SessionConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> TrdpResult<Self> {
        if config.cycle < Duration::from_millis(1) || config.pd.qos > 7 || config.md.qos > 7 {
            return Err(TrdpError::Param);
        }
        let mux = SocketMux::open(&config)?;
        let waker = mux.waker();
        let mut rng = StdRng::from_entropy();
        let cycle = config.cycle;
        let engine = Engine::new(config, clock, &mut rng);
        info!("session opened");
        Ok(TrdpSession {
            shared: Arc::new(Shared {
                sched: SchedState {
                    engine: Mutex::new(engine),
                    mux: Mutex::new(mux),
                },
                callbacks: Mutex::new(Callbacks::default()),
                waker,
                stop: AtomicBool::new(false),
                cycle,
            }),
            workers: Vec::new(),
        })
    }

    fn wake(&self) {
        let _ = self.shared.waker.wake();
    }

    // ------------------------------------------------------------------
    // PD plane
    // ------------------------------------------------------------------

    /// Registers a cyclic publication (`interval` > 0) or a pull-only
    /// one (`interval` = None). Samples go to `dest` on the session's
    /// PD port.
    pub fn publish(
        &self,
        com_id: u32,
        dest: Ipv4Addr,
        interval: Option<Duration>,
        payload: &[u8],
    ) -> TrdpResult<PubHandle> {
        let port = self.shared.sched.engine.lock().config.pd.port;
        self.publish_with(
            com_id,
            SocketAddrV4::new(dest, port),
            interval,
            None,
            payload,
            None,
        )
    }

    /// Full-parameter publish: explicit destination port, redundancy
    /// group membership, and an on-send callback that refreshes the
    /// payload in place at emission time.
    pub fn publish_with(
        &self,
        com_id: u32,
        dest: SocketAddrV4,
        interval: Option<Duration>,
        redundancy_group: Option<u32>,
        payload: &[u8],
        on_send: Option<SendCallback>,
    ) -> TrdpResult<PubHandle> {
        let handle = self.shared.sched.engine.lock().publish(
            com_id,
            dest,
            interval,
            redundancy_group,
            payload,
            on_send,
        )?;
        self.wake();
        Ok(handle)
    }

    pub fn unpublish(&self, handle: PubHandle) -> TrdpResult<()> {
        self.shared.sched.engine.lock().unpublish(handle)
    }

    /// Updates a publication's payload snapshot.
    pub fn put(&self, handle: PubHandle, payload: &[u8]) -> TrdpResult<()> {
        self.shared.sched.engine.lock().put(handle, payload)
    }

    /// Switches leadership for a redundancy group.
    pub fn set_redundant(&self, group: u32, leader: bool) {
        self.shared.sched.engine.lock().set_redundant(group, leader);
    }

    /// Registers a subscription. `timeout` of `None` takes the session
    /// default; an explicit zero disables supervision. A callback makes
    /// the subscription push-mode.
    pub fn subscribe(
        &self,
        pattern: Fingerprint,
        timeout: Option<Duration>,
        policy: TimeoutPolicy,
        callback: Option<EventCallback>,
    ) -> TrdpResult<SubHandle> {
        let push = callback.is_some();
        let handle = self
            .shared
            .sched
            .engine
            .lock()
            .subscribe(pattern, timeout, policy, push)?;
        if let Some(cb) = callback {
            self.shared.callbacks.lock().subs.insert(handle, cb);
        }
        self.wake();
        Ok(handle)
    }

    pub fn unsubscribe(&self, handle: SubHandle) -> TrdpResult<()> {
        self.shared.sched.engine.lock().unsubscribe(handle)?;
        self.shared.callbacks.lock().subs.remove(&handle);
        self.wake();
        Ok(())
    }

    /// Pull-mode read of the latest sample.
    pub fn get(&self, handle: SubHandle) -> TrdpResult<GetOutcome> {
        self.shared.sched.engine.lock().get(handle)
    }

    /// Sends a PD pull request; matching publishers answer with `Pp`
    /// toward `reply_ip` (unspecified: our source address).
    pub fn pd_request(
        &self,
        com_id: u32,
        dest: SocketAddrV4,
        reply_com_id: u32,
        reply_ip: Ipv4Addr,
    ) -> TrdpResult<()> {
        self.shared
            .sched
            .engine
            .lock()
            .pd_request(com_id, dest, reply_com_id, reply_ip)?;
        self.wake();
        Ok(())
    }

    // ------------------------------------------------------------------
    // MD plane
    // ------------------------------------------------------------------

    /// Fire-and-forget notification.
    pub fn notify(
        &self,
        com_id: u32,
        peer: SocketAddr,
        transport: Transport,
        dest_uri: Option<&str>,
        payload: &[u8],
    ) -> TrdpResult<()> {
        let uri = parse_uri(dest_uri)?;
        self.shared
            .sched
            .engine
            .lock()
            .md_notify(com_id, peer, transport, uri, payload)?;
        self.wake();
        Ok(())
    }

    /// Opens a request/reply transaction. The callback receives the
    /// reply, confirm-query, or failure for this sessionId.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &self,
        com_id: u32,
        peer: SocketAddr,
        transport: Transport,
        dest_uri: Option<&str>,
        payload: &[u8],
        reply_timeout: Option<Duration>,
        retries: Option<u32>,
        callback: Option<EventCallback>,
    ) -> TrdpResult<SessionId> {
        let uri = parse_uri(dest_uri)?;
        let id = self.shared.sched.engine.lock().md_request(
            com_id,
            peer,
            transport,
            uri,
            payload,
            reply_timeout,
            retries,
        )?;
        if let Some(cb) = callback {
            self.shared.callbacks.lock().md.insert(id, cb);
        }
        self.wake();
        Ok(id)
    }

    /// Responder reply closing the transaction.
    pub fn reply(&self, id: SessionId, payload: &[u8]) -> TrdpResult<()> {
        self.shared.sched.engine.lock().md_reply(id, payload)?;
        self.wake();
        Ok(())
    }

    /// Responder reply that requires an `Mc` confirmation.
    pub fn reply_query(
        &self,
        id: SessionId,
        payload: &[u8],
        confirm_timeout: Option<Duration>,
    ) -> TrdpResult<()> {
        self.shared
            .sched
            .engine
            .lock()
            .md_reply_query(id, payload, confirm_timeout)?;
        self.wake();
        Ok(())
    }

    /// Initiator confirmation of a reply-query.
    pub fn confirm(&self, id: SessionId) -> TrdpResult<()> {
        self.shared.sched.engine.lock().md_confirm(id)?;
        self.wake();
        Ok(())
    }

    /// Registers a listener pattern for inbound requests and
    /// notifications.
    pub fn add_listener(
        &self,
        pattern: Fingerprint,
        dest_uri: Option<&str>,
        callback: Option<EventCallback>,
    ) -> TrdpResult<LsnHandle> {
        let uri = parse_uri(dest_uri)?;
        let push = callback.is_some();
        let handle = self
            .shared
            .sched
            .engine
            .lock()
            .add_listener(pattern, uri, push)?;
        if let Some(cb) = callback {
            self.shared.callbacks.lock().listeners.insert(handle, cb);
        }
        Ok(handle)
    }

    pub fn del_listener(&self, handle: LsnHandle) -> TrdpResult<()> {
        self.shared.sched.engine.lock().del_listener(handle)?;
        self.shared.callbacks.lock().listeners.remove(&handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Applies new topology counters to outbound stamps and inbound
    /// acceptance.
    pub fn update_topo(&self, etb: u32, op_trn: u32) {
        self.shared.sched.engine.lock().update_topo(etb, op_trn);
    }

    pub fn statistics(&self) -> Statistics {
        self.shared.sched.engine.lock().stats
    }

    /// One cooperative scheduler iteration: waits at most `max_wait`
    /// for traffic or deadlines, then dispatches callbacks.
    pub fn process(&self, max_wait: Duration) -> TrdpResult<()> {
        let events = sched::iterate(&self.shared.sched, max_wait)?;
        dispatch_events(&self.shared, events);
        prune_md_callbacks(&self.shared);
        Ok(())
    }

    /// Spawns the single scheduler thread.
    pub fn run(&mut self) -> TrdpResult<()> {
        if !self.workers.is_empty() {
            return Err(TrdpError::Param);
        }
        self.workers.push(spawn_scheduler(Arc::clone(&self.shared))?);
        Ok(())
    }

    /// Spawns the split pair: a cyclic tx thread at the tick rate and a
    /// receive thread blocking on the mux.
    pub fn run_split(&mut self) -> TrdpResult<()> {
        if !self.workers.is_empty() {
            return Err(TrdpError::Param);
        }
        let shared = Arc::clone(&self.shared);
        let tx = thread::Builder::new()
            .name("trdp-tx".into())
            .spawn(move || cyclic_tx_loop(&shared))
            .map_err(|_| TrdpError::Mem)?;
        self.workers.push(tx);
        self.workers.push(spawn_scheduler(Arc::clone(&self.shared))?);
        Ok(())
    }

    /// Closes the session: stops the workers, aborts unfinished MD
    /// transactions without network traffic, leaves every joined group
    /// and releases all sockets. Callbacks never fire after this
    /// returns. Idempotent.
    pub fn close(&mut self) -> TrdpResult<()> {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shared.waker.wake();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.shared.sched.engine.lock().shutdown();
        self.shared.sched.mux.lock().shutdown();
        self.shared.callbacks.lock().clear();
        info!("session closed");
        Ok(())
    }
}

impl Drop for TrdpSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn parse_uri(uri: Option<&str>) -> TrdpResult<Uri> {
    match uri {
        Some(s) => Uri::new(s).ok_or(TrdpError::Param),
        None => Ok(Uri::ANY),
    }
}

fn spawn_scheduler(shared: Arc<Shared>) -> TrdpResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("trdp-sched".into())
        .spawn(move || {
            debug!("scheduler thread up");
            while !shared.stop.load(Ordering::Acquire) {
                match sched::iterate(&shared.sched, Duration::from_millis(500)) {
                    Ok(events) => {
                        dispatch_events(&shared, events);
                        prune_md_callbacks(&shared);
                    }
                    Err(_) => break,
                }
            }
            debug!("scheduler thread down");
        })
        .map_err(|_| TrdpError::Mem)
}

/// The cyclic tx loop: runs the PD wheel at the tick rate and wakes the
/// receive thread to flush the queued emissions.
fn cyclic_tx_loop(shared: &Shared) {
    debug!("cyclic tx thread up");
    while !shared.stop.load(Ordering::Acquire) {
        thread::sleep(shared.cycle);
        {
            let mut engine = shared.sched.engine.lock();
            if !engine.running {
                break;
            }
            let now = engine.clock.now_instant();
            engine.tick(now);
        }
        let _ = shared.waker.wake();
    }
    debug!("cyclic tx thread down");
}

/// Routes drained events to their callbacks. Only the callbacks lock is
/// held here, so `reply`/`confirm`/`put`/`get` may re-enter the session
/// from inside a callback.
fn dispatch_events(shared: &Shared, events: Vec<TrdpEvent>) {
    if events.is_empty() {
        return;
    }
    let mut cbs = shared.callbacks.lock();
    for event in events {
        match &event {
            TrdpEvent::PdData { sub, .. } | TrdpEvent::PdTimeout { sub, .. } => {
                if let Some(cb) = cbs.subs.get_mut(sub) {
                    cb(&event);
                }
            }
            TrdpEvent::MdIndication { listener, .. } => {
                if let Some(cb) = cbs.listeners.get_mut(listener) {
                    cb(&event);
                }
            }
            TrdpEvent::MdReply { info, .. } => {
                let id = info.session_id;
                if let Some(cb) = cbs.md.get_mut(&id) {
                    cb(&event);
                }
                if info.msg_type == trdp_proto::MsgType::Mp {
                    cbs.md.remove(&id);
                }
            }
            TrdpEvent::MdConfirm { listener, .. } => {
                if let Some(l) = listener {
                    if let Some(cb) = cbs.listeners.get_mut(l) {
                        cb(&event);
                    }
                }
            }
            TrdpEvent::MdFailed {
                listener,
                session_id,
                ..
            } => match listener {
                Some(l) => {
                    if let Some(cb) = cbs.listeners.get_mut(l) {
                        cb(&event);
                    }
                }
                None => {
                    if let Some(mut cb) = cbs.md.remove(session_id) {
                        cb(&event);
                    }
                }
            },
        }
    }
}

/// Drops request callbacks whose transaction no longer exists (e.g.
/// confirmed reply-queries). Each lock is taken alone; holding both at
/// once would deadlock against a callback re-entering the session.
fn prune_md_callbacks(shared: &Shared) {
    let ids: Vec<SessionId> = shared.callbacks.lock().md.keys().copied().collect();
    if ids.is_empty() {
        return;
    }
    let stale: Vec<SessionId> = {
        let engine = shared.sched.engine.lock();
        ids.into_iter()
            .filter(|id| engine.md.session(id).is_none())
            .collect()
    };
    if !stale.is_empty() {
        let mut cbs = shared.callbacks.lock();
        for id in stale {
            cbs.md.remove(&id);
        }
    }
}
