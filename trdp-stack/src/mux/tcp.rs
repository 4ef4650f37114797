//! The pooled TCP side of the mux.
//!
//! Connections are keyed by peer address and shared by every MD session
//! talking to that peer. A dialed connection stays nonblocking: frames
//! queue in the write buffer until the connect completes. Idle
//! connections are reclaimed only when no live MD session borrows them.
//!
//! MD frames carry their own length in the header, so stream reframing
//! reads a header's dataset length and slices whole frames out of the
//! receive buffer. A malformed header makes the stream unrecoverable
//! and drops the connection.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use trdp_proto::frame::peek_md_len;

use crate::error::{TrdpError, TrdpResult};

const READ_CHUNK: usize = 16 * 1024;
/// Cap on buffered inbound bytes per connection; a peer that exceeds it
/// without producing a complete frame is broken.
const MAX_RX_BUFFER: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Nonblocking connect in flight, failing at `deadline`.
    Connecting { deadline: Instant },
    Ready,
}

struct Conn {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    last_activity: Instant,
    rx: Vec<u8>,
    tx: Vec<u8>,
    tx_pos: usize,
}

impl Conn {
    fn flush(&mut self) -> io::Result<()> {
        while self.tx_pos < self.tx.len() {
            match self.stream.write(&self.tx[self.tx_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.tx_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.tx_pos == self.tx.len() {
            self.tx.clear();
            self.tx_pos = 0;
        } else if self.tx_pos > READ_CHUNK {
            self.tx.drain(..self.tx_pos);
            self.tx_pos = 0;
        }
        Ok(())
    }
}

/// A complete inbound frame with its connection peer.
#[derive(Debug)]
pub struct TcpFrame {
    pub peer: SocketAddr,
    pub data: Vec<u8>,
}

pub struct TcpPool {
    listener: Option<TcpListener>,
    conns: HashMap<Token, Conn>,
    by_peer: HashMap<SocketAddr, Token>,
    next_token: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl TcpPool {
    pub fn new(token_base: usize, connect_timeout: Duration, idle_timeout: Duration) -> Self {
        TcpPool {
            listener: None,
            conns: HashMap::new(),
            by_peer: HashMap::new(),
            next_token: token_base,
            connect_timeout,
            idle_timeout,
        }
    }

    /// Binds and registers the MD TCP listener.
    pub fn listen(
        &mut self,
        host_ip: Ipv4Addr,
        port: u16,
        registry: &Registry,
        token: Token,
    ) -> TrdpResult<()> {
        let addr = SocketAddr::V4(SocketAddrV4::new(host_ip, port));
        let mut listener = TcpListener::bind(addr).map_err(TrdpError::Socket)?;
        registry
            .register(&mut listener, token, Interest::READABLE)
            .map_err(TrdpError::Socket)?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn owns(&self, token: Token) -> bool {
        self.conns.contains_key(&token)
    }

    pub fn has_connection(&self, peer: SocketAddr) -> bool {
        self.by_peer.contains_key(&peer)
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Queues a frame toward `peer`, dialing a pooled connection first
    /// when none exists. Never blocks; the connect completes under the
    /// poll loop.
    pub fn send(
        &mut self,
        peer: SocketAddr,
        frame: &[u8],
        registry: &Registry,
        now: Instant,
    ) -> TrdpResult<()> {
        let token = match self.by_peer.get(&peer).copied() {
            Some(t) => t,
            None => self.dial(peer, registry, now)?,
        };
        let conn = self.conns.get_mut(&token).ok_or(TrdpError::NoConn)?;
        conn.tx.extend_from_slice(frame);
        conn.last_activity = now;
        let broken = conn.state == ConnState::Ready && conn.flush().is_err();
        if broken {
            debug!(%peer, "write failed, dropping connection");
            self.drop_conn(token);
            return Err(TrdpError::NoConn);
        }
        Ok(())
    }

    fn dial(&mut self, peer: SocketAddr, registry: &Registry, now: Instant) -> TrdpResult<Token> {
        let mut stream = TcpStream::connect(peer).map_err(TrdpError::Socket)?;
        let token = self.alloc_token();
        registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(TrdpError::Socket)?;
        debug!(%peer, "dialing");
        self.conns.insert(
            token,
            Conn {
                stream,
                peer,
                state: ConnState::Connecting {
                    deadline: now + self.connect_timeout,
                },
                last_activity: now,
                rx: Vec::new(),
                tx: Vec::new(),
                tx_pos: 0,
            },
        );
        self.by_peer.insert(peer, token);
        Ok(token)
    }

    /// Accept loop for the listener token. Inbound connections join the
    /// pool so replies reuse the requester's stream.
    pub fn on_acceptable(&mut self, registry: &Registry, now: Instant) {
        loop {
            let listener = match &self.listener {
                Some(l) => l,
                None => return,
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = self.alloc_token();
                    if let Err(e) =
                        registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                    {
                        warn!(%peer, error = %e, "register of accepted connection failed");
                        continue;
                    }
                    debug!(%peer, "accepted");
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            peer,
                            state: ConnState::Ready,
                            last_activity: now,
                            rx: Vec::new(),
                            tx: Vec::new(),
                            tx_pos: 0,
                        },
                    );
                    self.by_peer.insert(peer, token);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Write-readiness: completes a pending connect and flushes queued
    /// frames. Returns the peer if the connection died.
    pub fn on_writable(&mut self, token: Token, now: Instant) -> Option<SocketAddr> {
        let (peer, connect_failed) = {
            let conn = self.conns.get_mut(&token)?;
            let failed = if let ConnState::Connecting { .. } = conn.state {
                match conn.stream.take_error() {
                    Ok(None) => {
                        debug!(peer = %conn.peer, "connected");
                        conn.state = ConnState::Ready;
                        false
                    }
                    Ok(Some(e)) | Err(e) => {
                        debug!(peer = %conn.peer, error = %e, "connect failed");
                        true
                    }
                }
            } else {
                false
            };
            (conn.peer, failed)
        };
        if connect_failed {
            self.drop_conn(token);
            return Some(peer);
        }
        conn_flush(self, token, now)
    }

    /// Read-readiness: drains the stream and slices complete MD frames
    /// out of the buffer. Returns the frames plus the peer if the
    /// connection closed.
    pub fn on_readable(
        &mut self,
        token: Token,
        now: Instant,
    ) -> (Vec<TcpFrame>, Option<SocketAddr>) {
        let conn = match self.conns.get_mut(&token) {
            Some(c) => c,
            None => return (Vec::new(), None),
        };
        let peer = conn.peer;
        let mut chunk = [0u8; READ_CHUNK];
        let mut closed = false;
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    conn.rx.extend_from_slice(&chunk[..n]);
                    conn.last_activity = now;
                    if conn.rx.len() > MAX_RX_BUFFER {
                        warn!(%peer, "receive buffer overrun, dropping connection");
                        closed = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(%peer, error = %e, "read failed");
                    closed = true;
                    break;
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match peek_md_len(&conn.rx) {
                Ok(Some(total)) if conn.rx.len() >= total => {
                    let data: Vec<u8> = conn.rx.drain(..total).collect();
                    frames.push(TcpFrame { peer, data });
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "unframeable stream, dropping connection");
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            self.drop_conn(token);
            (frames, Some(peer))
        } else {
            (frames, None)
        }
    }

    /// Closes idle connections with no borrowing sessions, and expires
    /// connects that never completed. Returns the affected peers.
    pub fn reap(&mut self, now: Instant, live_sessions: impl Fn(SocketAddr) -> usize) -> Vec<SocketAddr> {
        let mut dead = Vec::new();
        for (token, conn) in &self.conns {
            match conn.state {
                ConnState::Connecting { deadline } if deadline <= now => {
                    dead.push((*token, conn.peer, true));
                }
                ConnState::Ready
                    if conn.last_activity + self.idle_timeout <= now
                        && live_sessions(conn.peer) == 0 =>
                {
                    dead.push((*token, conn.peer, false));
                }
                _ => {}
            }
        }
        let mut affected = Vec::new();
        for (token, peer, notify) in dead {
            debug!(%peer, notify, "reaping connection");
            self.drop_conn(token);
            if notify {
                affected.push(peer);
            }
        }
        affected
    }

    /// Earliest pending connect deadline or idle expiry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.conns
            .values()
            .map(|c| match c.state {
                ConnState::Connecting { deadline } => deadline,
                ConnState::Ready => c.last_activity + self.idle_timeout,
            })
            .min()
    }

    fn drop_conn(&mut self, token: Token) {
        if let Some(conn) = self.conns.remove(&token) {
            // The address index may already point at a newer connection
            // to the same peer; only unlink it if it is still ours.
            if self.by_peer.get(&conn.peer) == Some(&token) {
                self.by_peer.remove(&conn.peer);
            }
        }
    }

    /// Drops every connection. Used at session close.
    pub fn close_all(&mut self) {
        self.conns.clear();
        self.by_peer.clear();
    }
}

/// Flush helper that can drop the connection on failure.
fn conn_flush(pool: &mut TcpPool, token: Token, _now: Instant) -> Option<SocketAddr> {
    let (peer, failed) = {
        let conn = pool.conns.get_mut(&token)?;
        if conn.state != ConnState::Ready {
            return None;
        }
        (conn.peer, conn.flush().is_err())
    };
    if failed {
        debug!(%peer, "flush failed, dropping connection");
        pool.drop_conn(token);
        Some(peer)
    } else {
        None
    }
}
