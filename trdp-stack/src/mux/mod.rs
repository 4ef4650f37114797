//! The socket multiplexer.
//!
//! Owns every descriptor of a session: the PD UDP socket, the MD UDP
//! socket, the MD TCP listener and the pooled TCP connections, plus the
//! waker the façade uses to interrupt a blocked poll. Projects a single
//! readable-set-plus-deadline view to the scheduler and demultiplexes
//! inbound traffic per descriptor.

pub mod membership;
pub mod tcp;
pub mod udp;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use tracing::warn;

use crate::config::SessionConfig;
use crate::error::{TrdpError, TrdpResult};
use crate::md::{MdSend, Transport};

pub use membership::{IgmpAction, MembershipMap};
pub use tcp::{TcpFrame, TcpPool};
pub use udp::{RecvMeta, SendOutcome, UdpChannel};

const PD_TOKEN: Token = Token(0);
const MD_UDP_TOKEN: Token = Token(1);
const TCP_LISTEN_TOKEN: Token = Token(2);
const WAKER_TOKEN: Token = Token(3);
const TCP_TOKEN_BASE: usize = 16;

/// Largest UDP datagram we accept.
const RECV_BUF_SIZE: usize = 65536;
/// Datagrams drained per socket per poll round, bounding latency for
/// the other plane.
const DRAIN_BUDGET: usize = 64;

/// One demultiplexed inbound item.
#[derive(Debug)]
pub enum MuxIn {
    /// A PD datagram with its recovered destination address.
    Pd {
        data: Vec<u8>,
        src: SocketAddrV4,
        dst: Option<Ipv4Addr>,
    },
    /// An MD datagram from the UDP socket.
    MdUdp { data: Vec<u8>, src: SocketAddrV4 },
    /// A complete MD frame from a pooled TCP connection.
    MdTcp { data: Vec<u8>, peer: SocketAddr },
    /// A pooled connection died with the peer's sessions unresolved.
    ConnClosed { peer: SocketAddr },
    /// The waker fired (user operation or close request).
    Woken,
}

pub struct SocketMux {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    pd: UdpChannel,
    md_udp: UdpChannel,
    tcp: TcpPool,
    pub membership: MembershipMap,
    host_ip: Ipv4Addr,
    recv_buf: Vec<u8>,
}

impl SocketMux {
    pub fn open(config: &SessionConfig) -> TrdpResult<Self> {
        let poll = Poll::new().map_err(TrdpError::Socket)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(TrdpError::Socket)?);

        let mut pd = UdpChannel::bind(
            config.host_ip,
            config.pd.port,
            config.pd.qos,
            config.pd.ttl,
            config.mc_ttl,
            config.mc_loopback,
        )?;
        pd.register(poll.registry(), PD_TOKEN)?;

        let mut md_udp = UdpChannel::bind(
            config.host_ip,
            config.md.udp_port,
            config.md.qos,
            config.md.ttl,
            config.mc_ttl,
            config.mc_loopback,
        )?;
        md_udp.register(poll.registry(), MD_UDP_TOKEN)?;

        let mut tcp = TcpPool::new(
            TCP_TOKEN_BASE,
            config.md.connect_timeout,
            config.md.idle_timeout,
        );
        tcp.listen(
            config.host_ip,
            config.md.tcp_port,
            poll.registry(),
            TCP_LISTEN_TOKEN,
        )?;

        Ok(SocketMux {
            poll,
            events: Events::with_capacity(128),
            waker,
            pd,
            md_udp,
            tcp,
            membership: MembershipMap::new(),
            host_ip: config.host_ip,
            recv_buf: vec![0u8; RECV_BUF_SIZE],
        })
    }

    /// Handle for interrupting a blocked poll from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }

    /// Refcounted IGMP join on the PD socket.
    pub fn join_group(&mut self, group: Ipv4Addr) -> TrdpResult<()> {
        if self.membership.join(group, self.host_ip) == Some(IgmpAction::Join) {
            self.pd.join(group, self.host_ip)?;
        }
        Ok(())
    }

    /// Refcounted IGMP leave; must be called exactly once per
    /// subscription that joined.
    pub fn leave_group(&mut self, group: Ipv4Addr) {
        if self.membership.leave(group, self.host_ip) == Some(IgmpAction::Leave) {
            self.pd.leave(group, self.host_ip);
        }
    }

    /// Sends one PD frame.
    pub fn send_pd(&self, dest: SocketAddrV4, frame: &[u8]) -> TrdpResult<SendOutcome> {
        self.pd.send_to(frame, dest)
    }

    /// The local PD port, the default destination port for telegrams
    /// that do not name one.
    pub fn pd_port(&self) -> u16 {
        self.pd.port()
    }

    /// Sends one encoded MD frame over its transport.
    pub fn send_md(&mut self, send: &MdSend, now: Instant) -> TrdpResult<()> {
        match send.transport {
            Transport::Udp => {
                let dest = match send.peer {
                    SocketAddr::V4(a) => a,
                    SocketAddr::V6(_) => return Err(TrdpError::Param),
                };
                match self.md_udp.send_to(&send.frame, dest)? {
                    SendOutcome::Sent => Ok(()),
                    SendOutcome::Block => Err(TrdpError::Block),
                }
            }
            Transport::Tcp => {
                let registry = self.poll.registry();
                self.tcp.send(send.peer, &send.frame, registry, now)
            }
        }
    }

    /// Whether a pooled connection to `peer` currently exists.
    pub fn has_tcp_connection(&self, peer: SocketAddr) -> bool {
        self.tcp.has_connection(peer)
    }

    /// Blocks until readiness or `timeout`, then drains and
    /// demultiplexes every ready descriptor.
    pub fn poll_wait(&mut self, timeout: Option<Duration>, now: Instant) -> TrdpResult<Vec<MuxIn>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(TrdpError::Socket(e)),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect();

        let mut inbound = Vec::new();
        for (token, readable, writable) in ready {
            match token {
                WAKER_TOKEN => inbound.push(MuxIn::Woken),
                PD_TOKEN => {
                    for _ in 0..DRAIN_BUDGET {
                        match self.pd.recv(&mut self.recv_buf)? {
                            Some(meta) => inbound.push(MuxIn::Pd {
                                data: self.recv_buf[..meta.len].to_vec(),
                                src: meta.src,
                                dst: meta.dst,
                            }),
                            None => break,
                        }
                    }
                }
                MD_UDP_TOKEN => {
                    for _ in 0..DRAIN_BUDGET {
                        match self.md_udp.recv(&mut self.recv_buf)? {
                            Some(meta) => inbound.push(MuxIn::MdUdp {
                                data: self.recv_buf[..meta.len].to_vec(),
                                src: meta.src,
                            }),
                            None => break,
                        }
                    }
                }
                TCP_LISTEN_TOKEN => {
                    let registry = self.poll.registry();
                    self.tcp.on_acceptable(registry, now);
                }
                t if self.tcp.owns(t) => {
                    if writable {
                        if let Some(peer) = self.tcp.on_writable(t, now) {
                            inbound.push(MuxIn::ConnClosed { peer });
                            continue;
                        }
                    }
                    if readable {
                        let (frames, closed) = self.tcp.on_readable(t, now);
                        for frame in frames {
                            inbound.push(MuxIn::MdTcp {
                                data: frame.data,
                                peer: frame.peer,
                            });
                        }
                        if let Some(peer) = closed {
                            inbound.push(MuxIn::ConnClosed { peer });
                        }
                    }
                }
                other => warn!(?other, "event for unknown token"),
            }
        }
        Ok(inbound)
    }

    /// Reclaims idle or connect-expired TCP connections. Returns peers
    /// whose pending connects were abandoned.
    pub fn reap_tcp(
        &mut self,
        now: Instant,
        live_sessions: impl Fn(SocketAddr) -> usize,
    ) -> Vec<SocketAddr> {
        self.tcp.reap(now, live_sessions)
    }

    /// The mux's own next deadline (TCP connect and idle expiries).
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tcp.next_deadline()
    }

    /// Releases every membership and connection. The UDP sockets close
    /// on drop.
    pub fn shutdown(&mut self) {
        for (group, _iface) in self.membership.drain() {
            self.pd.leave(group, self.host_ip);
        }
        self.tcp.close_all();
    }
}

impl std::fmt::Debug for SocketMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketMux")
            .field("memberships", &self.membership.outstanding())
            .finish()
    }
}
