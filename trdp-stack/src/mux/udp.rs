//! UDP channels with destination-address recovery.
//!
//! One socket per plane, bound to INADDR_ANY on the plane port with
//! REUSEADDR/REUSEPORT so unicast and every joined multicast group
//! arrive on the same descriptor. IP_PKTINFO tells unicast and
//! multicast apart per datagram and names the arrival interface.
//!
//! Advisory option failures (TOS, TTL, loopback) are logged and
//! ignored; only bind and socket creation are fatal.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::config::qos_to_tos;
use crate::error::{TrdpError, TrdpResult};

/// Outcome of a nonblocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// EWOULDBLOCK: the caller skips or retries by its own policy.
    Block,
}

/// One received datagram's wire facts.
#[derive(Debug, Clone, Copy)]
pub struct RecvMeta {
    pub len: usize,
    pub src: SocketAddrV4,
    /// Destination address from IP_PKTINFO; `None` when the control
    /// message is unavailable on this platform.
    pub dst: Option<Ipv4Addr>,
    /// Arrival interface index, when known.
    pub ifindex: Option<u32>,
}

pub struct UdpChannel {
    socket: mio::net::UdpSocket,
    /// Duplicate descriptor for runtime option changes (memberships);
    /// shares all socket state with `socket`.
    ctl: Socket,
    port: u16,
}

impl UdpChannel {
    /// Opens and binds the plane socket.
    pub fn bind(
        host_ip: Ipv4Addr,
        port: u16,
        qos: u8,
        ttl: u8,
        mc_ttl: u8,
        mc_loopback: bool,
    ) -> TrdpResult<Self> {
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(TrdpError::Socket)?;
        socket.set_nonblocking(true).map_err(TrdpError::Socket)?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!(error = %e, "SO_REUSEADDR failed");
        }
        #[cfg(unix)]
        if let Err(e) = socket.set_reuse_port(true) {
            warn!(error = %e, "SO_REUSEPORT failed");
        }
        if let Err(e) = socket.set_tos(qos_to_tos(qos)) {
            warn!(error = %e, "IP_TOS failed");
        }
        if let Err(e) = socket.set_ttl(u32::from(ttl)) {
            warn!(error = %e, "IP_TTL failed");
        }
        if let Err(e) = socket.set_multicast_ttl_v4(u32::from(mc_ttl)) {
            warn!(error = %e, "IP_MULTICAST_TTL failed");
        }
        if let Err(e) = socket.set_multicast_loop_v4(mc_loopback) {
            warn!(error = %e, "IP_MULTICAST_LOOP failed");
        }
        if !host_ip.is_unspecified() {
            if let Err(e) = socket.set_multicast_if_v4(&host_ip) {
                warn!(error = %e, "IP_MULTICAST_IF failed");
            }
        }
        #[cfg(unix)]
        if let Err(e) = nix::sys::socket::setsockopt(
            &socket,
            nix::sys::socket::sockopt::Ipv4PacketInfo,
            &true,
        ) {
            warn!(error = %e, "IP_PKTINFO failed, destination recovery disabled");
        }
        // Bind to the wildcard address so joined groups arrive here too.
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&SocketAddr::from(bind_addr).into())
            .map_err(TrdpError::Socket)?;
        let ctl = socket.try_clone().map_err(TrdpError::Socket)?;
        let socket = mio::net::UdpSocket::from_std(socket.into());
        Ok(UdpChannel { socket, ctl, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
    ) -> TrdpResult<()> {
        registry
            .register(&mut self.socket, token, mio::Interest::READABLE)
            .map_err(TrdpError::Socket)
    }

    /// IGMP join on the plane socket.
    pub fn join(&self, group: Ipv4Addr, iface: Ipv4Addr) -> TrdpResult<()> {
        self.ctl
            .join_multicast_v4(&group, &iface)
            .map_err(TrdpError::Socket)
    }

    /// IGMP leave; failure is logged, not surfaced, so teardown always
    /// completes.
    pub fn leave(&self, group: Ipv4Addr, iface: Ipv4Addr) {
        if let Err(e) = self.ctl.leave_multicast_v4(&group, &iface) {
            warn!(%group, error = %e, "IP_DROP_MEMBERSHIP failed");
        }
    }

    /// Nonblocking send. EINTR retries, EWOULDBLOCK surfaces as
    /// `Block`, anything else as a recoverable `Io` error.
    pub fn send_to(&self, buf: &[u8], dest: SocketAddrV4) -> TrdpResult<SendOutcome> {
        loop {
            match self.socket.send_to(buf, SocketAddr::V4(dest)) {
                Ok(_) => return Ok(SendOutcome::Sent),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendOutcome::Block),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TrdpError::Io(e)),
            }
        }
    }

    /// Nonblocking receive with control-message metadata. `Ok(None)`
    /// means no datagram is pending; asynchronous ICMP errors
    /// (connection reset/refused on UDP) are swallowed the same way.
    #[cfg(unix)]
    pub fn recv(&self, buf: &mut [u8]) -> TrdpResult<Option<RecvMeta>> {
        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrIn};
        use std::io::IoSliceMut;
        use std::os::unix::io::AsRawFd;

        let fd = self.socket.as_raw_fd();
        loop {
            let mut iov = [IoSliceMut::new(buf)];
            let mut cmsg = nix::cmsg_space!(nix::libc::in_pktinfo);
            match recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty()) {
                Ok(msg) => {
                    let src = match msg.address {
                        Some(a) => SocketAddrV4::new(Ipv4Addr::from(a.ip()), a.port()),
                        None => return Ok(None),
                    };
                    let len = msg.bytes;
                    let mut dst = None;
                    let mut ifindex = None;
                    if let Ok(cmsgs) = msg.cmsgs() {
                        for c in cmsgs {
                            if let ControlMessageOwned::Ipv4PacketInfo(pi) = c {
                                dst = Some(Ipv4Addr::from(u32::from_be(pi.ipi_addr.s_addr)));
                                ifindex = Some(pi.ipi_ifindex as u32);
                            }
                        }
                    }
                    return Ok(Some(RecvMeta {
                        len,
                        src,
                        dst,
                        ifindex,
                    }));
                }
                Err(nix::errno::Errno::EAGAIN) => return Ok(None),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECONNRESET) | Err(nix::errno::Errno::ECONNREFUSED) => {
                    return Ok(None)
                }
                Err(e) => return Err(TrdpError::Io(io::Error::from(e))),
            }
        }
    }

    #[cfg(not(unix))]
    pub fn recv(&self, buf: &mut [u8]) -> TrdpResult<Option<RecvMeta>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, SocketAddr::V4(src))) => {
                    return Ok(Some(RecvMeta {
                        len,
                        src,
                        dst: None,
                        ifindex: None,
                    }))
                }
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::ConnectionRefused =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(TrdpError::Io(e)),
            }
        }
    }
}

impl std::fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpChannel").field("port", &self.port).finish()
    }
}
