//! Per-session configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use trdp_proto::constants::{MD_PORT, PD_PORT};
use trdp_proto::Uri;

/// Process-data plane settings.
#[derive(Debug, Clone)]
pub struct PdConfig {
    /// UDP port PD traffic is bound to and sent to.
    pub port: u16,
    /// QoS class 0..=7, mapped into the DSCP bits of IP_TOS.
    pub qos: u8,
    /// Unicast TTL.
    pub ttl: u8,
    /// Receive timeout applied when a subscription does not name one.
    pub default_timeout: Duration,
}

impl Default for PdConfig {
    fn default() -> Self {
        PdConfig {
            port: PD_PORT,
            qos: 5,
            ttl: 64,
            default_timeout: Duration::from_secs(10),
        }
    }
}

/// Message-data plane settings.
#[derive(Debug, Clone)]
pub struct MdConfig {
    pub udp_port: u16,
    pub tcp_port: u16,
    pub qos: u8,
    pub ttl: u8,
    /// Ceiling on a nonblocking TCP connect before borrowing sessions
    /// fail with `NoConn`.
    pub connect_timeout: Duration,
    /// A pooled TCP connection with no active sessions is closed after
    /// this much inactivity.
    pub idle_timeout: Duration,
    /// Reply deadline applied when a request does not name one.
    pub reply_timeout: Duration,
    /// Confirm deadline for reply-query exchanges.
    pub confirm_timeout: Duration,
    /// Request retransmissions after the first send.
    pub retries: u32,
}

impl Default for MdConfig {
    fn default() -> Self {
        MdConfig {
            udp_port: MD_PORT,
            tcp_port: MD_PORT,
            qos: 3,
            ttl: 64,
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(1),
            retries: 2,
        }
    }
}

/// Pre-sizing for the per-session registries. Zero means grow on demand;
/// the choice does not alter external semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reserve {
    pub publications: usize,
    pub subscriptions: usize,
    pub listeners: usize,
    pub md_sessions: usize,
}

/// Session-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local interface address for binds, multicast membership and the
    /// multicast egress interface. Unspecified lets the OS choose.
    pub host_ip: Ipv4Addr,
    /// Source URI stamped on outbound MD frames.
    pub host_uri: Uri,
    /// Expected ETB topology counter; zero accepts any.
    pub etb_topo_count: u32,
    /// Expected operational-train topology counter; zero accepts any.
    pub op_trn_topo_count: u32,
    /// Scheduler tick granularity; the fast PD wheel has one slot per tick.
    pub cycle: Duration,
    /// Multicast TTL.
    pub mc_ttl: u8,
    /// Whether locally sent multicast loops back to this host.
    pub mc_loopback: bool,
    pub pd: PdConfig,
    pub md: MdConfig,
    pub reserve: Reserve,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            host_ip: Ipv4Addr::UNSPECIFIED,
            host_uri: Uri::ANY,
            etb_topo_count: 0,
            op_trn_topo_count: 0,
            cycle: Duration::from_millis(10),
            mc_ttl: 64,
            mc_loopback: false,
            pd: PdConfig::default(),
            md: MdConfig::default(),
            reserve: Reserve::default(),
        }
    }
}

/// Maps a QoS class onto the DSCP field: `LLLxxx` with the class in the
/// upper three bits, low two ECN bits never written (IEC 61375-3-4
/// §4.6.3 layout). Returns the value for IP_TOS.
pub fn qos_to_tos(qos: u8) -> u32 {
    let dscp = u32::from(qos & 0x07) << 3;
    dscp << 2
}
