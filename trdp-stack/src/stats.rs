//! Diagnostic statistics.
//!
//! Corrupt or unmatched traffic is dropped silently on the wire path;
//! these counters are the only trace it leaves.

/// Process-data plane counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PdStatistics {
    pub sent: u64,
    pub received: u64,
    pub crc_errors: u64,
    pub wire_errors: u64,
    pub topo_drops: u64,
    pub no_sub_drops: u64,
    pub timeouts: u64,
    /// Emissions skipped because the socket would have blocked.
    pub send_blocks: u64,
}

/// Message-data plane counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MdStatistics {
    pub sent: u64,
    pub received: u64,
    pub retries: u64,
    pub reply_timeouts: u64,
    pub confirm_timeouts: u64,
    pub no_listener_drops: u64,
    pub crc_errors: u64,
    pub wire_errors: u64,
    pub topo_drops: u64,
}

/// Per-session snapshot returned by the session façade.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub pd: PdStatistics,
    pub md: MdStatistics,
}
