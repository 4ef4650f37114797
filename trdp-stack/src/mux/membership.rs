//! Multicast membership accounting.
//!
//! The map is pure bookkeeping: it reports when an OS-level IGMP action
//! is required (count edges 0→1 and 1→0) and the caller performs it.
//! Every subscription that joined must leave exactly once, so the
//! outstanding membership count always equals the number of live
//! multicast subscriptions per (group, interface) pair.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::warn;

/// OS action required by a refcount edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgmpAction {
    Join,
    Leave,
}

#[derive(Debug, Default)]
pub struct MembershipMap {
    counts: HashMap<(Ipv4Addr, Ipv4Addr), u32>,
}

impl MembershipMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more user of (group, iface). Returns `Join` on the
    /// first user.
    pub fn join(&mut self, group: Ipv4Addr, iface: Ipv4Addr) -> Option<IgmpAction> {
        let count = self.counts.entry((group, iface)).or_insert(0);
        *count += 1;
        (*count == 1).then_some(IgmpAction::Join)
    }

    /// Records one user gone. Returns `Leave` when the last user left.
    pub fn leave(&mut self, group: Ipv4Addr, iface: Ipv4Addr) -> Option<IgmpAction> {
        match self.counts.get_mut(&(group, iface)) {
            Some(count) if *count > 1 => {
                *count -= 1;
                None
            }
            Some(_) => {
                self.counts.remove(&(group, iface));
                Some(IgmpAction::Leave)
            }
            None => {
                warn!(%group, %iface, "leave without matching join");
                None
            }
        }
    }

    pub fn count(&self, group: Ipv4Addr, iface: Ipv4Addr) -> u32 {
        self.counts.get(&(group, iface)).copied().unwrap_or(0)
    }

    /// Number of outstanding OS memberships.
    pub fn outstanding(&self) -> usize {
        self.counts.len()
    }

    /// Empties the map, returning every membership that needs an OS
    /// leave. Used at session close.
    pub fn drain(&mut self) -> Vec<(Ipv4Addr, Ipv4Addr)> {
        self.counts.drain().map(|(k, _)| k).collect()
    }
}
