//! The subscriber index: inbound demultiplexing and receive timeouts.
//!
//! Lookup is a hashed comId match followed by a full pattern check; a
//! separate list holds the rare comId-wildcard patterns. When several
//! patterns overlap, every matching subscription is delivered.
//!
//! Timeouts are swept from a deadline heap. Entries are lazy: a fresh
//! sample does not remove the stale heap entry, the sweep re-validates
//! against the actual arrival time and re-arms.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::trace;

use crate::event::{PdInfo, TrdpEvent};
use crate::fingerprint::Fingerprint;
use crate::registry::{Registry, SubHandle};

/// What a subscription exposes after its receive timeout fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Stale data stays readable, flagged as timed out.
    #[default]
    KeepLast,
    /// The slot is cleared after the timeout has been reported once.
    ZeroOnTimeout,
    /// Every read reports timeout until fresh data arrives.
    Invalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Nothing received, or the slot was cleared by policy.
    NoData,
    /// A sample is present and its timeout has not fired.
    Fresh,
    /// The timeout fired and has been reported; data may be stale.
    TimedOut,
    /// `ZeroOnTimeout` only: timeout reported, slot cleared.
    Cleared,
}

/// The last-received sample of a subscription.
#[derive(Debug, Clone)]
pub struct PdSample {
    pub payload: Vec<u8>,
    pub info: PdInfo,
    pub arrived: Instant,
}

/// One registered subscription.
pub struct Subscription {
    pub pattern: Fingerprint,
    pub timeout: Option<Duration>,
    pub policy: TimeoutPolicy,
    /// Group joined on behalf of this subscription, for the symmetric
    /// leave at unsubscribe.
    pub mc_group: Option<Ipv4Addr>,
    /// Whether a data/timeout callback is installed.
    pub push: bool,
    sample: Option<PdSample>,
    freshness: Freshness,
    last_seq: Option<u32>,
}

impl Subscription {
    pub fn new(pattern: Fingerprint, timeout: Option<Duration>, policy: TimeoutPolicy) -> Self {
        Subscription {
            pattern,
            timeout,
            policy,
            mc_group: None,
            push: false,
            sample: None,
            freshness: Freshness::NoData,
            last_seq: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        match (&self.sample, self.timeout) {
            (Some(sample), Some(timeout)) => sample.arrived + timeout <= now,
            _ => false,
        }
    }
}

/// Outcome of a pull-mode `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    /// In-date data.
    Data { payload: Vec<u8>, info: PdInfo },
    /// The receive timeout has elapsed; stale data still readable
    /// (`KeepLast`), or reported exactly once before the policy takes
    /// over (`ZeroOnTimeout`), or on every call (`Invalidate`).
    Stale {
        payload: Option<Vec<u8>>,
        info: Option<PdInfo>,
    },
    /// Nothing has ever arrived, or the slot was cleared.
    NoData,
}

impl GetOutcome {
    /// The outcome as an operation result code: fresh data is `Ok`,
    /// staleness is `Timeout`, an empty slot is `NoData`.
    pub fn result(&self) -> crate::error::TrdpResult<()> {
        match self {
            GetOutcome::Data { .. } => Ok(()),
            GetOutcome::Stale { .. } => Err(crate::error::TrdpError::Timeout),
            GetOutcome::NoData => Err(crate::error::TrdpError::NoData),
        }
    }
}

pub struct SubscriberIndex {
    by_com: HashMap<u32, SmallVec<[SubHandle; 4]>>,
    /// Patterns with comId 0; matched by linear scan.
    wildcard: Vec<SubHandle>,
    deadlines: BinaryHeap<Reverse<(Instant, SubHandle)>>,
}

impl SubscriberIndex {
    pub fn new() -> Self {
        SubscriberIndex {
            by_com: HashMap::new(),
            wildcard: Vec::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    pub fn index(&mut self, handle: SubHandle, pattern: &Fingerprint) {
        if pattern.com_id == 0 {
            self.wildcard.push(handle);
        } else {
            self.by_com.entry(pattern.com_id).or_default().push(handle);
        }
    }

    pub fn unindex(&mut self, handle: SubHandle, pattern: &Fingerprint) {
        if pattern.com_id == 0 {
            self.wildcard.retain(|&h| h != handle);
        } else if let Some(list) = self.by_com.get_mut(&pattern.com_id) {
            list.retain(|h| *h != handle);
            if list.is_empty() {
                self.by_com.remove(&pattern.com_id);
            }
        }
    }

    /// Extended-uniqueness check: one subscription per distinct pattern.
    pub fn duplicate_of(
        &self,
        subs: &Registry<Subscription>,
        pattern: &Fingerprint,
    ) -> Option<SubHandle> {
        let candidates = self
            .by_com
            .get(&pattern.com_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        candidates
            .iter()
            .chain(self.wildcard.iter())
            .find(|&&h| subs.get(h.0).map(|s| s.pattern == *pattern).unwrap_or(false))
            .copied()
    }

    /// Delivers a decoded inbound sample to every matching subscription.
    /// Returns the queued indications and the number of matches.
    pub fn deliver(
        &mut self,
        subs: &mut Registry<Subscription>,
        actual: &Fingerprint,
        info: PdInfo,
        payload: &[u8],
        now: Instant,
    ) -> (Vec<TrdpEvent>, usize) {
        let mut candidates: SmallVec<[SubHandle; 4]> = SmallVec::new();
        if let Some(list) = self.by_com.get(&actual.com_id) {
            candidates.extend_from_slice(list);
        }
        candidates.extend_from_slice(&self.wildcard);

        let mut events = Vec::new();
        let mut matches = 0;
        for handle in candidates {
            let sub = match subs.get_mut(handle.0) {
                Some(s) => s,
                None => continue,
            };
            if !sub.pattern.accepts(actual) {
                continue;
            }
            matches += 1;

            // Within one publication the counter only moves forward;
            // duplicates and reordered stragglers are dropped.
            if let Some(last) = sub.last_seq {
                let delta = info.sequence_counter.wrapping_sub(last);
                if delta == 0 || delta >= 0x8000_0000 {
                    trace!(com_id = actual.com_id, seq = info.sequence_counter, "stale sequence dropped");
                    continue;
                }
            }
            sub.last_seq = Some(info.sequence_counter);
            sub.sample = Some(PdSample {
                payload: payload.to_vec(),
                info,
                arrived: now,
            });
            sub.freshness = Freshness::Fresh;
            if let Some(timeout) = sub.timeout {
                self.deadlines.push(Reverse((now + timeout, handle)));
            }
            if sub.push {
                events.push(TrdpEvent::PdData {
                    sub: handle,
                    info,
                    payload: payload.to_vec(),
                });
            }
        }
        (events, matches)
    }

    /// The earliest pending receive deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((t, _))| *t)
    }

    /// Fires every subscription whose deadline passed. Each data gap is
    /// reported exactly once; the heap entry re-arms on fresh data.
    pub fn sweep(&mut self, subs: &mut Registry<Subscription>, now: Instant) -> Vec<TrdpEvent> {
        let mut events = Vec::new();
        while let Some(Reverse((deadline, handle))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            let sub = match subs.get_mut(handle.0) {
                Some(s) => s,
                None => continue,
            };
            if sub.freshness != Freshness::Fresh {
                continue;
            }
            if !sub.expired(now) {
                // Fresh data arrived after this entry was queued.
                if let (Some(sample), Some(timeout)) = (&sub.sample, sub.timeout) {
                    self.deadlines
                        .push(Reverse((sample.arrived + timeout, handle)));
                }
                continue;
            }
            sub.freshness = Freshness::TimedOut;
            if sub.push {
                events.push(TrdpEvent::PdTimeout {
                    sub: handle,
                    com_id: sub.pattern.com_id,
                });
            }
        }
        events
    }

    /// Pull-mode read.
    pub fn get(
        &mut self,
        subs: &mut Registry<Subscription>,
        handle: SubHandle,
        now: Instant,
    ) -> Option<GetOutcome> {
        let sub = subs.get_mut(handle.0)?;
        // A get may observe expiry before the sweep does.
        if sub.freshness == Freshness::Fresh && sub.expired(now) {
            sub.freshness = Freshness::TimedOut;
        }
        let outcome = match sub.freshness {
            Freshness::NoData | Freshness::Cleared => GetOutcome::NoData,
            Freshness::Fresh => {
                let sample = sub.sample.as_ref()?;
                GetOutcome::Data {
                    payload: sample.payload.clone(),
                    info: sample.info,
                }
            }
            Freshness::TimedOut => match sub.policy {
                TimeoutPolicy::KeepLast => {
                    let sample = sub.sample.as_ref()?;
                    GetOutcome::Stale {
                        payload: Some(sample.payload.clone()),
                        info: Some(sample.info),
                    }
                }
                TimeoutPolicy::ZeroOnTimeout => {
                    // Report once, then clear the slot.
                    sub.sample = None;
                    sub.freshness = Freshness::Cleared;
                    GetOutcome::Stale {
                        payload: None,
                        info: None,
                    }
                }
                TimeoutPolicy::Invalidate => GetOutcome::Stale {
                    payload: None,
                    info: None,
                },
            },
        };
        Some(outcome)
    }
}

impl Default for SubscriberIndex {
    fn default() -> Self {
        Self::new()
    }
}
