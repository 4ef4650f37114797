//! The publisher index: cyclic emission with bounded per-tick work.
//!
//! Publications are bucketed into four interval classes, each backed by
//! a timing wheel whose slot resolution coarsens by a factor of ten per
//! class. The fast wheel is visited every tick, the slower wheels at
//! their sub-rates. A slot visit drains the slot and re-files every
//! entry whose deadline lies in the future, so intervals longer than a
//! wheel's span simply take extra revolutions.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::debug;

use trdp_proto::frame::encode_pd;
use trdp_proto::{MsgType, PdHeader};

use crate::error::{TrdpError, TrdpResult};
use crate::fingerprint::Fingerprint;
use crate::registry::{PubHandle, Registry};

/// Invoked at emission time with the outgoing payload buffer, so the
/// application can refresh the snapshot in place. Runs under the engine
/// lock: it must only touch the buffer it is handed.
pub type SendCallback = Box<dyn FnMut(&mut Vec<u8>) + Send>;

/// One registered publication.
pub struct Publication {
    pub fingerprint: Fingerprint,
    /// Destination host or group and port.
    pub dest: SocketAddrV4,
    /// `None` is pull-only: no wheel slot, emitted on request.
    pub interval: Option<Duration>,
    pub redundancy_group: Option<u32>,
    pub payload: Vec<u8>,
    pub sequence_counter: u32,
    pub next_emit: Instant,
    pub on_send: Option<SendCallback>,
}

/// An encoded sample ready for the mux.
#[derive(Debug)]
pub struct PdEmit {
    pub dest: SocketAddrV4,
    pub frame: Vec<u8>,
}

struct Wheel {
    /// Slot resolution in ticks.
    res_ticks: u64,
    slots: Vec<Vec<PubHandle>>,
    /// Index of the last visited slot position, in resolution units.
    cursor: u64,
}

impl Wheel {
    fn new(res_ticks: u64, slot_count: usize) -> Self {
        Wheel {
            res_ticks,
            slots: (0..slot_count).map(|_| Vec::new()).collect(),
            cursor: 0,
        }
    }

    fn slot_for(&self, ticks: u64) -> usize {
        ((ticks / self.res_ticks) % self.slots.len() as u64) as usize
    }
}

/// Interval-class bounds: ≤100 ms, ≤1 s, ≤10 s, above.
const CLASS_BOUNDS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_secs(1),
    Duration::from_secs(10),
];

pub struct PublisherIndex {
    wheels: [Wheel; 4],
    epoch: Instant,
    tick: Duration,
    last_tick: u64,
    /// comId → publications, for pull-request dispatch.
    by_com: HashMap<u32, SmallVec<[PubHandle; 2]>>,
    /// Redundancy groups this session currently follows (not leads).
    follower_groups: HashMap<u32, ()>,
    /// Topology counters stamped on outbound samples.
    pub etb_topo_count: u32,
    pub op_trn_topo_count: u32,
}

impl PublisherIndex {
    pub fn new(epoch: Instant, tick: Duration) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let slots = |bound: Duration, res_ticks: u64| -> usize {
            let res = tick * res_ticks as u32;
            ((bound.as_micros() / res.as_micros().max(1)).max(1) as usize).min(4096)
        };
        PublisherIndex {
            wheels: [
                Wheel::new(1, slots(CLASS_BOUNDS[0], 1)),
                Wheel::new(10, slots(CLASS_BOUNDS[1], 10)),
                Wheel::new(100, slots(CLASS_BOUNDS[2], 100)),
                Wheel::new(1000, 128),
            ],
            epoch,
            tick,
            last_tick: 0,
            by_com: HashMap::new(),
            follower_groups: HashMap::new(),
            etb_topo_count: 0,
            op_trn_topo_count: 0,
        }
    }

    fn class_for(&self, interval: Duration) -> usize {
        CLASS_BOUNDS
            .iter()
            .position(|&b| interval <= b)
            .unwrap_or(CLASS_BOUNDS.len())
    }

    fn ticks_at(&self, t: Instant) -> u64 {
        (t.saturating_duration_since(self.epoch).as_micros() / self.tick.as_micros().max(1)) as u64
    }

    /// Files a publication into its wheel slot. Pull-only publications
    /// are indexed for requests but never occupy a slot.
    pub fn schedule(&mut self, handle: PubHandle, publication: &Publication) {
        self.by_com
            .entry(publication.fingerprint.com_id)
            .or_default()
            .push(handle);
        if let Some(interval) = publication.interval {
            let class = self.class_for(interval);
            let ticks = self.ticks_at(publication.next_emit);
            let slot = self.wheels[class].slot_for(ticks);
            self.wheels[class].slots[slot].push(handle);
        }
    }

    /// Removes a publication from the pull index. Wheel entries are
    /// lazily discarded on their next slot visit.
    pub fn unschedule(&mut self, handle: PubHandle, com_id: u32) {
        if let Some(list) = self.by_com.get_mut(&com_id) {
            list.retain(|h| *h != handle);
            if list.is_empty() {
                self.by_com.remove(&com_id);
            }
        }
    }

    /// Switches leadership for a redundancy group. Followers stay on
    /// the wheel but neither transmit nor advance sequence counters.
    pub fn set_redundant(&mut self, group: u32, leader: bool) {
        if leader {
            self.follower_groups.remove(&group);
        } else {
            self.follower_groups.insert(group, ());
        }
    }

    pub fn is_leader(&self, group: Option<u32>) -> bool {
        match group {
            Some(g) => !self.follower_groups.contains_key(&g),
            None => true,
        }
    }

    /// The earliest wheel deadline, for the scheduler's wait computation.
    pub fn next_deadline(&self, pubs: &Registry<Publication>) -> Option<Instant> {
        pubs.iter()
            .filter(|(_, p)| p.interval.is_some())
            .map(|(_, p)| p.next_emit)
            .min()
    }

    /// Advances every wheel to `now` and emits due samples. Each slot
    /// position is visited at most once per call even when the
    /// scheduler is late, so a publication emits at most once per tick.
    pub fn tick(&mut self, pubs: &mut Registry<Publication>, now: Instant) -> Vec<PdEmit> {
        let cur_tick = self.ticks_at(now);
        if cur_tick <= self.last_tick {
            return Vec::new();
        }
        let epoch = self.epoch;
        let tick = self.tick;
        let ticks_at = move |t: Instant| -> u64 {
            (t.saturating_duration_since(epoch).as_micros() / tick.as_micros().max(1)) as u64
        };
        let mut due: Vec<PubHandle> = Vec::new();
        for wheel in &mut self.wheels {
            let cur = cur_tick / wheel.res_ticks;
            if cur <= wheel.cursor {
                continue;
            }
            let slots_len = wheel.slots.len() as u64;
            let advanced = (cur - wheel.cursor).min(slots_len);
            let mut refile: Vec<(usize, PubHandle)> = Vec::new();
            for step in 1..=advanced {
                let pos = ((wheel.cursor + step) % slots_len) as usize;
                for handle in wheel.slots[pos].drain(..) {
                    let publication = match pubs.get(handle.0) {
                        Some(p) if p.interval.is_some() => p,
                        _ => continue, // unpublished or demoted to pull-only
                    };
                    if publication.next_emit <= now {
                        due.push(handle);
                    } else {
                        let ticks = ticks_at(publication.next_emit) / wheel.res_ticks;
                        let slot = (ticks % slots_len) as usize;
                        refile.push((slot, handle));
                    }
                }
            }
            for (slot, handle) in refile {
                wheel.slots[slot].push(handle);
            }
            wheel.cursor = cur;
        }
        self.last_tick = cur_tick;

        let mut emits = Vec::with_capacity(due.len());
        for handle in due {
            if let Some(emit) = self.emit(pubs, handle, now) {
                emits.push(emit);
            }
        }
        emits
    }

    /// Emits one cyclic sample and re-files the publication.
    fn emit(
        &mut self,
        pubs: &mut Registry<Publication>,
        handle: PubHandle,
        now: Instant,
    ) -> Option<PdEmit> {
        let leader = {
            let publication = pubs.get(handle.0)?;
            self.is_leader(publication.redundancy_group)
        };
        let publication = pubs.get_mut(handle.0)?;
        let interval = publication.interval?;

        // Catch up missed cycles without bursting; the counter stays
        // interval-quantized regardless of scheduler lateness.
        while publication.next_emit <= now {
            publication.next_emit += interval;
        }

        let topo = (self.etb_topo_count, self.op_trn_topo_count);
        let frame = if leader {
            if let Some(cb) = publication.on_send.as_mut() {
                cb(&mut publication.payload);
            }
            publication.sequence_counter = publication.sequence_counter.wrapping_add(1);
            Some(encode_sample(publication, MsgType::Pd, None, topo))
        } else {
            None
        };

        // Re-file for the next cycle.
        let class = self.class_for(interval);
        let ticks = self.ticks_at(publication.next_emit) / self.wheels[class].res_ticks;
        let slot = (ticks % self.wheels[class].slots.len() as u64) as usize;
        let dest = publication.dest;
        self.wheels[class].slots[slot].push(handle);

        match frame {
            Some(Ok(frame)) => Some(PdEmit { dest, frame }),
            Some(Err(e)) => {
                debug!(error = %e, "dropping oversize cyclic sample");
                None
            }
            None => None,
        }
    }

    /// Answers a PD pull request: every publication carrying the
    /// requested comId emits one `Pp` reply toward `reply_dest`.
    pub fn pull(
        &mut self,
        pubs: &mut Registry<Publication>,
        com_id: u32,
        reply_com_id: u32,
        reply_dest: SocketAddrV4,
    ) -> Vec<PdEmit> {
        let handles: SmallVec<[PubHandle; 2]> =
            self.by_com.get(&com_id).cloned().unwrap_or_default();
        let mut emits = Vec::new();
        for handle in handles {
            let leader = match pubs.get(handle.0) {
                Some(p) => self.is_leader(p.redundancy_group),
                None => continue,
            };
            if !leader {
                continue;
            }
            let publication = match pubs.get_mut(handle.0) {
                Some(p) => p,
                None => continue,
            };
            if let Some(cb) = publication.on_send.as_mut() {
                cb(&mut publication.payload);
            }
            publication.sequence_counter = publication.sequence_counter.wrapping_add(1);
            let over_com = (reply_com_id != 0).then_some(reply_com_id);
            let topo = (self.etb_topo_count, self.op_trn_topo_count);
            match encode_sample(publication, MsgType::Pp, over_com, topo) {
                Ok(frame) => emits.push(PdEmit {
                    dest: reply_dest,
                    frame,
                }),
                Err(e) => debug!(error = %e, "dropping oversize pull reply"),
            }
        }
        emits
    }

    /// Updates a publication's payload snapshot.
    pub fn put(
        &mut self,
        pubs: &mut Registry<Publication>,
        handle: PubHandle,
        data: &[u8],
    ) -> TrdpResult<()> {
        if data.len() > trdp_proto::PD_MAX_PAYLOAD {
            return Err(TrdpError::Param);
        }
        let publication = pubs.get_mut(handle.0).ok_or(TrdpError::NoPub)?;
        publication.payload.clear();
        publication.payload.extend_from_slice(data);
        Ok(())
    }
}

fn encode_sample(
    publication: &Publication,
    msg_type: MsgType,
    com_id_override: Option<u32>,
    topo: (u32, u32),
) -> Result<Vec<u8>, trdp_proto::WireError> {
    let fp = &publication.fingerprint;
    let mut header = PdHeader::new(msg_type, com_id_override.unwrap_or(fp.com_id));
    header.sequence_counter = publication.sequence_counter;
    header.etb_topo_count = topo.0;
    header.op_trn_topo_count = topo.1;
    header.reserved = fp.service_id;
    encode_pd(&header, &publication.payload)
}

impl Publication {
    /// Whether a `Pr` request is needed to make this publication emit.
    pub fn is_pull_only(&self) -> bool {
        self.interval.is_none()
    }
}
