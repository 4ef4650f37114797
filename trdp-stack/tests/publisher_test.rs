use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use trdp_proto::Frame;
use trdp_stack::fingerprint::Fingerprint;
use trdp_stack::pd::{PdEmit, Publication, PublisherIndex};
use trdp_stack::registry::{PubHandle, Registry};

const DEST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 101), 17224);

fn publication(com_id: u32, interval: Option<Duration>, now: Instant) -> Publication {
    Publication {
        fingerprint: Fingerprint::for_com_id(com_id),
        dest: DEST,
        interval,
        redundancy_group: None,
        payload: b"hello".to_vec(),
        sequence_counter: 0,
        next_emit: now + interval.unwrap_or(Duration::ZERO),
        on_send: None,
    }
}

fn add(
    index: &mut PublisherIndex,
    pubs: &mut Registry<Publication>,
    publication: Publication,
) -> PubHandle {
    let handle = PubHandle(pubs.insert(publication));
    let p = pubs.get(handle.0).unwrap();
    index.schedule(handle, p);
    handle
}

/// Steps the wheel in 1 ms ticks over `span`, returning all emissions.
fn run_for(
    index: &mut PublisherIndex,
    pubs: &mut Registry<Publication>,
    start: Instant,
    span: Duration,
) -> Vec<PdEmit> {
    let mut out = Vec::new();
    let step = Duration::from_millis(1);
    let mut now = start;
    let end = start + span;
    while now < end {
        now += step;
        out.extend(index.tick(pubs, now));
    }
    out
}

#[test]
fn cyclic_emission_rate() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    add(
        &mut index,
        &mut pubs,
        publication(1000, Some(Duration::from_millis(10)), t0),
    );

    let emits = run_for(&mut index, &mut pubs, t0, Duration::from_secs(1));
    // One per 10 ms over one second, window boundary gives +-1.
    assert!(
        (99..=101).contains(&emits.len()),
        "expected ~100 emissions, got {}",
        emits.len()
    );
}

#[test]
fn interval_classes_coexist() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    add(
        &mut index,
        &mut pubs,
        publication(1, Some(Duration::from_millis(10)), t0),
    );
    add(
        &mut index,
        &mut pubs,
        publication(2, Some(Duration::from_millis(500)), t0),
    );
    add(
        &mut index,
        &mut pubs,
        publication(3, Some(Duration::from_secs(5)), t0),
    );

    let emits = run_for(&mut index, &mut pubs, t0, Duration::from_secs(10));
    let count = |com: u32| {
        emits
            .iter()
            .filter(|e| match Frame::decode(&e.frame) {
                Ok(Frame::Pd { header, .. }) => header.com_id == com,
                _ => false,
            })
            .count()
    };
    let fast = count(1);
    let mid = count(2);
    let slow = count(3);
    assert!((995..=1001).contains(&fast), "fast wheel: {}", fast);
    assert!((19..=21).contains(&mid), "mid wheel: {}", mid);
    assert!((1..=2).contains(&slow), "slow wheel: {}", slow);
}

#[test]
fn late_scheduler_emits_once_and_stays_on_grid() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    add(
        &mut index,
        &mut pubs,
        publication(1000, Some(Duration::from_millis(10)), t0),
    );

    // The scheduler stalls for 55 ms: one sample, no burst.
    let emits = index.tick(&mut pubs, t0 + Duration::from_millis(55));
    assert_eq!(emits.len(), 1);

    // Catch-up skipped the missed cycles; the next emission is on the
    // 10 ms grid after the stall.
    let emits = run_for(
        &mut index,
        &mut pubs,
        t0 + Duration::from_millis(55),
        Duration::from_millis(10),
    );
    assert_eq!(emits.len(), 1);
}

#[test]
fn sequence_increments_and_payload_follows_put() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    let handle = add(
        &mut index,
        &mut pubs,
        publication(1000, Some(Duration::from_millis(10)), t0),
    );

    let first = run_for(&mut index, &mut pubs, t0, Duration::from_millis(10));
    assert_eq!(first.len(), 1);
    index.put(&mut pubs, handle, b"updated").unwrap();
    let second = run_for(
        &mut index,
        &mut pubs,
        t0 + Duration::from_millis(10),
        Duration::from_millis(10),
    );
    assert_eq!(second.len(), 1);

    match Frame::decode(&first[0].frame).unwrap() {
        Frame::Pd { header, payload } => {
            assert_eq!(header.sequence_counter, 1);
            assert_eq!(payload, b"hello");
        }
        other => panic!("unexpected {:?}", other),
    }
    match Frame::decode(&second[0].frame).unwrap() {
        Frame::Pd { header, payload } => {
            assert_eq!(header.sequence_counter, 2);
            assert_eq!(payload, b"updated");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn pull_only_never_cycles_but_answers_requests() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    add(&mut index, &mut pubs, publication(1000, None, t0));

    let emits = run_for(&mut index, &mut pubs, t0, Duration::from_secs(1));
    assert!(emits.is_empty());

    let reply_dest = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 7), 17224);
    let replies = index.pull(&mut pubs, 1000, 0, reply_dest);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].dest, reply_dest);
    match Frame::decode(&replies[0].frame).unwrap() {
        Frame::Pd { header, payload } => {
            assert_eq!(header.msg_type, trdp_proto::MsgType::Pp);
            assert_eq!(header.com_id, 1000);
            assert_eq!(payload, b"hello");
        }
        other => panic!("unexpected {:?}", other),
    }

    // A reply-comId override renames the answer telegram.
    let replies = index.pull(&mut pubs, 1000, 1001, reply_dest);
    match Frame::decode(&replies[0].frame).unwrap() {
        Frame::Pd { header, .. } => assert_eq!(header.com_id, 1001),
        other => panic!("unexpected {:?}", other),
    }

    // Unknown comId pulls nothing.
    assert!(index.pull(&mut pubs, 9999, 0, reply_dest).is_empty());
}

#[test]
fn redundancy_follower_keeps_schedule_but_stays_silent() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    let mut p = publication(1000, Some(Duration::from_millis(10)), t0);
    p.redundancy_group = Some(7);
    add(&mut index, &mut pubs, p);

    index.set_redundant(7, false);
    let silent = run_for(&mut index, &mut pubs, t0, Duration::from_millis(100));
    assert!(silent.is_empty());

    // Back to leader: emission resumes with the counter unfrozen from 1.
    index.set_redundant(7, true);
    let emits = run_for(
        &mut index,
        &mut pubs,
        t0 + Duration::from_millis(100),
        Duration::from_millis(20),
    );
    assert!(!emits.is_empty());
    match Frame::decode(&emits[0].frame).unwrap() {
        Frame::Pd { header, .. } => assert_eq!(header.sequence_counter, 1),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn unpublish_removes_from_wheel_and_pull_index() {
    let t0 = Instant::now();
    let mut index = PublisherIndex::new(t0, Duration::from_millis(1));
    let mut pubs = Registry::new();
    let handle = add(
        &mut index,
        &mut pubs,
        publication(1000, Some(Duration::from_millis(10)), t0),
    );

    pubs.remove(handle.0).unwrap();
    index.unschedule(handle, 1000);
    let emits = run_for(&mut index, &mut pubs, t0, Duration::from_millis(100));
    assert!(emits.is_empty());
    let reply_dest = SocketAddrV4::new(Ipv4Addr::new(10, 0, 1, 7), 17224);
    assert!(index.pull(&mut pubs, 1000, 0, reply_dest).is_empty());
}
