use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use trdp_proto::MsgType;
use trdp_stack::event::{PdInfo, TrdpEvent};
use trdp_stack::fingerprint::Fingerprint;
use trdp_stack::pd::{GetOutcome, SubscriberIndex, Subscription, TimeoutPolicy};
use trdp_stack::registry::{Registry, SubHandle};

const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 101);
const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 7);

fn actual(com_id: u32) -> Fingerprint {
    Fingerprint {
        com_id,
        etb_topo_count: 1,
        op_trn_topo_count: 1,
        src: SRC,
        dst: DST,
        service_id: 0,
    }
}

fn info(com_id: u32, seq: u32) -> PdInfo {
    PdInfo {
        com_id,
        sequence_counter: seq,
        msg_type: MsgType::Pd,
        src: SRC,
        dst: DST,
    }
}

fn add(
    index: &mut SubscriberIndex,
    subs: &mut Registry<Subscription>,
    pattern: Fingerprint,
    timeout: Option<Duration>,
    policy: TimeoutPolicy,
    push: bool,
) -> SubHandle {
    let mut sub = Subscription::new(pattern, timeout, policy);
    sub.push = push;
    let handle = SubHandle(subs.insert(sub));
    index.index(handle, &pattern);
    handle
}

#[test]
fn delivery_then_get_returns_matching_payload() {
    let now = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        Some(Duration::from_millis(300)),
        TimeoutPolicy::KeepLast,
        false,
    );

    let (events, matches) = index.deliver(&mut subs, &actual(1000), info(1000, 1), b"hello", now);
    assert_eq!(matches, 1);
    assert!(events.is_empty(), "pull mode queues no events");

    match index.get(&mut subs, handle, now).unwrap() {
        GetOutcome::Data { payload, info } => {
            assert_eq!(payload, b"hello");
            assert_eq!(info.sequence_counter, 1);
            assert_eq!(info.src, SRC);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn get_before_any_delivery_is_no_data() {
    let now = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        Some(Duration::from_millis(300)),
        TimeoutPolicy::KeepLast,
        false,
    );
    assert_eq!(
        index.get(&mut subs, handle, now).unwrap(),
        GetOutcome::NoData
    );
}

#[test]
fn overlapping_wildcards_all_deliver() {
    let now = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let exact = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        None,
        TimeoutPolicy::KeepLast,
        true,
    );
    let mut src_pattern = Fingerprint::for_com_id(1000);
    src_pattern.src = SRC;
    let narrowed = add(
        &mut index,
        &mut subs,
        src_pattern,
        None,
        TimeoutPolicy::KeepLast,
        true,
    );
    let wildcard = add(
        &mut index,
        &mut subs,
        Fingerprint::default(),
        None,
        TimeoutPolicy::KeepLast,
        true,
    );

    let (events, matches) = index.deliver(&mut subs, &actual(1000), info(1000, 1), b"x", now);
    assert_eq!(matches, 3);
    let fired: Vec<SubHandle> = events
        .iter()
        .map(|e| match e {
            TrdpEvent::PdData { sub, .. } => *sub,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert!(fired.contains(&exact));
    assert!(fired.contains(&narrowed));
    assert!(fired.contains(&wildcard));
}

#[test]
fn source_filter_rejects_other_senders() {
    let now = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let mut pattern = Fingerprint::for_com_id(1000);
    pattern.src = Ipv4Addr::new(10, 0, 1, 102);
    add(
        &mut index,
        &mut subs,
        pattern,
        None,
        TimeoutPolicy::KeepLast,
        false,
    );
    let (_, matches) = index.deliver(&mut subs, &actual(1000), info(1000, 1), b"x", now);
    assert_eq!(matches, 0);
}

#[test]
fn stale_and_duplicate_sequences_are_dropped() {
    let now = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        None,
        TimeoutPolicy::KeepLast,
        false,
    );

    index.deliver(&mut subs, &actual(1000), info(1000, 5), b"five", now);
    // Duplicate and reordered straggler.
    index.deliver(&mut subs, &actual(1000), info(1000, 5), b"dup", now);
    index.deliver(&mut subs, &actual(1000), info(1000, 4), b"old", now);

    match index.get(&mut subs, handle, now).unwrap() {
        GetOutcome::Data { payload, info } => {
            assert_eq!(payload, b"five");
            assert_eq!(info.sequence_counter, 5);
        }
        other => panic!("unexpected {:?}", other),
    }

    // A counter half a range behind is stale, not newer.
    index.deliver(
        &mut subs,
        &actual(1000),
        info(1000, u32::MAX),
        b"wrap-old",
        now,
    );
    match index.get(&mut subs, handle, now).unwrap() {
        GetOutcome::Data { payload, .. } => assert_eq!(payload, b"five"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn timeout_fires_exactly_once_in_push_mode() {
    let t0 = Instant::now();
    let timeout = Duration::from_millis(300);
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        Some(timeout),
        TimeoutPolicy::KeepLast,
        true,
    );

    index.deliver(&mut subs, &actual(1000), info(1000, 1), b"x", t0);

    // Before the deadline: nothing.
    assert!(index.sweep(&mut subs, t0 + Duration::from_millis(299)).is_empty());
    // At the deadline: exactly one event.
    let events = index.sweep(&mut subs, t0 + Duration::from_millis(300));
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        TrdpEvent::PdTimeout { sub, com_id: 1000 } if sub == handle
    ));
    // Repeated sweeps stay silent until fresh data restarts the clock.
    assert!(index.sweep(&mut subs, t0 + Duration::from_secs(10)).is_empty());

    let t1 = t0 + Duration::from_secs(11);
    index.deliver(&mut subs, &actual(1000), info(1000, 2), b"y", t1);
    let events = index.sweep(&mut subs, t1 + timeout);
    assert_eq!(events.len(), 1);
}

#[test]
fn fresh_data_rearms_pending_deadline() {
    let t0 = Instant::now();
    let timeout = Duration::from_millis(300);
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        Some(timeout),
        TimeoutPolicy::KeepLast,
        true,
    );

    index.deliver(&mut subs, &actual(1000), info(1000, 1), b"x", t0);
    // Fresh sample 200 ms in; the first deadline entry is stale.
    index.deliver(
        &mut subs,
        &actual(1000),
        info(1000, 2),
        b"y",
        t0 + Duration::from_millis(200),
    );
    assert!(index.sweep(&mut subs, t0 + Duration::from_millis(300)).is_empty());
    let events = index.sweep(&mut subs, t0 + Duration::from_millis(500));
    assert_eq!(events.len(), 1);
}

fn run_policy(policy: TimeoutPolicy) -> (GetOutcome, GetOutcome, GetOutcome) {
    let t0 = Instant::now();
    let timeout = Duration::from_millis(300);
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        Some(timeout),
        policy,
        false,
    );
    index.deliver(&mut subs, &actual(1000), info(1000, 1), b"stale", t0);
    index.sweep(&mut subs, t0 + Duration::from_millis(300));
    let late = t0 + Duration::from_millis(400);
    (
        index.get(&mut subs, handle, late).unwrap(),
        index.get(&mut subs, handle, late).unwrap(),
        index.get(&mut subs, handle, late).unwrap(),
    )
}

#[test]
fn keep_last_policy_returns_stale_data_with_timeout() {
    let (a, b, _) = run_policy(TimeoutPolicy::KeepLast);
    for outcome in [a, b] {
        match outcome {
            GetOutcome::Stale { payload, .. } => {
                assert_eq!(payload.as_deref(), Some(&b"stale"[..]))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn zero_on_timeout_policy_reports_once_then_no_data() {
    let (a, b, c) = run_policy(TimeoutPolicy::ZeroOnTimeout);
    assert!(matches!(a, GetOutcome::Stale { payload: None, .. }));
    assert_eq!(b, GetOutcome::NoData);
    assert_eq!(c, GetOutcome::NoData);
}

#[test]
fn invalidate_policy_reports_timeout_until_fresh_data() {
    let (a, b, c) = run_policy(TimeoutPolicy::Invalidate);
    for outcome in [a, b, c] {
        assert!(matches!(outcome, GetOutcome::Stale { payload: None, .. }));
    }
}

#[test]
fn get_observes_expiry_before_sweep_runs() {
    let t0 = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1000),
        Some(Duration::from_millis(300)),
        TimeoutPolicy::ZeroOnTimeout,
        false,
    );
    index.deliver(&mut subs, &actual(1000), info(1000, 1), b"x", t0);
    // No sweep ran, but the deadline has passed.
    let late = t0 + Duration::from_millis(301);
    assert!(matches!(
        index.get(&mut subs, handle, late).unwrap(),
        GetOutcome::Stale { payload: None, .. }
    ));
    assert_eq!(index.get(&mut subs, handle, late).unwrap(), GetOutcome::NoData);
}

#[test]
fn get_outcome_maps_to_result_codes() {
    let (a, _, _) = run_policy(TimeoutPolicy::KeepLast);
    assert!(matches!(
        a.result(),
        Err(trdp_stack::TrdpError::Timeout)
    ));
    assert!(GetOutcome::NoData.result().is_err());
    let now = Instant::now();
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let handle = add(
        &mut index,
        &mut subs,
        Fingerprint::for_com_id(1),
        None,
        TimeoutPolicy::KeepLast,
        false,
    );
    index.deliver(&mut subs, &actual(1), info(1, 1), b"x", now);
    assert!(index.get(&mut subs, handle, now).unwrap().result().is_ok());
}

#[test]
fn duplicate_pattern_is_detected() {
    let mut index = SubscriberIndex::new();
    let mut subs = Registry::new();
    let pattern = Fingerprint::for_com_id(1000);
    let handle = add(
        &mut index,
        &mut subs,
        pattern,
        None,
        TimeoutPolicy::KeepLast,
        false,
    );
    assert_eq!(index.duplicate_of(&subs, &pattern), Some(handle));
    let mut other = pattern;
    other.src = SRC;
    assert_eq!(index.duplicate_of(&subs, &other), None);
}
