use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};

use trdp_proto::frame::encode_md;
use trdp_proto::{MdHeader, MsgType, SessionId};
use trdp_stack::mux::TcpPool;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const IDLE_TIMEOUT: Duration = Duration::from_millis(200);

fn md_frame(com_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = MdHeader::new(MsgType::Mr, com_id, SessionId([7; 16]));
    encode_md(&header, payload).unwrap()
}

/// Drives the poll briefly so connects complete and buffers flush.
fn pump(poll: &mut Poll, pool: &mut TcpPool, span: Duration) {
    let deadline = Instant::now() + span;
    let mut events = Events::with_capacity(16);
    while Instant::now() < deadline {
        poll.poll(&mut events, Some(Duration::from_millis(10))).unwrap();
        let now = Instant::now();
        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            if writable {
                pool.on_writable(token, now);
            }
            if readable {
                pool.on_readable(token, now);
            }
        }
    }
}

/// Drives the poll until `cond` is satisfied or the deadline passes.
fn drive<F: FnMut(&mut TcpPool) -> bool>(
    poll: &mut Poll,
    pool: &mut TcpPool,
    mut cond: F,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut events = Events::with_capacity(16);
    while Instant::now() < deadline {
        if cond(pool) {
            return true;
        }
        poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
        let now = Instant::now();
        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            if writable {
                pool.on_writable(token, now);
            }
            if readable {
                pool.on_readable(token, now);
            }
        }
    }
    cond(pool)
}

#[test]
fn requests_to_one_peer_share_one_connection() {
    let mut poll = Poll::new().unwrap();
    let mut pool = TcpPool::new(16, CONNECT_TIMEOUT, IDLE_TIMEOUT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer: SocketAddr = listener.local_addr().unwrap();
    let now = Instant::now();

    let frame = md_frame(5000, b"one");
    pool.send(peer, &frame, poll.registry(), now).unwrap();
    assert!(pool.has_connection(peer));

    let (mut accepted, _) = listener.accept().unwrap();
    accepted.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // Flush under the poll loop, then read the exact frame back.
    pump(&mut poll, &mut pool, Duration::from_millis(200));
    let mut buf = vec![0u8; frame.len()];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(buf, frame);

    // A second request within the idle window reuses the same socket.
    let frame2 = md_frame(5000, b"two");
    pool.send(peer, &frame2, poll.registry(), Instant::now())
        .unwrap();
    pump(&mut poll, &mut pool, Duration::from_millis(200));
    let mut buf = vec![0u8; frame2.len()];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(buf, frame2);

    listener.set_nonblocking(true).unwrap();
    assert!(
        listener.accept().is_err(),
        "second connection must not be dialed"
    );
}

#[test]
fn idle_connection_is_reaped_only_without_sessions() {
    let mut poll = Poll::new().unwrap();
    let mut pool = TcpPool::new(16, CONNECT_TIMEOUT, IDLE_TIMEOUT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer: SocketAddr = listener.local_addr().unwrap();
    let now = Instant::now();

    pool.send(peer, &md_frame(5000, b"x"), poll.registry(), now)
        .unwrap();
    let _accepted = listener.accept().unwrap();
    pump(&mut poll, &mut pool, Duration::from_millis(100));

    // Borrowing sessions defer reclamation past the idle threshold.
    let late = now + IDLE_TIMEOUT + Duration::from_millis(50);
    let dead = pool.reap(late, |_| 1);
    assert!(dead.is_empty());
    assert!(pool.has_connection(peer));

    // With no sessions the idle connection goes away silently.
    let dead = pool.reap(late, |_| 0);
    assert!(dead.is_empty(), "idle reap does not notify");
    assert!(!pool.has_connection(peer));
}

#[test]
fn activity_resets_the_idle_clock() {
    let mut poll = Poll::new().unwrap();
    let mut pool = TcpPool::new(16, CONNECT_TIMEOUT, IDLE_TIMEOUT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer: SocketAddr = listener.local_addr().unwrap();
    let t0 = Instant::now();

    pool.send(peer, &md_frame(5000, b"x"), poll.registry(), t0)
        .unwrap();
    let _accepted = listener.accept().unwrap();
    pump(&mut poll, &mut pool, Duration::from_millis(100));

    // Traffic at half the window keeps the connection alive past the
    // original expiry.
    let half = t0 + IDLE_TIMEOUT / 2;
    pool.send(peer, &md_frame(5000, b"y"), poll.registry(), half)
        .unwrap();
    assert!(pool.reap(t0 + IDLE_TIMEOUT, |_| 0).is_empty());
    assert!(pool.has_connection(peer));

    // The refreshed window expires later.
    pool.reap(half + IDLE_TIMEOUT + Duration::from_millis(1), |_| 0);
    assert!(!pool.has_connection(peer));
}

#[test]
fn inbound_frames_are_resliced_from_the_stream() {
    let mut poll = Poll::new().unwrap();
    let mut pool = TcpPool::new(16, CONNECT_TIMEOUT, IDLE_TIMEOUT);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer: SocketAddr = listener.local_addr().unwrap();
    let now = Instant::now();

    pool.send(peer, &md_frame(5000, b"hello"), poll.registry(), now)
        .unwrap();
    let (mut accepted, _) = listener.accept().unwrap();
    pump(&mut poll, &mut pool, Duration::from_millis(100));

    // The peer writes two frames back-to-back; both must come out
    // individually even though TCP delivers them as one byte run.
    let f1 = md_frame(5001, b"first");
    let f2 = md_frame(5002, b"second");
    let mut run = f1.clone();
    run.extend_from_slice(&f2);
    accepted.write_all(&run).unwrap();
    accepted.flush().unwrap();

    let mut collected = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut events = Events::with_capacity(16);
    while collected.len() < 2 && Instant::now() < deadline {
        poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
        let ready: Vec<(Token, bool)> = events
            .iter()
            .map(|e| (e.token(), e.is_readable()))
            .collect();
        for (token, readable) in ready {
            if readable {
                let (frames, _) = pool.on_readable(token, Instant::now());
                collected.extend(frames);
            }
        }
    }
    assert_eq!(collected.len(), 2);
    assert_eq!(collected[0].data, f1);
    assert_eq!(collected[1].data, f2);
    assert_eq!(collected[0].peer, peer);
}

#[test]
fn connect_to_dead_port_expires_with_notification() {
    let mut poll = Poll::new().unwrap();
    let mut pool = TcpPool::new(16, CONNECT_TIMEOUT, IDLE_TIMEOUT);
    // Grab a port and close it again so nothing listens there.
    let dead: SocketAddr = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let t0 = Instant::now();

    // The dial itself is nonblocking and succeeds; failure surfaces
    // through the poll loop or the connect deadline.
    if pool.send(dead, &md_frame(5000, b"x"), poll.registry(), t0).is_err() {
        return;
    }
    let gone = drive(&mut poll, &mut pool, |p| !p.has_connection(dead));
    if !gone {
        // Connect still pending: the deadline reaper must abandon it
        // and report the peer.
        let abandoned = pool.reap(t0 + CONNECT_TIMEOUT + Duration::from_millis(1), |_| 0);
        assert_eq!(abandoned, vec![dead]);
    }
    assert!(!pool.has_connection(dead));
}
