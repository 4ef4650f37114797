use std::net::Ipv4Addr;
use trdp_proto::frame::{encode_md, encode_pd, peek_md_len};
use trdp_proto::{
    md_wire_len, topo_accepted, Frame, MdHeader, MsgType, PdHeader, SessionId, Uri, WireError,
    MD_MAX_PAYLOAD, PD_MAX_PAYLOAD,
};

fn sample_pd() -> PdHeader {
    let mut h = PdHeader::new(MsgType::Pd, 1000);
    h.sequence_counter = 7;
    h.etb_topo_count = 0xaabbccdd;
    h.op_trn_topo_count = 0x11223344;
    h
}

fn sample_md() -> MdHeader {
    let mut h = MdHeader::new(MsgType::Mr, 5000, SessionId([0x42; 16]));
    h.sequence_counter = 3;
    h.reply_timeout = 500_000;
    h.source_uri = Uri::new("devA.car1.train").unwrap();
    h.destination_uri = Uri::new("devB.car2.train").unwrap();
    h
}

#[test]
fn pd_roundtrip() {
    let header = sample_pd();
    let wire = encode_pd(&header, b"hello").unwrap();
    assert_eq!(wire.len(), 40 + 5 + 4);
    match Frame::decode(&wire).unwrap() {
        Frame::Pd {
            header: got,
            payload,
        } => {
            assert_eq!(got, header);
            assert_eq!(payload, b"hello");
        }
        other => panic!("expected PD frame, got {:?}", other),
    }
}

#[test]
fn md_roundtrip() {
    let header = sample_md();
    let payload = vec![0xa5u8; 300];
    let wire = encode_md(&header, &payload).unwrap();
    assert_eq!(wire.len(), md_wire_len(300));
    match Frame::decode(&wire).unwrap() {
        Frame::Md {
            header: got,
            payload: body,
        } => {
            assert_eq!(got, header);
            assert_eq!(body, payload);
        }
        other => panic!("expected MD frame, got {:?}", other),
    }
}

#[test]
fn empty_payload_roundtrip() {
    let wire = encode_pd(&sample_pd(), b"").unwrap();
    assert_eq!(wire.len(), 44);
    assert!(matches!(Frame::decode(&wire), Ok(Frame::Pd { .. })));
}

#[test]
fn oversize_payload_rejected_per_plane() {
    let pd = encode_pd(&sample_pd(), &vec![0u8; PD_MAX_PAYLOAD + 1]);
    assert!(matches!(pd, Err(WireError::TooLarge { .. })));
    // The same payload is fine on the MD plane.
    let md = encode_md(&sample_md(), &vec![0u8; PD_MAX_PAYLOAD + 1]);
    assert!(md.is_ok());
    let md = encode_md(&sample_md(), &vec![0u8; MD_MAX_PAYLOAD + 1]);
    assert!(matches!(md, Err(WireError::TooLarge { .. })));
}

#[test]
fn unknown_magic_rejected() {
    let mut wire = encode_pd(&sample_pd(), b"x").unwrap();
    wire[6] = b'X';
    assert!(matches!(
        Frame::decode(&wire),
        Err(WireError::BadMagic(_))
    ));
}

#[test]
fn wrong_major_version_rejected() {
    let mut wire = encode_pd(&sample_pd(), b"x").unwrap();
    wire[4] = 0x02;
    assert!(matches!(
        Frame::decode(&wire),
        Err(WireError::BadVersion(_))
    ));
}

#[test]
fn minor_version_is_wire_compatible() {
    let mut header = sample_pd();
    header.proto_version = 0x0105;
    let wire = encode_pd(&header, b"x").unwrap();
    match Frame::decode(&wire).unwrap() {
        Frame::Pd { header: got, .. } => assert_eq!(got.proto_version, 0x0105),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn corrupt_header_rejected() {
    let mut wire = encode_pd(&sample_pd(), b"payload").unwrap();
    wire[9] ^= 0x01; // comId
    assert_eq!(Frame::decode(&wire), Err(WireError::BadHeaderCrc));
}

#[test]
fn corrupt_payload_rejected() {
    let mut wire = encode_md(&sample_md(), b"payload").unwrap();
    let idx = wire.len() - 6; // inside the payload
    wire[idx] ^= 0x80;
    assert_eq!(Frame::decode(&wire), Err(WireError::BadPayloadCrc));
}

#[test]
fn truncated_rejected() {
    let wire = encode_md(&sample_md(), b"payload").unwrap();
    for cut in [0, 7, 23, 115, wire.len() - 1] {
        assert!(
            matches!(Frame::decode(&wire[..cut]), Err(WireError::Truncated { .. })),
            "cut at {} not detected",
            cut
        );
    }
}

#[test]
fn reply_fields_roundtrip() {
    let mut header = PdHeader::new(MsgType::Pr, 1000);
    header.reply_com_id = 1001;
    header.reply_ip = Ipv4Addr::new(10, 0, 1, 17);
    let wire = encode_pd(&header, b"").unwrap();
    match Frame::decode(&wire).unwrap() {
        Frame::Pd { header: got, .. } => {
            assert_eq!(got.reply_com_id, 1001);
            assert_eq!(got.reply_ip, Ipv4Addr::new(10, 0, 1, 17));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn stream_peek_reports_frame_length() {
    let wire = encode_md(&sample_md(), &[1, 2, 3]).unwrap();
    assert_eq!(peek_md_len(&wire[..10]).unwrap(), None);
    assert_eq!(peek_md_len(&wire).unwrap(), Some(wire.len()));
    // A PD magic in the stream position means the peer is broken.
    let pd = encode_pd(&sample_pd(), b"").unwrap();
    assert!(peek_md_len(&pd).is_err());
}

#[test]
fn topo_check_wildcards() {
    assert!(topo_accepted((0, 0), (5, 9)));
    assert!(topo_accepted((5, 9), (0, 0)));
    assert!(topo_accepted((5, 9), (5, 9)));
    assert!(topo_accepted((5, 0), (5, 123)));
    assert!(!topo_accepted((5, 9), (6, 9)));
    assert!(!topo_accepted((5, 9), (5, 8)));
}

#[test]
fn uri_pattern_matching() {
    let any = Uri::ANY;
    let a = Uri::new("devA").unwrap();
    let b = Uri::new("devB").unwrap();
    assert!(any.accepts(&a));
    assert!(a.accepts(&a));
    assert!(!a.accepts(&b));
    assert!(Uri::new(&"x".repeat(33)).is_none());
}
