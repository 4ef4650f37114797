//! Frame encoding and decoding.
//!
//! Layouts (all fields big-endian):
//!
//! ```text
//! PD:  seq u32 | ver u16 | type u16 | comId u32 | etbTopo u32 | opTopo u32
//!      | datasetLen u32 | reserved u32 | replyComId u32 | replyIp u32
//!      | headerFcs u32 | payload [datasetLen]u8 | payloadFcs u32
//!
//! MD:  seq u32 | ver u16 | type u16 | comId u32 | etbTopo u32 | opTopo u32
//!      | datasetLen u32 | reserved u32 | sessionId [16]u8 | replyTimeout u32
//!      | sourceUri [32]u8 | destUri [32]u8 | headerFcs u32
//!      | payload [datasetLen]u8 | payloadFcs u32
//! ```
//!
//! The header FCS covers every header byte before its own field; the
//! payload FCS covers exactly `datasetLen` bytes and is present even
//! for an empty payload.

use byteorder::{BigEndian, ByteOrder};

use crate::constants::{
    FCS_SIZE, MD_HEADER_SIZE, MD_MAX_PAYLOAD, PD_HEADER_SIZE, PD_MAX_PAYLOAD, PROTO_VERSION,
    SESSION_ID_LEN, URI_LEN,
};
use crate::crc::safety_crc;
use crate::error::WireError;
use crate::header::{MdHeader, MsgType, PdHeader, SessionId, Uri};

/// A decoded frame from either traffic plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Pd { header: PdHeader, payload: Vec<u8> },
    Md { header: MdHeader, payload: Vec<u8> },
}

/// Total wire size of an MD frame with the given payload length.
pub fn md_wire_len(dataset_length: usize) -> usize {
    MD_HEADER_SIZE + dataset_length + FCS_SIZE
}

/// Total wire size of a PD frame with the given payload length.
pub fn pd_wire_len(dataset_length: usize) -> usize {
    PD_HEADER_SIZE + dataset_length + FCS_SIZE
}

fn version_accepted(ver: u16) -> bool {
    ver >> 8 == PROTO_VERSION >> 8
}

/// Encodes a PD frame.
pub fn encode_pd(header: &PdHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > PD_MAX_PAYLOAD {
        return Err(WireError::TooLarge {
            len: payload.len(),
            max: PD_MAX_PAYLOAD,
        });
    }
    let mut buf = vec![0u8; pd_wire_len(payload.len())];
    BigEndian::write_u32(&mut buf[0..4], header.sequence_counter);
    BigEndian::write_u16(&mut buf[4..6], header.proto_version);
    BigEndian::write_u16(&mut buf[6..8], header.msg_type.to_wire());
    BigEndian::write_u32(&mut buf[8..12], header.com_id);
    BigEndian::write_u32(&mut buf[12..16], header.etb_topo_count);
    BigEndian::write_u32(&mut buf[16..20], header.op_trn_topo_count);
    BigEndian::write_u32(&mut buf[20..24], payload.len() as u32);
    BigEndian::write_u32(&mut buf[24..28], header.reserved);
    BigEndian::write_u32(&mut buf[28..32], header.reply_com_id);
    BigEndian::write_u32(&mut buf[32..36], u32::from(header.reply_ip));
    let hdr_fcs = safety_crc(&buf[0..36]);
    BigEndian::write_u32(&mut buf[36..40], hdr_fcs);
    buf[PD_HEADER_SIZE..PD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let pay_fcs = safety_crc(payload);
    let tail = PD_HEADER_SIZE + payload.len();
    BigEndian::write_u32(&mut buf[tail..tail + 4], pay_fcs);
    Ok(buf)
}

/// Encodes an MD frame.
pub fn encode_md(header: &MdHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MD_MAX_PAYLOAD {
        return Err(WireError::TooLarge {
            len: payload.len(),
            max: MD_MAX_PAYLOAD,
        });
    }
    let mut buf = vec![0u8; md_wire_len(payload.len())];
    BigEndian::write_u32(&mut buf[0..4], header.sequence_counter);
    BigEndian::write_u16(&mut buf[4..6], header.proto_version);
    BigEndian::write_u16(&mut buf[6..8], header.msg_type.to_wire());
    BigEndian::write_u32(&mut buf[8..12], header.com_id);
    BigEndian::write_u32(&mut buf[12..16], header.etb_topo_count);
    BigEndian::write_u32(&mut buf[16..20], header.op_trn_topo_count);
    BigEndian::write_u32(&mut buf[20..24], payload.len() as u32);
    BigEndian::write_u32(&mut buf[24..28], header.reserved);
    buf[28..28 + SESSION_ID_LEN].copy_from_slice(&header.session_id.0);
    BigEndian::write_u32(&mut buf[44..48], header.reply_timeout);
    buf[48..48 + URI_LEN].copy_from_slice(&header.source_uri.0);
    buf[80..80 + URI_LEN].copy_from_slice(&header.destination_uri.0);
    let hdr_fcs = safety_crc(&buf[0..112]);
    BigEndian::write_u32(&mut buf[112..116], hdr_fcs);
    buf[MD_HEADER_SIZE..MD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let pay_fcs = safety_crc(payload);
    let tail = MD_HEADER_SIZE + payload.len();
    BigEndian::write_u32(&mut buf[tail..tail + 4], pay_fcs);
    Ok(buf)
}

impl Frame {
    /// Decodes one complete frame from `buf`. The buffer must contain
    /// exactly one frame (datagram receive path); trailing garbage is
    /// reported as `Truncated` by the length cross-check.
    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.len() < 8 {
            return Err(WireError::Truncated {
                need: 8,
                have: buf.len(),
            });
        }
        let raw_type = BigEndian::read_u16(&buf[6..8]);
        let msg_type = MsgType::from_wire(raw_type).ok_or(WireError::BadMagic(raw_type))?;
        if msg_type.is_pd() {
            decode_pd(buf, msg_type)
        } else {
            decode_md(buf, msg_type)
        }
    }
}

fn decode_pd(buf: &[u8], msg_type: MsgType) -> Result<Frame, WireError> {
    if buf.len() < PD_HEADER_SIZE {
        return Err(WireError::Truncated {
            need: PD_HEADER_SIZE,
            have: buf.len(),
        });
    }
    let proto_version = BigEndian::read_u16(&buf[4..6]);
    if !version_accepted(proto_version) {
        return Err(WireError::BadVersion(proto_version));
    }
    if safety_crc(&buf[0..36]) != BigEndian::read_u32(&buf[36..40]) {
        return Err(WireError::BadHeaderCrc);
    }
    let dataset_length = BigEndian::read_u32(&buf[20..24]) as usize;
    if dataset_length > PD_MAX_PAYLOAD {
        return Err(WireError::TooLarge {
            len: dataset_length,
            max: PD_MAX_PAYLOAD,
        });
    }
    let need = pd_wire_len(dataset_length);
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            have: buf.len(),
        });
    }
    let payload = &buf[PD_HEADER_SIZE..PD_HEADER_SIZE + dataset_length];
    let tail = PD_HEADER_SIZE + dataset_length;
    if safety_crc(payload) != BigEndian::read_u32(&buf[tail..tail + 4]) {
        return Err(WireError::BadPayloadCrc);
    }
    let header = PdHeader {
        sequence_counter: BigEndian::read_u32(&buf[0..4]),
        proto_version,
        msg_type,
        com_id: BigEndian::read_u32(&buf[8..12]),
        etb_topo_count: BigEndian::read_u32(&buf[12..16]),
        op_trn_topo_count: BigEndian::read_u32(&buf[16..20]),
        reserved: BigEndian::read_u32(&buf[24..28]),
        reply_com_id: BigEndian::read_u32(&buf[28..32]),
        reply_ip: BigEndian::read_u32(&buf[32..36]).into(),
    };
    Ok(Frame::Pd {
        header,
        payload: payload.to_vec(),
    })
}

fn decode_md(buf: &[u8], msg_type: MsgType) -> Result<Frame, WireError> {
    if buf.len() < MD_HEADER_SIZE {
        return Err(WireError::Truncated {
            need: MD_HEADER_SIZE,
            have: buf.len(),
        });
    }
    let proto_version = BigEndian::read_u16(&buf[4..6]);
    if !version_accepted(proto_version) {
        return Err(WireError::BadVersion(proto_version));
    }
    if safety_crc(&buf[0..112]) != BigEndian::read_u32(&buf[112..116]) {
        return Err(WireError::BadHeaderCrc);
    }
    let dataset_length = BigEndian::read_u32(&buf[20..24]) as usize;
    if dataset_length > MD_MAX_PAYLOAD {
        return Err(WireError::TooLarge {
            len: dataset_length,
            max: MD_MAX_PAYLOAD,
        });
    }
    let need = md_wire_len(dataset_length);
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            have: buf.len(),
        });
    }
    let payload = &buf[MD_HEADER_SIZE..MD_HEADER_SIZE + dataset_length];
    let tail = MD_HEADER_SIZE + dataset_length;
    if safety_crc(payload) != BigEndian::read_u32(&buf[tail..tail + 4]) {
        return Err(WireError::BadPayloadCrc);
    }
    let mut session_id = SessionId::NIL;
    session_id.0.copy_from_slice(&buf[28..44]);
    let mut source_uri = Uri::ANY;
    source_uri.0.copy_from_slice(&buf[48..80]);
    let mut destination_uri = Uri::ANY;
    destination_uri.0.copy_from_slice(&buf[80..112]);
    let header = MdHeader {
        sequence_counter: BigEndian::read_u32(&buf[0..4]),
        proto_version,
        msg_type,
        com_id: BigEndian::read_u32(&buf[8..12]),
        etb_topo_count: BigEndian::read_u32(&buf[12..16]),
        op_trn_topo_count: BigEndian::read_u32(&buf[16..20]),
        reserved: BigEndian::read_u32(&buf[24..28]),
        session_id,
        reply_timeout: BigEndian::read_u32(&buf[44..48]),
        source_uri,
        destination_uri,
    };
    Ok(Frame::Md {
        header,
        payload: payload.to_vec(),
    })
}

/// Peeks at a byte stream for the length of the next MD frame.
///
/// Used by the TCP reframer: returns `Ok(None)` while fewer than the
/// length-bearing header bytes are buffered, the total frame length
/// once it can be computed, or an error when the stream is not
/// positioned at a valid MD header (the connection is then unusable,
/// since stream resynchronization is impossible).
pub fn peek_md_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
    if buf.len() < 24 {
        return Ok(None);
    }
    let raw_type = BigEndian::read_u16(&buf[6..8]);
    let msg_type = MsgType::from_wire(raw_type).ok_or(WireError::BadMagic(raw_type))?;
    if !msg_type.is_md() {
        return Err(WireError::BadMagic(raw_type));
    }
    let proto_version = BigEndian::read_u16(&buf[4..6]);
    if !version_accepted(proto_version) {
        return Err(WireError::BadVersion(proto_version));
    }
    let dataset_length = BigEndian::read_u32(&buf[20..24]) as usize;
    if dataset_length > MD_MAX_PAYLOAD {
        return Err(WireError::TooLarge {
            len: dataset_length,
            max: MD_MAX_PAYLOAD,
        });
    }
    Ok(Some(md_wire_len(dataset_length)))
}
