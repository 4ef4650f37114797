use thiserror::Error;

/// Errors produced while encoding or decoding a frame.
///
/// Decode errors are terminal for the datagram in question: the engine
/// drops the bytes, bumps a diagnostic counter and behaves as if no
/// packet had arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("payload of {len} bytes exceeds the plane maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown message type magic {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported protocol version {0:#06x}")]
    BadVersion(u16),
    #[error("header FCS mismatch")]
    BadHeaderCrc,
    #[error("payload FCS mismatch")]
    BadPayloadCrc,
}
