use std::io;
use thiserror::Error;
use trdp_proto::WireError;

/// The application-facing error surface.
///
/// Success is `Ok(())`; every failure an operation can report maps onto
/// exactly one of these kinds. Callback indications reuse the same kinds
/// through [`crate::event::ResultCode`].
#[derive(Debug, Error)]
pub enum TrdpError {
    #[error("argument out of range or required value missing")]
    Param,
    #[error("operation on an un-opened or closed session")]
    Init,
    #[error("unknown subscription or session reference")]
    NoSub,
    #[error("unknown publication")]
    NoPub,
    #[error("timed out")]
    Timeout,
    #[error("no data received")]
    NoData,
    #[error("unrecoverable socket error: {0}")]
    Socket(#[source] io::Error),
    #[error("recoverable send/receive failure: {0}")]
    Io(#[source] io::Error),
    #[error("operation would block")]
    Block,
    #[error("memory exhaustion")]
    Mem,
    #[error("synchronization primitive failure")]
    Mutex,
    #[error("TCP connection missing or dropped")]
    NoConn,
    #[error("header or payload CRC mismatch")]
    Crc,
    #[error("malformed packet: {0}")]
    Wire(WireError),
}

impl From<WireError> for TrdpError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::BadHeaderCrc | WireError::BadPayloadCrc => TrdpError::Crc,
            other => TrdpError::Wire(other),
        }
    }
}

pub type TrdpResult<T> = Result<T, TrdpError>;
