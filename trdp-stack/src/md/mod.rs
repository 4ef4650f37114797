//! The message-data plane: correlated request/reply/confirm/notify
//! transactions over UDP or TCP.

pub mod session_id;
pub mod table;

pub use session_id::SessionIdGen;
pub use table::{
    ExchangePattern, Listener, MdRole, MdSend, MdSession, MdState, MdTable, Transport,
};
