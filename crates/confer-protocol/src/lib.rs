//! Confer signaling protocol
//!
//! Wire types shared by the server and its clients: the JSON frames exchanged
//! over the signaling WebSocket and the RTP/ICE/DTLS descriptors they carry.

mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::{ClientMessage, ErrorKind, ErrorReply, Reply, Request, ServerMessage};
pub use types::*;
