//! Stratum v1 mining protocol server.
//!
//! Miners connect over TCP and speak JSON-RPC, newline-delimited unless the
//! server is configured for length-prefixed frames. Each
//! connection is driven by a [`Session`], which walks the protocol's
//! one-way state machine:
//!
//! ```text
//! New --subscribe--> Subscribed --authorize--> Authorized
//! ```
//!
//! A message that is out of place for the current state ends the session.
//! Once authorized, a session receives every job the scheduler broadcasts
//! and submits shares for validation.
//!
//! The [`Server`] accepts connections, hands each one a unique
//! subscription id (which doubles as its extranonce1) and forwards session
//! events and validated shares to its owner as [`ServerEvent`]s.

mod connection;
mod error;
pub mod messages;
mod server;
mod session;

pub use connection::{
    Connection, JsonLines, LengthPrefixed, StratumCodec, Transport, WireCodec, WireCodecKind,
    MAX_FRAME_LENGTH, MAX_LINE_LENGTH,
};
pub use error::{ErrorCode, ShareError, StratumError, StratumResult};
pub use messages::{
    ClientRequest, JsonRpcMessage, METHOD_AUTHORIZE, METHOD_EXTRANONCE_SUBSCRIBE, METHOD_NOTIFY,
    METHOD_SET_DIFFICULTY, METHOD_SET_TARGET, METHOD_SUBMIT, METHOD_SUBSCRIBE,
};
pub use server::{Server, ServerConfig, ServerEvent};
pub use session::{
    AllowAll, Authorizer, DisconnectReason, Session, SessionEvent, SessionShared, SESSION_TIMEOUT,
};

#[cfg(test)]
pub(crate) use connection::{MockTransport, MockTransportHandle};
