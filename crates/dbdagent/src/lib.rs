pub mod agent;
pub mod common;
pub mod config;
pub mod dbd_conn;
pub mod ext;
pub mod messages;
pub mod transfer;

#[cfg(test)]
mod tests;

pub use crate::agent::AccountingAgent;
pub use crate::common::error::DbdError;
pub use crate::config::{AgentConfig, AgentConfigBuilder, ExtHost, OverflowAction};
pub use crate::dbd_conn::DbdConn;
pub use crate::ext::ExtDbdManager;
pub use crate::messages::{DbdMsg, DbdMsgType};

pub type Error = DbdError;
pub type Result<T> = std::result::Result<T, Error>;

/// Upper bound of a single frame on the wire.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// Upper bound of the payload coalesced into one batch envelope.
pub const MAX_MSG_SIZE: usize = 16 * 1024 * 1024;
/// Upper bound of messages coalesced into one batch envelope.
pub const MAX_BATCH_MSGS: usize = 1000;
