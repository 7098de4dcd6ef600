//! Communication with the coin node.
//!
//! The pool needs four things from the node: block templates, block
//! submission, a lookup to confirm a submitted block made it into the
//! chain, and address validation at startup. [`NodeRpc`] is that surface;
//! [`RpcClient`] implements it over the node's HTTP JSON-RPC interface.

mod rpc_client;

use std::fmt::Debug;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use rpc_client::RpcClient;

use crate::error::Result;
use crate::job::BlockTemplate;

#[derive(Error, Debug)]
pub enum RpcError {
    /// Connection failed, timed out or the body could not be read
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// HTTP 401; credentials are wrong and retrying will not help
    #[error("Node rejected username and/or password")]
    Unauthorized,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Invalid JSON from node: {0}")]
    Parse(#[from] serde_json::Error),

    /// The `error` member of the node's response
    #[error("Node returned error: {0}")]
    Rpc(Value),

    #[error("Node response has no result")]
    MissingResult,

    /// `submitblock` returned a rejection reason
    #[error("Block rejected: {0}")]
    Rejected(String),
}

/// The parts of a `getblock` result the pool reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockInfo {
    pub hash: String,

    #[serde(default)]
    pub height: u32,

    /// Transaction ids, coinbase first
    #[serde(default)]
    pub tx: Vec<String>,
}

impl BlockInfo {
    pub fn coinbase_txid(&self) -> Option<&str> {
        self.tx.first().map(String::as_str)
    }
}

#[async_trait]
pub trait NodeRpc: Debug + Send + Sync {
    /// `getblocktemplate`
    async fn get_block_template(&self) -> Result<BlockTemplate>;

    /// `submitblock`; a rejection is [`RpcError::Rejected`].
    async fn submit_block(&self, block_hex: &str) -> Result<()>;

    /// `getblock`
    async fn get_block(&self, block_id: &str) -> Result<BlockInfo>;

    /// `validateaddress`
    async fn validate_address(&self, address: &str) -> Result<bool>;
}
