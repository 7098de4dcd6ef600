//! Common error types for mujina-pool.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the narrower error types of each subsystem. Share
//! rejections are not errors in this sense; they are data recorded on the
//! [`Share`](crate::share::Share) and live in [`crate::stratum_v1::ShareError`].

use thiserror::Error;

use crate::chain::AddressError;
use crate::job::CoinbaseError;
use crate::node::RpcError;

/// Main error type for mujina-pool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payout or pool address could not be turned into a script
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Coinbase transaction could not be constructed
    #[error("Coinbase error: {0}")]
    Coinbase(#[from] CoinbaseError),

    /// Block template from the node is unusable
    #[error("Template error: {0}")]
    Template(String),

    /// Node communication errors
    #[error("Node RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Generic errors for development
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
