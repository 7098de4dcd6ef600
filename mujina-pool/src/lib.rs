//! Stratum v1 mining pool server.
//!
//! The pool takes block templates from a coin node, turns them into jobs,
//! serves them to miners over Stratum v1, validates the shares miners send
//! back and submits the ones that solve a block.
//!
//! Start at [`pool::Pool`] for the moving parts, or [`daemon::Daemon`] for
//! running one from a configuration file.

pub mod algorithm;
pub mod chain;
pub mod config;
pub mod counter;
pub mod daemon;
pub mod error;
pub mod job;
pub mod node;
pub mod pool;
pub mod share;
pub mod stratum_v1;
pub mod target;
pub mod tracing;
