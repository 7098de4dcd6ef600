//! Daemon lifecycle management for mujina-pool.
//!
//! This module handles startup from configuration, signal handling and
//! graceful shutdown. SIGINT and SIGTERM stop the pool; SIGUSR1 tells it the
//! node has a new block, for use from the node's `-blocknotify` hook.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::algorithm::{Algorithm, Sha256d};
use crate::config::{AlgorithmKind, Config};
use crate::error::{Error, Result};
use crate::node::{NodeRpc, RpcClient};
use crate::pool::{Pool, PoolEvent, PoolSettings};
use crate::stratum_v1::{AllowAll, SessionEvent};
use crate::tracing::prelude::*;

/// The main daemon that runs the pool.
pub struct Daemon {
    config: Config,
    algorithm: Option<Arc<dyn Algorithm>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            algorithm: None,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Serve `algorithm` instead of the one named in the configuration.
    ///
    /// FiroPow and MTP need an external verifier, so they can only be run
    /// this way.
    pub fn with_algorithm(config: Config, algorithm: Arc<dyn Algorithm>) -> Self {
        Self {
            algorithm: Some(algorithm),
            ..Self::new(config)
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let algorithm = match self.algorithm {
            Some(algorithm) => algorithm,
            None => algorithm_for(self.config.pool.algorithm)?,
        };

        let node_config = &self.config.node;
        let node: Arc<dyn NodeRpc> = Arc::new(RpcClient::new(
            &node_config.url,
            &node_config.user,
            &node_config.password,
        )?);
        check_addresses(node.as_ref(), &self.config)
            .await
            .context("checking payout addresses with the node")?;

        let settings = PoolSettings {
            server: self.config.server(),
            difficulty: self.config.pool.difficulty,
            scheduler: self.config.scheduler(),
            coinbase: self.config.coinbase()?,
        };
        let (pool, handle, events) = Pool::start(
            settings,
            node,
            algorithm,
            Arc::new(AllowAll),
            self.shutdown.clone(),
        )
        .await
        .context("starting pool")?;

        self.tracker.spawn(pool.run());
        self.tracker.spawn(log_events(events));
        self.tracker.close();

        info!(addr = %handle.local_addr(), "Started.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigusr1 = unix::signal(SignalKind::user_defined1())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                },
                _ = sigusr1.recv() => {
                    debug!("Received SIGUSR1, checking for new block");
                    handle.block_notify();
                },
            }
        }

        trace!("Shutting down.");
        self.shutdown.cancel();

        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Algorithm implementation for a configured algorithm name.
pub fn algorithm_for(kind: AlgorithmKind) -> Result<Arc<dyn Algorithm>> {
    match kind {
        AlgorithmKind::Sha256d => Ok(Arc::new(Sha256d)),
        AlgorithmKind::FiroPow | AlgorithmKind::Mtp => Err(Error::Config(format!(
            "algorithm {} needs an external verifier; start it with Daemon::with_algorithm",
            kind
        ))),
    }
}

/// Ask the node whether it accepts the addresses the pool pays.
pub async fn check_addresses(node: &dyn NodeRpc, config: &Config) -> Result<()> {
    let fee_address = config
        .pool
        .fee_address
        .as_deref()
        .filter(|_| config.pool.fee_basis_points > 0);

    for address in std::iter::once(config.pool.coinbase_address.as_str()).chain(fee_address) {
        if !node.validate_address(address).await? {
            return Err(Error::Config(format!(
                "node does not recognize address {}",
                address
            )));
        }
    }
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PoolEvent::Session {
                subscription_id,
                event,
            } => match event {
                SessionEvent::Disconnected { reason } => {
                    info!(%subscription_id, %reason, "Miner disconnected");
                }
                event => debug!(%subscription_id, ?event, "Session event"),
            },
            PoolEvent::ShareSubmitted(share) => {
                if share.is_valid_block() {
                    info!(
                        worker = share.worker_name(),
                        height = share.job_height(),
                        accepted = share.is_block_accepted(),
                        block_id = share.block_id().unwrap_or("-"),
                        "Block found"
                    );
                } else if share.is_valid_share() {
                    debug!(
                        worker = share.worker_name(),
                        share_diff = share.share_diff(),
                        "Share accepted"
                    );
                } else {
                    debug!(
                        worker = share.worker_name(),
                        error = ?share.error(),
                        "Share rejected"
                    );
                }
            }
            PoolEvent::NewBlock(job) => {
                info!(
                    height = job.height(),
                    difficulty = job.network_difficulty(),
                    "Mining new block"
                );
            }
            PoolEvent::NextJob(job) => {
                debug!(job_id = job.id(), height = job.height(), "Next job");
            }
        }
    }
}
