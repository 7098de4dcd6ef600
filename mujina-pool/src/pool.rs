//! Pool coordinator.
//!
//! [`Pool::start`] wires the pieces together: the job scheduler, the
//! Stratum server and the node client. The running [`Pool`] then turns
//! what the server and scheduler report into [`PoolEvent`]s, and takes
//! winning shares through block submission:
//!
//! 1. `submitblock` with the serialized block.
//! 2. On success, a forced job refresh, so miners move to the next block.
//! 3. `getblock` to confirm the block is known to the node, recording its
//!    coinbase txid. If the node does not know it, the share is no longer
//!    counted as a block.
//!
//! Each submission runs in its own task so share intake never waits on the
//! node.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::algorithm::Algorithm;
use crate::error::Result;
use crate::job::{
    CoinbaseConfig, Job, JobSet, JobUpdate, Scheduler, SchedulerConfig, SchedulerHandle,
};
use crate::node::NodeRpc;
use crate::share::Share;
use crate::stratum_v1::{
    Authorizer, Server, ServerConfig, ServerEvent, SessionEvent, SessionShared,
};
use crate::tracing::prelude::*;

/// Job updates buffered per receiver before a slow one starts lagging.
const JOB_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub server: ServerConfig,

    /// Session difficulty, pool scale
    pub difficulty: f64,

    pub scheduler: SchedulerConfig,
    pub coinbase: CoinbaseConfig,
}

/// Everything observable about a running pool.
#[derive(Debug)]
pub enum PoolEvent {
    Session {
        subscription_id: String,
        event: SessionEvent,
    },

    /// A share after validation and, for blocks, submission
    ShareSubmitted(Box<Share>),

    /// First job on top of a new block
    NewBlock(Arc<Job>),

    /// Any other new job
    NextJob(Arc<Job>),
}

/// Control handle for a running pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    scheduler: SchedulerHandle,
    local_addr: SocketAddr,
}

impl PoolHandle {
    /// External notice that the node has a new block.
    pub fn block_notify(&self) {
        self.scheduler.block_notify();
    }

    /// Address the Stratum server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct Pool {
    node: Arc<dyn NodeRpc>,
    scheduler: SchedulerHandle,
    server_events: mpsc::UnboundedReceiver<ServerEvent>,
    job_rx: broadcast::Receiver<JobUpdate>,
    events: mpsc::UnboundedSender<PoolEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Pool {
    /// Build the first job, start the scheduler and open the server.
    ///
    /// Fails if the first job cannot be built or the server cannot bind.
    pub async fn start(
        settings: PoolSettings,
        node: Arc<dyn NodeRpc>,
        algorithm: Arc<dyn Algorithm>,
        authorizer: Arc<dyn Authorizer>,
        shutdown: CancellationToken,
    ) -> Result<(Self, PoolHandle, mpsc::UnboundedReceiver<PoolEvent>)> {
        let jobs = JobSet::new();
        let (job_tx, job_rx) = broadcast::channel(JOB_CHANNEL_CAPACITY);

        let (mut scheduler, scheduler_handle) = Scheduler::new(
            node.clone(),
            algorithm.clone(),
            settings.coinbase,
            settings.scheduler,
            jobs.clone(),
            job_tx.clone(),
            shutdown.clone(),
        );
        let first = scheduler.start().await?;
        info!(
            algorithm = algorithm.name(),
            height = first.height(),
            "First job ready"
        );

        let (server_events_tx, server_events) = mpsc::unbounded_channel();
        let shared = SessionShared {
            algorithm,
            jobs,
            authorizer,
            difficulty: settings.difficulty,
            events: server_events_tx,
        };
        let server = Server::bind(&settings.server, shared, job_tx, shutdown.clone()).await?;
        let local_addr = server.local_addr()?;

        let tracker = TaskTracker::new();
        tracker.spawn(scheduler.run());
        tracker.spawn(server.run());

        let (events, events_rx) = mpsc::unbounded_channel();
        let pool = Self {
            node,
            scheduler: scheduler_handle.clone(),
            server_events,
            job_rx,
            events,
            shutdown,
            tracker,
        };
        let handle = PoolHandle {
            scheduler: scheduler_handle,
            local_addr,
        };
        Ok((pool, handle, events_rx))
    }

    /// Coordinate until shutdown, then wait for in-flight work.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.server_events.recv() => self.handle_server_event(event),
                update = self.job_rx.recv() => match update {
                    Ok(update) => self.handle_job_update(update),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Pool fell behind job updates");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Pool stopped");
    }

    fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Session {
                subscription_id,
                event,
            } => {
                self.emit(PoolEvent::Session {
                    subscription_id,
                    event,
                });
            }
            ServerEvent::Share(share) => self.submit_share(*share),
        }
    }

    fn handle_job_update(&self, update: JobUpdate) {
        let event = if update.is_new_block {
            PoolEvent::NewBlock(update.job)
        } else {
            PoolEvent::NextJob(update.job)
        };
        self.emit(event);
    }

    fn submit_share(&self, share: Share) {
        if !share.is_valid_block() {
            self.emit(PoolEvent::ShareSubmitted(Box::new(share)));
            return;
        }

        let node = self.node.clone();
        let scheduler = self.scheduler.clone();
        let events = self.events.clone();
        self.tracker.spawn(async move {
            let share = submit_block(node.as_ref(), &scheduler, share).await;
            let _ = events.send(PoolEvent::ShareSubmitted(Box::new(share)));
        });
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}

/// Submit a winning share's block and record whether the node kept it.
async fn submit_block(node: &dyn NodeRpc, scheduler: &SchedulerHandle, mut share: Share) -> Share {
    let (Some(block_hex), Some(block_id)) = (share.block_hex(), share.block_id()) else {
        return share;
    };
    let block_id = block_id.to_string();

    info!(
        %block_id,
        height = share.job_height(),
        worker = share.worker_name(),
        "Submitting block"
    );

    if let Err(e) = node.submit_block(block_hex).await {
        error!(%block_id, error = %e, "Error while submitting block to node");
        return share;
    }

    if let Err(e) = scheduler.update_job().await {
        warn!(error = %e, "Job refresh after block submission failed");
    }

    match node.get_block(&block_id).await {
        Ok(block) => match block.coinbase_txid() {
            Some(txid) => {
                info!(%block_id, coinbase_txid = txid, "Block accepted");
                share.set_block_tx_id(Some(txid.to_string()));
            }
            None => {
                warn!(%block_id, "Node returned block without transactions");
                share.set_valid_block(false);
            }
        },
        Err(e) => {
            error!(%block_id, error = %e, "Failed to verify block submission");
            share.set_valid_block(false);
        }
    }

    share
}
