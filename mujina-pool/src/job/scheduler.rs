//! Job scheduling.
//!
//! The [`Scheduler`] turns block templates into jobs. It fetches a template
//! on a fixed interval, on an external block notification, and on request
//! (after the pool submits a block). An optional fast poll checks for a
//! new previous block hash more often than the refresh interval and only
//! builds a job when it sees one.
//!
//! Every new job goes into the [`JobSet`] and out to sessions on a
//! broadcast channel as a [`JobUpdate`]. A job for a new block clears the
//! job set, making shares for older jobs stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{unix_time, BlockTemplate, CoinbaseConfig, Job, JobSet};
use crate::algorithm::Algorithm;
use crate::counter::IdCounter;
use crate::error::{Error, Result};
use crate::node::NodeRpc;
use crate::tracing::prelude::*;

/// Refresh interval when none is configured.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(55);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between template fetches when nothing else triggers one
    pub refresh_interval: Duration,

    /// Fast poll for new blocks; `None` disables it
    pub block_poll_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            block_poll_interval: None,
        }
    }
}

/// A job handed to sessions.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job: Arc<Job>,

    /// The job builds on a block earlier jobs did not know about
    pub is_new_block: bool,
}

enum Command {
    BlockNotify,
    UpdateJob(oneshot::Sender<Result<Option<JobUpdate>>>),
}

/// Control handle for a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Tell the scheduler a new block arrived.
    ///
    /// Does not wait. Notifications arriving while one is queued are
    /// merged.
    pub fn block_notify(&self) {
        if self.commands.try_send(Command::BlockNotify).is_err() {
            debug!("Block notify dropped; scheduler busy or stopped");
        }
    }

    /// Fetch a template now and wait for the result.
    ///
    /// Returns the update broadcast, or `None` if the template was
    /// discarded as stale.
    pub async fn update_job(&self) -> Result<Option<JobUpdate>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::UpdateJob(reply_tx))
            .await
            .map_err(|_| Error::Other("scheduler stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Other("scheduler stopped".into()))?
    }
}

pub struct Scheduler {
    node: Arc<dyn NodeRpc>,
    algorithm: Arc<dyn Algorithm>,
    coinbase: CoinbaseConfig,
    config: SchedulerConfig,
    jobs: JobSet,
    job_tx: broadcast::Sender<JobUpdate>,
    ids: IdCounter,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        node: Arc<dyn NodeRpc>,
        algorithm: Arc<dyn Algorithm>,
        coinbase: CoinbaseConfig,
        config: SchedulerConfig,
        jobs: JobSet,
        job_tx: broadcast::Sender<JobUpdate>,
        shutdown: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (commands_tx, commands) = mpsc::channel(1);
        let scheduler = Self {
            node,
            algorithm,
            coinbase,
            config,
            jobs,
            job_tx,
            ids: IdCounter::new(),
            commands,
            shutdown,
        };
        (scheduler, SchedulerHandle { commands: commands_tx })
    }

    /// Build the first job.
    ///
    /// The pool cannot serve miners without one, so failure here is fatal
    /// to the caller.
    pub async fn start(&mut self) -> Result<Arc<Job>> {
        self.refresh().await?;
        self.jobs
            .current()
            .ok_or_else(|| Error::Template("first template is older than the current job".into()))
    }

    /// Schedule template fetches until shutdown.
    pub async fn run(mut self) {
        let period = self.config.refresh_interval;
        let mut refresh = interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poll = self.config.block_poll_interval.map(|period| {
            let mut poll = interval(period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });

        loop {
            let built = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = refresh.tick() => self.update("interval").await,
                _ = next_poll(&mut poll) => self.poll_block().await,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
            };

            if built {
                refresh.reset();
            }
        }

        debug!("Job scheduler stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::BlockNotify => self.update("block notify").await,
            Command::UpdateJob(reply) => {
                let result = self.refresh().await;
                if let Err(e) = &result {
                    error!(error = %e, "Failed to update job");
                }
                let built = matches!(result, Ok(Some(_)));
                let _ = reply.send(result);
                built
            }
        }
    }

    async fn update(&mut self, trigger: &str) -> bool {
        match self.refresh().await {
            Ok(update) => update.is_some(),
            Err(e) => {
                error!(%trigger, error = %e, "Failed to update job");
                false
            }
        }
    }

    /// Fetch a template and build a job from it.
    async fn refresh(&mut self) -> Result<Option<JobUpdate>> {
        let template = self.node.get_block_template().await?;
        self.apply(template)
    }

    /// Build a job only if the chain tip moved.
    async fn poll_block(&mut self) -> bool {
        let template = match self.node.get_block_template().await {
            Ok(template) => template,
            Err(e) => {
                debug!(error = %e, "Block poll failed");
                return false;
            }
        };

        let moved = self
            .jobs
            .current()
            .map_or(true, |job| job.prev_hash() != template.previousblockhash);
        if !moved {
            return false;
        }

        match self.apply(template) {
            Ok(update) => update.is_some(),
            Err(e) => {
                error!(error = %e, "Failed to build job from polled template");
                false
            }
        }
    }

    fn apply(&mut self, template: BlockTemplate) -> Result<Option<JobUpdate>> {
        let current = self.jobs.current();

        if let Some(current) = &current {
            if template.height < current.height() {
                debug!(
                    height = template.height,
                    current = current.height(),
                    "Discarding template older than current job"
                );
                return Ok(None);
            }
        }

        let is_new_block = current
            .as_ref()
            .map_or(true, |job| job.prev_hash() != template.previousblockhash);

        let jobs = &self.jobs;
        let id = self.ids.next_hex(|id| jobs.contains(id));
        let job = Arc::new(Job::new(
            id,
            &template,
            self.algorithm.as_ref(),
            &self.coinbase,
            unix_time(),
        )?);

        if is_new_block {
            info!(
                height = job.height(),
                prev_hash = job.prev_hash(),
                difficulty = job.network_difficulty(),
                "New block"
            );
        }
        info!(
            job_id = job.id(),
            height = job.height(),
            transactions = job.tx_count(),
            clean = is_new_block,
            "New job"
        );

        self.jobs.insert(job.clone(), is_new_block);
        let update = JobUpdate { job, is_new_block };

        // No receivers just means no sessions yet.
        let _ = self.job_tx.send(update.clone());
        Ok(Some(update))
    }
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Sha256d;
    use crate::job::template::test_data::{regtest, NEXT_PREV_HASH, PREV_HASH};
    use crate::job::test_util::coinbase_config;
    use crate::node::mock::MockNode;

    struct Harness {
        node: Arc<MockNode>,
        jobs: JobSet,
        job_rx: broadcast::Receiver<JobUpdate>,
        shutdown: CancellationToken,
    }

    fn scheduler(config: SchedulerConfig) -> (Scheduler, SchedulerHandle, Harness) {
        let node = Arc::new(MockNode::new(regtest(1000, PREV_HASH, 1)));
        let jobs = JobSet::new();
        let (job_tx, job_rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        let (scheduler, handle) = Scheduler::new(
            node.clone(),
            Arc::new(Sha256d),
            coinbase_config(),
            config,
            jobs.clone(),
            job_tx,
            shutdown.clone(),
        );
        let harness = Harness {
            node,
            jobs,
            job_rx,
            shutdown,
        };
        (scheduler, handle, harness)
    }

    #[tokio::test]
    async fn test_start_builds_first_job() {
        let (mut scheduler, _handle, mut h) = scheduler(SchedulerConfig::default());
        let job = scheduler.start().await.unwrap();

        assert_eq!(job.id(), "00000001");
        assert_eq!(job.height(), 1000);
        assert_eq!(h.jobs.len(), 1);

        let update = h.job_rx.recv().await.unwrap();
        assert!(update.is_new_block);
        assert_eq!(update.job.id(), "00000001");
    }

    #[tokio::test]
    async fn test_start_fails_without_template() {
        let (mut scheduler, _handle, h) = scheduler(SchedulerConfig::default());
        h.node.clear_template();
        assert!(scheduler.start().await.is_err());
        assert!(h.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_same_block_refresh_keeps_old_jobs() {
        let (mut scheduler, _handle, h) = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();

        h.node.set_template(regtest(1000, PREV_HASH, 4));
        let update = scheduler.refresh().await.unwrap().unwrap();
        assert!(!update.is_new_block);
        assert_eq!(update.job.id(), "00000002");
        assert_eq!(update.job.tx_count(), 4);
        assert!(h.jobs.contains("00000001"));
        assert!(h.jobs.contains("00000002"));
    }

    #[tokio::test]
    async fn test_new_block_clears_jobs() {
        let (mut scheduler, _handle, h) = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();

        h.node.set_template(regtest(1001, NEXT_PREV_HASH, 0));
        let update = scheduler.refresh().await.unwrap().unwrap();
        assert!(update.is_new_block);
        assert_eq!(h.jobs.len(), 1);
        assert!(!h.jobs.contains("00000001"));
    }

    #[tokio::test]
    async fn test_older_template_is_discarded() {
        let (mut scheduler, _handle, h) = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();

        h.node.set_template(regtest(999, NEXT_PREV_HASH, 0));
        assert!(scheduler.refresh().await.unwrap().is_none());
        assert_eq!(h.jobs.current().unwrap().height(), 1000);
        assert_eq!(h.jobs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_interval() {
        let (mut scheduler, _handle, mut h) = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();
        h.job_rx.recv().await.unwrap();

        let started = Instant::now();
        tokio::spawn(scheduler.run());

        let update = h.job_rx.recv().await.unwrap();
        assert_eq!(started.elapsed(), DEFAULT_REFRESH_INTERVAL);
        assert!(!update.is_new_block);
        assert_eq!(h.node.template_calls(), 2);

        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_notify() {
        let (mut scheduler, handle, mut h) = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();
        h.job_rx.recv().await.unwrap();
        tokio::spawn(scheduler.run());

        let started = Instant::now();
        h.node.set_template(regtest(1001, NEXT_PREV_HASH, 0));
        handle.block_notify();

        let update = h.job_rx.recv().await.unwrap();
        assert!(update.is_new_block);
        assert_eq!(update.job.height(), 1001);
        assert!(started.elapsed() < Duration::from_secs(1));

        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_update_job_waits_for_result() {
        let (mut scheduler, handle, h) = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();
        tokio::spawn(scheduler.run());

        let update = handle.update_job().await.unwrap().unwrap();
        assert_eq!(update.job.id(), "00000002");
        assert_eq!(h.node.template_calls(), 2);

        h.node.clear_template();
        assert!(handle.update_job().await.is_err());

        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_poll_acts_only_on_new_block() {
        let config = SchedulerConfig {
            refresh_interval: Duration::from_secs(3600),
            block_poll_interval: Some(Duration::from_millis(250)),
        };
        let (mut scheduler, _handle, mut h) = scheduler(config);
        scheduler.start().await.unwrap();
        h.job_rx.recv().await.unwrap();
        tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.node.template_calls() > 2);
        assert_eq!(h.jobs.len(), 1);

        h.node.set_template(regtest(1001, NEXT_PREV_HASH, 0));
        let update = h.job_rx.recv().await.unwrap();
        assert!(update.is_new_block);
        assert_eq!(update.job.height(), 1001);

        h.shutdown.cancel();
    }
}
