//! One miner's protocol session.
//!
//! A [`Session`] owns a [`Transport`] and runs until the miner hangs up, the
//! miner breaks protocol, or the server shuts down. It reacts to two
//! sources: messages from the miner and job updates from the scheduler.
//!
//! Protocol violations (a message the current state does not allow) end
//! the session without a reply. Share rejections are replies; the session
//! stays up.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::Transport;
use super::error::{ShareError, StratumError, StratumResult};
use super::messages::{ClientRequest, JsonRpcMessage};
use super::server::ServerEvent;
use crate::algorithm::{Algorithm, SessionWork};
use crate::error::Result;
use crate::job::{unix_time, Job, JobSet, JobUpdate};
use crate::share::{Share, ShareContext};
use crate::tracing::prelude::*;

/// Idle time after which a session is dropped at its next job send.
///
/// Only submits count as activity.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Decides whether a worker may mine on this pool.
#[async_trait]
pub trait Authorizer: Debug + Send + Sync {
    /// An error ends the session.
    async fn authorize(&self, worker: &str) -> Result<bool>;
}

/// Authorizes every worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _worker: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DisconnectReason {
    #[strum(to_string = "Not subscribed")]
    NotSubscribed,

    #[strum(to_string = "Subscribed but already subscribed")]
    AlreadySubscribed,

    #[strum(to_string = "Share submit but not authorized")]
    SubmitBeforeAuthorize,

    #[strum(to_string = "Error while authorizing")]
    AuthorizationError,

    #[strum(to_string = "Timed out")]
    Timeout,

    #[strum(to_string = "Malformed message")]
    MalformedMessage,

    #[strum(to_string = "Socket error")]
    SocketError,

    #[strum(to_string = "Connection closed")]
    ConnectionClosed,

    #[strum(to_string = "Job source closed")]
    JobSourceClosed,

    #[strum(to_string = "Internal error")]
    InternalError,

    #[strum(to_string = "Server shutting down")]
    Shutdown,
}

/// Things that happen to a session, reported to the server's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Subscribed,
    Authorized { worker: String },
    Disconnected { reason: DisconnectReason },
    Timeout,
    SocketError(String),
    MalformedMessage(String),
    UnknownMethod(String),
}

/// Pool-wide state sessions work against.
#[derive(Debug, Clone)]
pub struct SessionShared {
    pub algorithm: Arc<dyn Algorithm>,
    pub jobs: JobSet,
    pub authorizer: Arc<dyn Authorizer>,

    /// Share difficulty on the pool scale
    pub difficulty: f64,

    pub events: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Subscribed,
    Authorized,
}

/// `Err` ends the session.
type Step = std::result::Result<(), DisconnectReason>;

pub struct Session<T: Transport> {
    transport: T,
    subscription_id: String,
    extranonce1: Vec<u8>,
    shared: SessionShared,
    job_rx: broadcast::Receiver<JobUpdate>,
    shutdown: CancellationToken,

    state: State,
    worker: Option<String>,
    last_activity: Instant,
    current_job: Option<Arc<Job>>,
    previous_job: Option<Arc<Job>>,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        subscription_id: String,
        extranonce1: Vec<u8>,
        shared: SessionShared,
        job_rx: broadcast::Receiver<JobUpdate>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            subscription_id,
            extranonce1,
            shared,
            job_rx,
            shutdown,
            state: State::New,
            worker: None,
            last_activity: Instant::now(),
            current_job: None,
            previous_job: None,
        }
    }

    /// Serve the miner until the session ends.
    pub async fn run(mut self) {
        self.emit(SessionEvent::Connected);
        let reason = self.serve().await;
        debug!(
            subscription_id = %self.subscription_id,
            worker = self.worker.as_deref().unwrap_or("-"),
            %reason,
            "Session ended"
        );
        self.emit(SessionEvent::Disconnected { reason });
    }

    async fn serve(&mut self) -> DisconnectReason {
        loop {
            let step = tokio::select! {
                _ = self.shutdown.cancelled() => Err(DisconnectReason::Shutdown),
                result = self.transport.read_message() => self.handle_read(result).await,
                update = self.job_rx.recv() => self.handle_job_update(update).await,
            };

            if let Err(reason) = step {
                return reason;
            }
        }
    }

    async fn handle_read(&mut self, result: StratumResult<Option<JsonRpcMessage>>) -> Step {
        match result {
            Ok(Some(msg)) => self.handle_message(msg).await,
            Ok(None) => Err(DisconnectReason::ConnectionClosed),
            Err(
                e @ (StratumError::Malformed(_)
                | StratumError::MessageTooLong(_)
                | StratumError::Json(_)),
            ) => self.malformed(e.to_string()),
            Err(e) => {
                self.emit(SessionEvent::SocketError(e.to_string()));
                Err(DisconnectReason::SocketError)
            }
        }
    }

    async fn handle_message(&mut self, msg: JsonRpcMessage) -> Step {
        let (id, request) = match ClientRequest::from_message(&msg) {
            Ok(decoded) => decoded,
            Err(e) => return self.malformed(e.to_string()),
        };

        match (self.state, request) {
            (State::New, ClientRequest::Subscribe) => self.subscribe(id).await,
            (State::New, _) => Err(DisconnectReason::NotSubscribed),
            (_, ClientRequest::Subscribe) => Err(DisconnectReason::AlreadySubscribed),

            (State::Subscribed, ClientRequest::Authorize { worker }) => {
                self.authorize(id, worker).await
            }
            (State::Subscribed, ClientRequest::Submit(_)) => {
                Err(DisconnectReason::SubmitBeforeAuthorize)
            }

            (State::Authorized, ClientRequest::Submit(params)) => {
                self.last_activity = Instant::now();
                self.submit(id, params).await
            }

            (_, ClientRequest::ExtranonceSubscribe) => {
                self.send(&JsonRpcMessage::response(id, json!(false))).await
            }

            // Authorize is once per session.
            (State::Authorized, ClientRequest::Authorize { .. }) => {
                self.unknown_method(id, msg.method().unwrap_or_default().to_string())
                    .await
            }
            (_, ClientRequest::Unknown(method)) => self.unknown_method(id, method).await,
        }
    }

    async fn subscribe(&mut self, id: Option<u64>) -> Step {
        self.state = State::Subscribed;
        let result = self
            .shared
            .algorithm
            .subscribe_result(&self.subscription_id, &self.extranonce1);
        self.send(&JsonRpcMessage::response(id, result)).await?;
        self.emit(SessionEvent::Subscribed);
        Ok(())
    }

    async fn authorize(&mut self, id: Option<u64>, worker: Option<String>) -> Step {
        let Some(worker) = worker else {
            let error = ShareError::UnauthorizedWorker.to_response();
            return self.send(&JsonRpcMessage::error_response(id, error)).await;
        };

        let authorized = match self.shared.authorizer.authorize(&worker).await {
            Ok(authorized) => authorized,
            Err(e) => {
                warn!(%worker, error = %e, "Error while authorizing worker");
                return Err(DisconnectReason::AuthorizationError);
            }
        };

        let error = (!authorized).then(|| ShareError::UnauthorizedWorker.to_response());
        self.send(&reply(id, json!(authorized), error)).await?;
        if !authorized {
            return Ok(());
        }

        info!(subscription_id = %self.subscription_id, %worker, "Worker authorized");
        self.state = State::Authorized;
        self.worker = Some(worker.clone());
        self.emit(SessionEvent::Authorized { worker });

        match self.shared.jobs.current() {
            Some(job) => self.send_job(job, true).await,
            None => Ok(()),
        }
    }

    async fn submit(&mut self, id: Option<u64>, params: Vec<Value>) -> Step {
        let submission = match self.shared.algorithm.parse_submit(&params) {
            Ok(submission) => submission,
            Err(e) => return self.malformed(e.to_string()),
        };

        let sent = |job: &Option<Arc<Job>>| job.as_ref().is_some_and(|j| j.id() == submission.job_id);
        if !sent(&self.current_job) && !sent(&self.previous_job) {
            debug!(job_id = %submission.job_id, "Share for a job this session was not sent");
        }

        let mut share = Share::new(
            submission,
            ShareContext {
                subscription_id: self.subscription_id.clone(),
                extranonce1: self.extranonce1.clone(),
                authorized_worker: self.worker.clone(),
                session_difficulty: self.shared.difficulty,
                submit_time: unix_time(),
            },
        );

        let jobs = self.shared.jobs.clone();
        let algorithm = self.shared.algorithm.clone();
        let validated = tokio::task::spawn_blocking(move || {
            share.validate(&jobs, algorithm.as_ref());
            share
        })
        .await;

        let share = match validated {
            Ok(share) => share,
            Err(e) => {
                error!(error = %e, "Share validation task failed");
                return Err(DisconnectReason::InternalError);
            }
        };

        trace!(
            worker = share.worker_name(),
            job_id = share.job_id(),
            valid = share.is_valid_share(),
            error = ?share.error(),
            "Share validated"
        );

        let response = reply(
            id,
            json!(share.is_valid_share()),
            share.error().map(|e| e.to_response()),
        );
        let _ = self.shared.events.send(ServerEvent::Share(Box::new(share)));
        self.send(&response).await
    }

    async fn unknown_method(&mut self, id: Option<u64>, method: String) -> Step {
        debug!(subscription_id = %self.subscription_id, %method, "Unknown stratum method");
        self.emit(SessionEvent::UnknownMethod(method));
        match id {
            Some(_) => self.send(&JsonRpcMessage::response(id, json!(false))).await,
            None => Ok(()),
        }
    }

    async fn handle_job_update(
        &mut self,
        update: std::result::Result<JobUpdate, RecvError>,
    ) -> Step {
        let update = match update {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                // A missed update may have been a new block.
                warn!(subscription_id = %self.subscription_id, skipped, "Session fell behind job updates");
                match self.shared.jobs.current() {
                    Some(job) => JobUpdate {
                        job,
                        is_new_block: true,
                    },
                    None => return Ok(()),
                }
            }
            Err(RecvError::Closed) => return Err(DisconnectReason::JobSourceClosed),
        };

        if self.state != State::Authorized {
            return Ok(());
        }
        self.send_job(update.job, update.is_new_block).await
    }

    async fn send_job(&mut self, job: Arc<Job>, is_new_block: bool) -> Step {
        if self.last_activity.elapsed() > SESSION_TIMEOUT {
            info!(
                subscription_id = %self.subscription_id,
                worker = self.worker.as_deref().unwrap_or("-"),
                "Session timed out"
            );
            self.emit(SessionEvent::Timeout);
            return Err(DisconnectReason::Timeout);
        }

        self.previous_job = if is_new_block {
            None
        } else {
            self.current_job.take()
        };

        let work = SessionWork {
            subscription_id: &self.subscription_id,
            extranonce1: &self.extranonce1,
            difficulty: self.shared.difficulty,
        };
        let messages = self.shared.algorithm.job_messages(&job, work, is_new_block);
        self.current_job = Some(job);

        for msg in &messages {
            self.send(msg).await?;
        }
        Ok(())
    }

    fn malformed(&self, detail: String) -> Step {
        warn!(subscription_id = %self.subscription_id, %detail, "Malformed message");
        self.emit(SessionEvent::MalformedMessage(detail));
        Err(DisconnectReason::MalformedMessage)
    }

    async fn send(&mut self, msg: &JsonRpcMessage) -> Step {
        if let Err(e) = self.transport.write_message(msg).await {
            self.emit(SessionEvent::SocketError(e.to_string()));
            return Err(DisconnectReason::SocketError);
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.shared.events.send(ServerEvent::Session {
            subscription_id: self.subscription_id.clone(),
            event,
        });
    }
}

/// Response carrying both a result and an error.
fn reply(id: Option<u64>, result: Value, error: Option<Value>) -> JsonRpcMessage {
    JsonRpcMessage::Response {
        id,
        result: Some(result),
        error,
    }
}
