//! TCP accept loop.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{Connection, StratumCodec, WireCodecKind};
use super::session::{Session, SessionEvent, SessionShared};
use crate::counter::{to_hex, IdCounter};
use crate::job::JobUpdate;
use crate::share::Share;
use crate::tracing::prelude::*;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub wire_codec: WireCodecKind,
}

/// What the server reports to its owner.
#[derive(Debug)]
pub enum ServerEvent {
    Session {
        subscription_id: String,
        event: SessionEvent,
    },

    /// A validated share, valid or not
    Share(Box<Share>),
}

/// Stratum server.
///
/// Each accepted connection gets a fresh 32-bit id, used both as its
/// subscription id and as its extranonce1. Ids held by live sessions are
/// never handed out again.
pub struct Server {
    listener: TcpListener,
    wire_codec: WireCodecKind,
    shared: SessionShared,
    job_tx: broadcast::Sender<JobUpdate>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    ids: IdCounter,
    live: Arc<Mutex<HashSet<u32>>>,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        shared: SessionShared,
        job_tx: broadcast::Sender<JobUpdate>,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        info!(
            addr = %listener.local_addr()?,
            wire_codec = %config.wire_codec,
            "Stratum server listening"
        );

        Ok(Self {
            listener,
            wire_codec: config.wire_codec,
            shared,
            job_tx,
            shutdown,
            tracker: TaskTracker::new(),
            ids: IdCounter::new(),
            live: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept miners until shutdown, then wait for their sessions to end.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Stratum server stopped");
    }

    fn spawn_session(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = {
            let mut live = self.live.lock();
            let id = self.ids.next(|n| live.contains(&n));
            live.insert(id);
            id
        };
        let subscription_id = to_hex(id);

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(%addr, %subscription_id, "Miner connected");

        let session = Session::new(
            Connection::with_codec(stream, StratumCodec::with_wire(self.wire_codec)),
            subscription_id,
            id.to_be_bytes().to_vec(),
            self.shared.clone(),
            self.job_tx.subscribe(),
            self.shutdown.child_token(),
        );

        let live = self.live.clone();
        self.tracker.spawn(async move {
            session.run().await;
            live.lock().remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Sha256d;
    use crate::job::template::test_data::{regtest, PREV_HASH};
    use crate::job::test_util::job_for;
    use crate::job::JobSet;
    use crate::stratum_v1::{AllowAll, JsonRpcMessage, StratumCodec};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::codec::Framed;

    async fn start(wire_codec: WireCodecKind) -> (
        SocketAddr,
        mpsc::UnboundedReceiver<ServerEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let jobs = JobSet::new();
        jobs.insert(job_for(regtest(1000, PREV_HASH, 0), &Sha256d), true);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (job_tx, _) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        let shared = SessionShared {
            algorithm: Arc::new(Sha256d),
            jobs,
            authorizer: Arc::new(AllowAll),
            difficulty: 1.0,
            events: events_tx,
        };
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            wire_codec,
        };
        let server = Server::bind(&config, shared, job_tx, shutdown.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());
        (addr, events, shutdown, task)
    }

    async fn subscribe(
        addr: SocketAddr,
        wire_codec: WireCodecKind,
    ) -> (Framed<TcpStream, StratumCodec>, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, StratumCodec::with_wire(wire_codec));
        let request = JsonRpcMessage::Request {
            id: Some(1),
            method: "mining.subscribe".into(),
            params: json!([]),
        };
        framed.send(&request).await.unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        let JsonRpcMessage::Response {
            result: Some(result),
            ..
        } = reply
        else {
            panic!("unexpected reply {:?}", reply);
        };
        let extranonce1 = result[1].as_str().unwrap().to_string();
        (framed, extranonce1)
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_extranonce1() {
        let (addr, _events, shutdown, task) = start(WireCodecKind::JsonLines).await;

        let (_first, en1_a) = subscribe(addr, WireCodecKind::JsonLines).await;
        let (_second, en1_b) = subscribe(addr, WireCodecKind::JsonLines).await;
        assert_eq!(en1_a, "00000001");
        assert_eq!(en1_b, "00000002");

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_and_shutdown() {
        let (addr, mut events, shutdown, task) = start(WireCodecKind::JsonLines).await;
        let (framed, _) = subscribe(addr, WireCodecKind::JsonLines).await;

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let Some(ServerEvent::Session {
                subscription_id,
                event,
            }) = events.recv().await
            {
                assert_eq!(subscription_id, "00000001");
                seen.push(event);
            }
        }
        assert_eq!(seen, vec![SessionEvent::Connected, SessionEvent::Subscribed]);

        // Shutdown closes live sessions before run() returns.
        shutdown.cancel();
        task.await.unwrap();
        let (mut rx, _tx) = framed.into_inner().into_split();
        let mut buf = [0u8; 16];
        let n = tokio::io::AsyncReadExt::read(&mut rx, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_length_prefixed_server() {
        let (addr, _events, shutdown, task) = start(WireCodecKind::LengthPrefixed).await;
        let (_framed, extranonce1) = subscribe(addr, WireCodecKind::LengthPrefixed).await;
        assert_eq!(extranonce1, "00000001");

        // A line-oriented miner cannot talk to this server.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(
            &mut stream,
            b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n",
        )
        .await
        .unwrap();
        // Closed, by FIN or reset.
        let mut buf = [0u8; 16];
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
            .await
            .unwrap_or(0);
        assert_eq!(n, 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
