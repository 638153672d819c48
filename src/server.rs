//! TCP server coordinating NDTP sessions.
//!
//! An accept task hands every connection to its own session task. A
//! supervisor counts live sessions and collects their results; once a stop is
//! requested it stops accepting and waits for the live count to reach zero.
//! Sessions are never interrupted, their read timeouts bound the wait.

use crate::codec::Codec;
use crate::config::Config;
use crate::session::{Session, SessionConfig, SessionResult};
use crate::stats::StatsSender;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

/// Pending connection queue length.
const LISTEN_BACKLOG: i32 = 1024;

/// Startup failures. Nothing is served after one of these.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address '{addr}': {source}")]
    Address { addr: String, source: io::Error },
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// Cooperative stop signal shared by whoever may end the server.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// What the supervisor hears from the accept task and the sessions.
#[derive(Debug)]
enum Event {
    Spawned(u64),
    Finished(SessionResult),
    /// A session task died without producing a result.
    Lost(u64),
    AcceptStopped,
}

/// Live-session bookkeeping, owned by the supervisor loop.
struct Supervisor {
    live: u64,
    results: Vec<SessionResult>,
    accepting: bool,
    stopping: bool,
    stop_when_idle: bool,
}

impl Supervisor {
    fn handle(&mut self, event: Event) {
        match event {
            Event::Spawned(conn) => {
                self.live += 1;
                debug!(conn, live = self.live, "Session started");
            }
            Event::Finished(result) => {
                self.live -= 1;
                debug!(conn = result.conn_id, live = self.live, "Session finished");
                self.results.push(result);
                self.check_idle();
            }
            Event::Lost(conn) => {
                self.live -= 1;
                debug!(conn, live = self.live, "Session lost");
                self.check_idle();
            }
            Event::AcceptStopped => self.accepting = false,
        }
    }

    /// In quota mode the server is done once nothing is left running.
    fn check_idle(&mut self) {
        if self.stop_when_idle && self.live == 0 && !self.stopping {
            info!("Every session finished its quota");
            self.stopping = true;
        }
    }

    fn done(&self) -> bool {
        self.live == 0 && (self.stopping || !self.accepting)
    }
}

/// A bound server, ready to run.
pub struct Server<C: Codec> {
    listener: TcpListener,
    local_addr: SocketAddr,
    codec: Arc<C>,
    session: SessionConfig,
    stop_when_idle: bool,
    stats: Option<StatsSender>,
}

impl<C: Codec> Server<C> {
    /// Resolve and bind the configured listen address.
    pub async fn bind(config: &Config, codec: C) -> Result<Self, ServerError> {
        let addr = tokio::net::lookup_host(config.listen.as_str())
            .await
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved")
                })
            })
            .map_err(|source| ServerError::Address {
                addr: config.listen.clone(),
                source,
            })?;

        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            address = %local_addr,
            mode = ?config.mode,
            quota = ?config.quota,
            "Server listening"
        );

        Ok(Server {
            listener,
            local_addr,
            codec: Arc::new(codec),
            session: config.session(),
            stop_when_idle: config.quota.is_some(),
            stats: None,
        })
    }

    /// Feed session counters to a stats aggregator.
    pub fn with_stats(mut self, stats: StatsSender) -> Self {
        self.stats = Some(stats);
        self
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until stopped and return every session's result
    /// in completion order.
    ///
    /// Stops when `shutdown` fires, when the accept loop fails, or, with a
    /// packet quota configured, when the last live session finishes. In every
    /// case sessions already running are waited for.
    pub async fn run(self, shutdown: Shutdown) -> Vec<SessionResult> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut acceptor: Option<JoinHandle<()>> = Some(tokio::spawn(accept_loop(
            self.listener,
            self.codec,
            self.session,
            self.stats,
            events_tx,
            shutdown.clone(),
        )));

        let mut supervisor = Supervisor {
            live: 0,
            results: Vec::new(),
            accepting: true,
            stopping: shutdown.is_triggered(),
            stop_when_idle: self.stop_when_idle,
        };

        loop {
            if supervisor.done() {
                // A connection accepted just before the stop may still be
                // queued; only finish once the accept task is gone and the
                // queue is empty.
                shutdown.trigger();
                if let Some(acceptor) = acceptor.take() {
                    if let Err(e) = acceptor.await {
                        error!(error = %e, "Accept task failed");
                    }
                }
                match events.try_recv() {
                    Ok(event) => {
                        supervisor.handle(event);
                        continue;
                    }
                    Err(_) => break,
                }
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => supervisor.handle(event),
                    None => break,
                },
                _ = shutdown.triggered(), if !supervisor.stopping => {
                    info!(live = supervisor.live, "Stop requested, waiting for sessions");
                    supervisor.stopping = true;
                }
            }
        }

        info!(sessions = supervisor.results.len(), "Server has completed work");
        supervisor.results
    }
}

/// Bind, run until stopped, and return the session results.
pub async fn serve<C: Codec>(
    config: &Config,
    codec: C,
    stats: Option<StatsSender>,
    shutdown: Shutdown,
) -> Result<Vec<SessionResult>, ServerError> {
    let mut server = Server::bind(config, codec).await?;
    if let Some(stats) = stats {
        server = server.with_stats(stats);
    }
    Ok(server.run(shutdown).await)
}

async fn accept_loop<C: Codec>(
    listener: TcpListener,
    codec: Arc<C>,
    config: SessionConfig,
    stats: Option<StatsSender>,
    events: mpsc::UnboundedSender<Event>,
    shutdown: Shutdown,
) {
    let mut conn_id: u64 = 1;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!(conn = conn_id, %peer, "Accepted connection");
                // Announce before spawning so the supervisor never sees a
                // result for a session it has not counted.
                let _ = events.send(Event::Spawned(conn_id));

                let session = Session::new(
                    conn_id,
                    stream,
                    Arc::clone(&codec),
                    config.clone(),
                    stats.clone(),
                );
                let span = info_span!("session", conn = conn_id, %peer);
                let events = events.clone();
                let id = conn_id;
                tokio::spawn(async move {
                    let event = match tokio::spawn(session.run().instrument(span)).await {
                        Ok(result) => Event::Finished(result),
                        Err(e) => {
                            error!(conn = id, error = %e, "Session task failed");
                            Event::Lost(id)
                        }
                    };
                    let _ = events.send(event);
                });

                conn_id += 1;
            }
            Err(e) if shutdown.is_triggered() => {
                debug!(error = %e, "Accept interrupted by stop");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection, no longer accepting");
                break;
            }
        }
    }

    let _ = events.send(Event::AcceptStopped);
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
