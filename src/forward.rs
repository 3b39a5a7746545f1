//! Local listener for one configured forward.
//!
//! Every accepted socket gets its own task that opens a channel on the
//! generation's connection and relays bytes through [`pipe::run`]. The
//! accept loop stops when the generation's teardown signal fires.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, debug, info, warn};

use crate::config::ForwardSpec;
use crate::error::TunnelError;
use crate::pipe::{self, Traffic};
use crate::teardown::TeardownSignal;
use crate::transport::Connection;

/// Pause after an accept error that is not a shutdown, so that a
/// persistent condition such as fd exhaustion cannot spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counters for one forward, kept across generations.
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub accepted: AtomicU64,
    pub active: AtomicU64,
    pub open_failures: AtomicU64,
    pub traffic: Traffic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub open_failures: u64,
    pub sent: u64,
    pub received: u64,
}

impl ForwardStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            sent: self.traffic.sent.load(Ordering::Relaxed),
            received: self.traffic.received.load(Ordering::Relaxed),
        }
    }
}

/// Where a listener takes its inbound sockets from.
#[async_trait]
pub trait Incoming: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Incoming for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

enum AcceptError {
    /// The generation was torn down; the listener is finished.
    Closed,
    Io(io::Error),
}

pub struct ForwardListener<I = TcpListener> {
    spec: Arc<ForwardSpec>,
    incoming: I,
    local_addr: SocketAddr,
    teardown: TeardownSignal,
    stats: Arc<ForwardStats>,
}

impl ForwardListener {
    pub async fn bind(
        spec: Arc<ForwardSpec>,
        teardown: TeardownSignal,
        stats: Arc<ForwardStats>,
    ) -> Result<Self, TunnelError> {
        let port = spec.local_port;
        let listener = TcpListener::bind(spec.bind_addr())
            .await
            .map_err(|source| TunnelError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { port, source })?;

        Ok(ForwardListener::from_parts(spec, listener, local_addr, teardown, stats))
    }
}

impl<I: Incoming> ForwardListener<I> {
    fn from_parts(
        spec: Arc<ForwardSpec>,
        incoming: I,
        local_addr: SocketAddr,
        teardown: TeardownSignal,
        stats: Arc<ForwardStats>,
    ) -> Self {
        ForwardListener {
            spec,
            incoming,
            local_addr,
            teardown,
            stats,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        if self.teardown.is_fired() {
            return Err(AcceptError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.teardown.fired() => Err(AcceptError::Closed),
            accepted = self.incoming.accept() => accepted.map_err(AcceptError::Io),
        }
    }

    /// Accept until the teardown signal fires, then release the socket.
    pub async fn serve<C: Connection>(self, conn: Weak<C>) {
        let spec = &self.spec;
        info!(
            "{} listening on {} -> {}:{}",
            spec.name,
            self.local_addr(),
            spec.remote_host,
            spec.remote_port
        );

        loop {
            match self.accept().await {
                Ok((stream, peer)) => {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("{}: failed to set TCP_NODELAY: {}", spec.name, e);
                    }
                    tokio::spawn(
                        relay(conn.clone(), spec.clone(), stream, peer, self.stats.clone())
                            .in_current_span(),
                    );
                }
                Err(AcceptError::Closed) => break,
                Err(AcceptError::Io(e)) => {
                    warn!("{}: accept failed: {}", spec.name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        _ = self.teardown.fired() => break,
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            "{} stopped listening on {} (accepted {}, active {}, failed opens {}, sent {}B, received {}B)",
            spec.name,
            self.local_addr,
            stats.accepted,
            stats.active,
            stats.open_failures,
            stats.sent,
            stats.received
        );
    }
}

async fn relay<C: Connection>(
    conn: Weak<C>,
    spec: Arc<ForwardSpec>,
    local: TcpStream,
    peer: SocketAddr,
    stats: Arc<ForwardStats>,
) {
    let Some(conn) = conn.upgrade() else {
        debug!("{}: connection gone, dropping {}", spec.name, peer);
        return;
    };
    let remote = match conn.open_channel(&spec.remote_host, spec.remote_port).await {
        Ok(remote) => remote,
        Err(e) => {
            stats.open_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: cannot open channel to {}:{} for {}: {}",
                spec.name, spec.remote_host, spec.remote_port, peer, e
            );
            return;
        }
    };
    // The session must not keep the connection alive past its generation.
    drop(conn);

    stats.active.fetch_add(1, Ordering::Relaxed);
    info!("{}: stream opened for {}", spec.name, peer);

    let summary = pipe::run(local, remote, &stats.traffic).await;

    stats.active.fetch_sub(1, Ordering::Relaxed);
    match summary.error {
        Some(e) => debug!("{}: stream for {} ended with error: {}", spec.name, peer, e),
        None => debug!("{}: {} reached EOF", spec.name, summary.finished),
    }
    info!(
        "{}: stream closed for {} (sent {}B, received {}B)",
        spec.name, peer, summary.sent, summary.received
    );
}
