//! Bidirectional byte relay between a local socket and a remote channel.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => f.write_str("local->remote"),
            Direction::RemoteToLocal => f.write_str("remote->local"),
        }
    }
}

/// Byte counters shared by every session of one forward.
#[derive(Debug, Default)]
pub struct Traffic {
    pub sent: AtomicU64,
    pub received: AtomicU64,
}

#[derive(Debug)]
pub struct PipeSummary {
    /// The direction whose end concluded the session.
    pub finished: Direction,
    /// Bytes relayed local -> remote in this session.
    pub sent: u64,
    /// Bytes relayed remote -> local in this session.
    pub received: u64,
    /// Set when the finishing direction ended in an I/O error rather than EOF.
    pub error: Option<io::Error>,
}

/// Relay bytes between `local` and `remote` until either direction reaches
/// EOF or fails. The other direction is abandoned; both ends are dropped,
/// and with that closed, when this returns.
pub async fn run<L, R>(local: L, remote: R, traffic: &Traffic) -> PipeSummary
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let (finished, result) = tokio::select! {
        r = copy_counted(&mut local_read, &mut remote_write, &sent, &traffic.sent) => {
            (Direction::LocalToRemote, r)
        }
        r = copy_counted(&mut remote_read, &mut local_write, &received, &traffic.received) => {
            (Direction::RemoteToLocal, r)
        }
    };

    // Pass the EOF on to the peer of the side that finished.
    let _ = match finished {
        Direction::LocalToRemote => remote_write.shutdown().await,
        Direction::RemoteToLocal => local_write.shutdown().await,
    };

    PipeSummary {
        finished,
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
        error: result.err(),
    }
}

async fn copy_counted<Rd, Wr>(
    reader: &mut Rd,
    writer: &mut Wr,
    session: &AtomicU64,
    total: &AtomicU64,
) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        session.fetch_add(n as u64, Ordering::Relaxed);
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
}
