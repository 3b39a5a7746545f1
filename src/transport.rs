//! The capability set the forwarder needs from an SSH client library.
//!
//! The supervisor, forward listeners and the health monitor are written
//! against these traits only. `ssh.rs` provides the russh implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ServerEndpoint;
use crate::error::TunnelError;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Establish and authenticate a connection, giving up after `connect_timeout`.
    async fn dial(
        &self,
        endpoint: &ServerEndpoint,
        connect_timeout: Duration,
    ) -> Result<Self::Conn, TunnelError>;
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a forwarding channel to `remote_host:remote_port` on the server side.
    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self::Stream, TunnelError>;

    /// Open a session, run `command` and succeed only on exit status 0.
    async fn probe(&self, command: &str) -> Result<(), TunnelError>;

    /// Resolves when the transport has terminated.
    async fn closed(&self);

    /// Disconnect. Calling it on a closed connection does nothing.
    async fn close(&self);
}
