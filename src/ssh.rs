use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PublicKey};
use russh::{ChannelMsg, ChannelStream, Disconnect};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ServerEndpoint;
use crate::error::TunnelError;
use crate::transport::{Connection, Connector};

/// Dials the configured server with russh and password authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

/// russh callbacks. Dropped by russh when the session task ends, which is
/// what `SshConnection::closed` waits for.
struct ClientHandler {
    host: String,
    port: u16,
    expected_fingerprint: Option<String>,
    _alive: watch::Sender<bool>,
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.expected_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(
                    "Host key for {}:{} does not match: expected {}, got {}",
                    self.host, self.port, expected, fingerprint
                );
                Err(TunnelError::HostKey(format!(
                    "{}:{} presented {}, expected {}",
                    self.host, self.port, fingerprint, expected
                )))
            }
            Some(_) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                info!(
                    "Accepting host key for {}:{} ({})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
        }
    }
}

pub struct SshConnection {
    handle: Handle<ClientHandler>,
    alive: watch::Receiver<bool>,
    closing: AtomicBool,
}

#[async_trait]
impl Connector for SshConnector {
    type Conn = SshConnection;

    async fn dial(
        &self,
        endpoint: &ServerEndpoint,
        connect_timeout: Duration,
    ) -> Result<SshConnection, TunnelError> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        tokio::time::timeout(connect_timeout, connect(endpoint))
            .await
            .map_err(|_| {
                TunnelError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    addr, connect_timeout
                ))
            })?
    }
}

async fn connect(endpoint: &ServerEndpoint) -> Result<SshConnection, TunnelError> {
    let ssh_config = client::Config {
        // Liveness is proven by the health probe; keepalives only bound a
        // probe that hangs on a half-open socket.
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        nodelay: true,
        ..Default::default()
    };

    let (alive_tx, alive_rx) = watch::channel(true);
    let handler = ClientHandler {
        host: endpoint.host.clone(),
        port: endpoint.port,
        expected_fingerprint: endpoint.host_key_fingerprint.clone(),
        _alive: alive_tx,
    };

    let mut handle = client::connect(
        Arc::new(ssh_config),
        (endpoint.host.as_str(), endpoint.port),
        handler,
    )
    .await?;

    debug!("SSH handshake completed");

    let auth = handle
        .authenticate_password(&endpoint.username, &endpoint.password)
        .await
        .map_err(|e| TunnelError::Auth(e.to_string()))?;

    if !auth.success() {
        return Err(TunnelError::Auth(format!(
            "server rejected password for {}",
            endpoint.username
        )));
    }

    Ok(SshConnection {
        handle,
        alive: alive_rx,
        closing: AtomicBool::new(false),
    })
}

#[async_trait]
impl Connection for SshConnection {
    type Stream = ChannelStream<client::Msg>;

    async fn open_channel(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Self::Stream, TunnelError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                TunnelError::Channel(format!("{}:{}: {}", remote_host, remote_port, e))
            })?;
        Ok(channel.into_stream())
    }

    async fn probe(&self, command: &str) -> Result<(), TunnelError> {
        if self.handle.is_closed() {
            return Err(TunnelError::Disconnected);
        }

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::Probe(format!("open session: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TunnelError::Probe(format!("exec: {}", e)))?;

        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Failure => {
                    return Err(TunnelError::Probe("exec request refused".into()));
                }
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(TunnelError::Probe(format!("exited with status {}", code))),
            None => Err(TunnelError::Probe("channel closed without exit status".into())),
        }
    }

    async fn closed(&self) {
        let mut alive = self.alive.clone();
        // Errors once the handler, and with it the sender, has been dropped.
        let _ = alive.wait_for(|up| !*up).await;
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect on a dead transport: {}", e);
        }
    }
}
