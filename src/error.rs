use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Host key rejected: {0}")]
    HostKey(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Disconnected")]
    Disconnected,
}

impl TunnelError {
    /// A bind failure caused by a socket that is still held, as opposed to
    /// a permission or address problem the operator has to fix.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, TunnelError::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse)
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Connect(err.to_string())
    }
}
