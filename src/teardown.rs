//! One-shot teardown broadcast scoped to a single connection generation.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Why a generation was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// The health probe could not run its command.
    ProbeFailed,
    /// The transport reported termination on its own.
    TransportClosed,
    /// A forward could not rebind its local port in this generation.
    BindFailed,
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeardownCause::ProbeFailed => "probe failed",
            TeardownCause::TransportClosed => "transport closed",
            TeardownCause::BindFailed => "local bind failed",
            TeardownCause::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Fires at most once. Every clone observes the same firing.
#[derive(Clone)]
pub struct TeardownSignal {
    generation: u64,
    tx: Arc<watch::Sender<Option<TeardownCause>>>,
}

impl TeardownSignal {
    pub fn new(generation: u64) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            generation,
            tx: Arc::new(tx),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fire the signal. Returns `true` only for the call that performed the
    /// transition; later calls leave the recorded cause untouched.
    pub fn fire(&self, cause: TeardownCause) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(cause);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn cause(&self) -> Option<TeardownCause> {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    pub async fn fired(&self) -> TeardownCause {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or(TeardownCause::Shutdown),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => TeardownCause::Shutdown,
        }
    }
}

impl fmt::Debug for TeardownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownSignal")
            .field("generation", &self.generation)
            .field("cause", &self.cause())
            .finish()
    }
}
