//! Periodic liveness probe for the current connection.
//!
//! The transport does not reliably notice a half-open TCP connection, so the
//! monitor runs a trivial remote command every interval and declares the
//! generation dead on the first failure.

use std::sync::Weak;
use std::time::Duration;

use tracing::{debug, warn};

use crate::teardown::{TeardownCause, TeardownSignal};
use crate::transport::Connection;

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
    command: String,
}

impl HealthMonitor {
    pub fn new(interval: Duration, command: impl Into<String>) -> Self {
        HealthMonitor {
            interval,
            command: command.into(),
        }
    }

    /// Probe until a probe fails or the generation is torn down elsewhere.
    /// Returns `true` if this monitor fired the teardown signal.
    pub async fn watch<C: Connection>(&self, conn: Weak<C>, teardown: TeardownSignal) -> bool {
        loop {
            if teardown.is_fired() {
                return false;
            }
            let Some(live) = conn.upgrade() else {
                return false;
            };

            // A finished probe is reported even if teardown fired meanwhile.
            let result = tokio::select! {
                biased;
                result = live.probe(&self.command) => result,
                _ = teardown.fired() => return false,
            };
            drop(live);

            if let Err(e) = result {
                warn!("Health probe failed: {}", e);
                let declared = teardown.fire(TeardownCause::ProbeFailed);
                if declared {
                    warn!("SSH connection is dead, tearing down generation {}", teardown.generation());
                }
                return declared;
            }
            debug!("probe ok");

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = teardown.fired() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use crate::transport::mock::MockNet;
    use async_trait::async_trait;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    #[tokio::test]
    async fn test_probe_failure_fires_once() {
        let net = MockNet::new();
        let conn = Arc::new(net.connection());
        let teardown = TeardownSignal::new(1);
        let monitor = HealthMonitor::new(Duration::from_millis(10), "echo");

        net.set_probe_fails(true);
        let fired = tokio::time::timeout(
            Duration::from_secs(1),
            monitor.watch(Arc::downgrade(&conn), teardown.clone()),
        )
        .await
        .unwrap();

        assert!(fired);
        assert_eq!(teardown.cause(), Some(TeardownCause::ProbeFailed));
        assert_eq!(net.probes(), 1);
    }

    #[tokio::test]
    async fn test_keeps_probing_while_healthy() {
        let net = MockNet::new();
        let conn = Arc::new(net.connection());
        let teardown = TeardownSignal::new(1);
        let monitor = HealthMonitor::new(Duration::from_millis(10), "echo");

        let task = {
            let teardown = teardown.clone();
            let weak = Arc::downgrade(&conn);
            tokio::spawn(async move { monitor.watch(weak, teardown).await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while net.probes() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!teardown.is_fired());

        teardown.fire(TeardownCause::TransportClosed);
        assert!(!task.await.unwrap());
        assert_eq!(teardown.cause(), Some(TeardownCause::TransportClosed));
    }

    #[tokio::test]
    async fn test_dead_transport_is_declared() {
        let net = MockNet::new();
        let conn = Arc::new(net.connection());
        let teardown = TeardownSignal::new(1);
        let monitor = HealthMonitor::new(Duration::from_millis(10), "echo");

        net.drop_transport();
        assert!(monitor.watch(Arc::downgrade(&conn), teardown.clone()).await);
        assert_eq!(teardown.cause(), Some(TeardownCause::ProbeFailed));
    }

    /// Shared buffer the fmt subscriber writes into.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    /// Transport that closes underneath the probe: teardown is already
    /// fired by the time the failing probe returns.
    struct ClosesDuringProbe {
        teardown: TeardownSignal,
    }

    #[async_trait]
    impl Connection for ClosesDuringProbe {
        type Stream = DuplexStream;

        async fn open_channel(&self, _: &str, _: u16) -> Result<DuplexStream, TunnelError> {
            Err(TunnelError::Disconnected)
        }

        async fn probe(&self, _: &str) -> Result<(), TunnelError> {
            self.teardown.fire(TeardownCause::TransportClosed);
            Err(TunnelError::Probe("channel closed without exit status".into()))
        }

        async fn closed(&self) {}

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_failure_logged_when_transport_close_wins() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let teardown = TeardownSignal::new(3);
        let conn = Arc::new(ClosesDuringProbe {
            teardown: teardown.clone(),
        });
        let monitor = HealthMonitor::new(Duration::from_millis(10), "echo");

        assert!(!monitor.watch(Arc::downgrade(&conn), teardown.clone()).await);
        assert_eq!(teardown.cause(), Some(TeardownCause::TransportClosed));

        let text = logs.text();
        assert!(text.contains("Health probe failed"), "{}", text);
        assert!(text.contains("without exit status"), "{}", text);
        assert!(!text.contains("connection is dead"), "{}", text);
    }

    #[tokio::test]
    async fn test_stops_when_connection_dropped() {
        let net = MockNet::new();
        let conn = Arc::new(net.connection());
        let weak = Arc::downgrade(&conn);
        drop(conn);

        let teardown = TeardownSignal::new(1);
        let monitor = HealthMonitor::new(Duration::from_millis(10), "echo");
        assert!(!monitor.watch(weak, teardown.clone()).await);
        assert!(!teardown.is_fired());
    }
}
