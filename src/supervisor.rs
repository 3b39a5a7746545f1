//! Reconnect loop owning the SSH connection.
//!
//! One generation runs from a successful dial to the teardown of that
//! connection: a health monitor and one listener per forward are spawned,
//! the supervisor waits for the transport to close or the teardown signal
//! to fire, closes the connection, waits for the listeners to release their
//! sockets and starts over after a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{ForwardSpec, Options, ServerEndpoint};
use crate::error::TunnelError;
use crate::forward::{ForwardListener, ForwardStats, StatsSnapshot};
use crate::health::HealthMonitor;
use crate::teardown::{TeardownCause, TeardownSignal};
use crate::transport::{Connection, Connector};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub probe_interval: Duration,
    pub probe_command: String,
}

impl From<&Options> for SupervisorOptions {
    fn from(options: &Options) -> Self {
        SupervisorOptions {
            connect_timeout: options.connect_timeout(),
            reconnect_delay: options.reconnect_delay(),
            probe_interval: options.probe_interval(),
            probe_command: options.probe_command.clone(),
        }
    }
}

pub struct Supervisor<D: Connector> {
    connector: D,
    endpoint: ServerEndpoint,
    forwards: Vec<(Arc<ForwardSpec>, Arc<ForwardStats>)>,
    options: SupervisorOptions,
    shutdown: TeardownSignal,
}

impl<D: Connector> Supervisor<D> {
    pub fn new(
        connector: D,
        endpoint: ServerEndpoint,
        forwards: Vec<ForwardSpec>,
        options: SupervisorOptions,
    ) -> Self {
        let forwards = forwards
            .into_iter()
            .map(|spec| (Arc::new(spec), Arc::new(ForwardStats::default())))
            .collect();
        Supervisor {
            connector,
            endpoint,
            forwards,
            options,
            shutdown: TeardownSignal::new(0),
        }
    }

    /// Firing the returned signal ends `run` with `Ok(())`.
    pub fn shutdown_signal(&self) -> TeardownSignal {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Vec<(&ForwardSpec, StatsSnapshot)> {
        self.forwards
            .iter()
            .map(|(spec, stats)| (spec.as_ref(), stats.snapshot()))
            .collect()
    }

    /// Keep the forwards up until shutdown. Only a local bind failure that
    /// retrying cannot fix ends this with an error.
    pub async fn run(&self) -> Result<(), TunnelError> {
        let mut generation = 0u64;
        loop {
            info!(
                "Connecting to SSH server {}:{} as {}",
                self.endpoint.host, self.endpoint.port, self.endpoint.username
            );
            let dialed = tokio::select! {
                dialed = self.connector.dial(&self.endpoint, self.options.connect_timeout) => dialed,
                _ = self.shutdown.fired() => return Ok(()),
            };

            match dialed {
                Ok(conn) => {
                    generation += 1;
                    let span = info_span!("generation", generation);
                    let cause = self
                        .run_generation(generation, Arc::new(conn))
                        .instrument(span)
                        .await?;
                    if cause == TeardownCause::Shutdown {
                        return Ok(());
                    }
                }
                Err(e) => warn!("SSH connection failed: {}", e),
            }

            info!("Reconnecting in {:?}", self.options.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = self.shutdown.fired() => return Ok(()),
            }
        }
    }

    async fn run_generation(
        &self,
        generation: u64,
        conn: Arc<D::Conn>,
    ) -> Result<TeardownCause, TunnelError> {
        info!("SSH connection established");
        let teardown = TeardownSignal::new(generation);
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(self.forwards.len() + 1);

        let monitor = HealthMonitor::new(
            self.options.probe_interval,
            self.options.probe_command.clone(),
        );
        let weak = Arc::downgrade(&conn);
        let signal = teardown.clone();
        tasks.push(tokio::spawn(
            async move {
                monitor.watch(weak, signal).await;
            }
            .in_current_span(),
        ));

        let mut listeners = Vec::with_capacity(self.forwards.len());
        for (spec, stats) in &self.forwards {
            match ForwardListener::bind(spec.clone(), teardown.clone(), stats.clone()).await {
                Ok(listener) => listeners.push(listener),
                Err(e) if generation > 1 && e.is_addr_in_use() => {
                    warn!("{}: {}; retrying next cycle", spec.name, e);
                    teardown.fire(TeardownCause::BindFailed);
                    break;
                }
                Err(e) => {
                    error!("{}: {}", spec.name, e);
                    teardown.fire(TeardownCause::BindFailed);
                    drop(listeners);
                    self.finish(&conn, &teardown, tasks).await;
                    return Err(e);
                }
            }
        }

        if teardown.is_fired() {
            drop(listeners);
        } else {
            for listener in listeners {
                let weak = Arc::downgrade(&conn);
                tasks.push(tokio::spawn(listener.serve(weak).in_current_span()));
            }
        }

        let cause = tokio::select! {
            _ = conn.closed() => TeardownCause::TransportClosed,
            cause = teardown.fired() => cause,
            _ = self.shutdown.fired() => TeardownCause::Shutdown,
        };
        teardown.fire(cause);

        Ok(self.finish(&conn, &teardown, tasks).await)
    }

    /// Close the connection once and wait for the generation's tasks to let
    /// go of their sockets.
    async fn finish(
        &self,
        conn: &D::Conn,
        teardown: &TeardownSignal,
        tasks: Vec<JoinHandle<()>>,
    ) -> TeardownCause {
        let cause = teardown.cause().unwrap_or(TeardownCause::TransportClosed);
        info!("Tearing down generation {}: {}", teardown.generation(), cause);
        conn.close().await;
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Generation task ended abnormally: {}", e);
            }
        }
        cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockNet;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint {
            host: "bastion".into(),
            port: 22,
            username: "ops".into(),
            password: "secret".into(),
            host_key_fingerprint: None,
        }
    }

    fn forward(name: &str, port: u16) -> ForwardSpec {
        let mut spec = ForwardSpec::new(name, "10.0.0.5", 80, port);
        spec.bind_address = Some("127.0.0.1".into());
        spec
    }

    fn fast_options() -> SupervisorOptions {
        SupervisorOptions {
            connect_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(50),
            probe_interval: Duration::from_millis(20),
            probe_command: "echo".into(),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Connect and exchange PING/PONG, retrying until the listener is up.
    async fn ping_until_ok(port: u16) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(mut stream) = TcpStream::connect(addr(port)).await {
                    let mut reply = [0u8; 4];
                    if stream.write_all(b"PING").await.is_ok()
                        && stream.read_exact(&mut reply).await.is_ok()
                        && &reply == b"PONG"
                    {
                        return stream;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("forward never became usable")
    }

    fn spawn(supervisor: Supervisor<MockNet>) -> (Arc<Supervisor<MockNet>>, JoinHandle<Result<(), TunnelError>>) {
        let supervisor = Arc::new(supervisor);
        let runner = supervisor.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        (supervisor, handle)
    }

    #[tokio::test]
    async fn test_forwards_come_up_after_dial() {
        let net = MockNet::new();
        let (web, api) = (free_port(), free_port());
        let (supervisor, handle) = spawn(Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", web), forward("api", api)],
            fast_options(),
        ));

        drop(ping_until_ok(web).await);
        drop(ping_until_ok(api).await);
        assert_eq!(net.connections(), 1);

        supervisor.shutdown_signal().fire(TeardownCause::Shutdown);
        handle.await.unwrap().unwrap();
        assert_eq!(net.close_calls(0), 1);
    }

    #[tokio::test]
    async fn test_dial_failures_are_retried() {
        let net = MockNet::new();
        net.fail_next_dials(3);
        let port = free_port();
        let (supervisor, handle) = spawn(Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", port)],
            fast_options(),
        ));

        drop(ping_until_ok(port).await);
        assert_eq!(net.dials(), 4);

        supervisor.shutdown_signal().fire(TeardownCause::Shutdown);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_drop() {
        let net = MockNet::new();
        let port = free_port();
        let (supervisor, handle) = spawn(Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", port)],
            fast_options(),
        ));

        let mut in_flight = ping_until_ok(port).await;
        net.drop_transport();
        net.wait_for_connections(2).await;

        // A fresh stream works on the new generation.
        drop(ping_until_ok(port).await);
        // The stream from the old generation was left running.
        in_flight.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        in_flight.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");

        assert_eq!(net.close_calls(0), 1);

        supervisor.shutdown_signal().fire(TeardownCause::Shutdown);
        handle.await.unwrap().unwrap();
        assert_eq!(net.close_calls(1), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_triggers_reconnect() {
        let net = MockNet::new();
        let port = free_port();
        let (supervisor, handle) = spawn(Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", port)],
            fast_options(),
        ));

        drop(ping_until_ok(port).await);
        net.set_probe_fails(true);
        net.wait_for_connections(2).await;
        net.set_probe_fails(false);

        drop(ping_until_ok(port).await);
        // Probe death and transport close raced; the first connection was
        // still closed exactly once.
        assert_eq!(net.close_calls(0), 1);

        supervisor.shutdown_signal().fire(TeardownCause::Shutdown);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_port_released_between_generations() {
        let net = MockNet::new();
        let port = free_port();
        let mut options = fast_options();
        options.reconnect_delay = Duration::from_secs(30);
        let (supervisor, handle) = spawn(Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", port)],
            options,
        ));

        drop(ping_until_ok(port).await);
        net.drop_transport();

        let rebound = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(listener) = std::net::TcpListener::bind(addr(port)) {
                    return listener;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("port was never released");
        drop(rebound);

        supervisor.shutdown_signal().fire(TeardownCause::Shutdown);
        handle.await.unwrap().unwrap();
        assert_eq!(net.connections(), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_on_first_generation_is_fatal() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let net = MockNet::new();
        let supervisor = Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", port)],
            fast_options(),
        );

        let err = tokio::time::timeout(Duration::from_secs(2), supervisor.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TunnelError::Bind { port: p, .. } if p == port));
        assert_eq!(net.close_calls(0), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_on_later_generation_is_retried() {
        let net = MockNet::new();
        let port = free_port();
        let mut options = fast_options();
        options.reconnect_delay = Duration::from_millis(100);
        let (supervisor, handle) = spawn(Supervisor::new(
            net.clone(),
            endpoint(),
            vec![forward("web", port)],
            options,
        ));

        drop(ping_until_ok(port).await);
        net.drop_transport();

        // Grab the port while the supervisor is backing off.
        let squatter = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(listener) = std::net::TcpListener::bind(addr(port)) {
                    return listener;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        net.wait_for_connections(3).await;
        assert!(!handle.is_finished());
        drop(squatter);

        drop(ping_until_ok(port).await);
        supervisor.shutdown_signal().fire(TeardownCause::Shutdown);
        handle.await.unwrap().unwrap();
    }
}
