use tracing_subscriber::EnvFilter;

/// Filter directives for a `-v` count
fn directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "sshf=info",
        1 => "sshf=debug",
        // -vv: russh handshake and channel traffic
        2 => "sshf=debug,russh=debug",
        _ => "sshf=trace,russh=trace",
    }
}

/// Create an environment filter based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directives(verbosity))
    }
}

/// Initialize console logging. The forwarder runs unattended, so every
/// line carries its target and the generation span it belongs to.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
