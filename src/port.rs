use std::net::TcpListener;
const MAX_PORT: u16 = 65535;

/// Whether a listener could be bound on `host:port` right now.
pub fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

pub fn find_available_port(host: &str, start_port: u16) -> Option<u16> {
    (start_port..MAX_PORT).find(|&port| is_port_available(host, port))
}
