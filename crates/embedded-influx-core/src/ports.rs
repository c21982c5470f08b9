use std::net::{Ipv4Addr, TcpListener};

/// Ask the OS for a free TCP port on the loopback interface.
///
/// The listener is released before returning, so another process may claim
/// the port before influxd binds it. That window is small and accepted.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Keep `port` unless it is 0, in which case allocate one.
pub fn resolve_port(port: u16) -> std::io::Result<u16> {
    if port == 0 { find_free_port() } else { Ok(port) }
}
