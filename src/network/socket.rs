//! Socket construction
//!
//! Sockets are built with `socket2` so the listen backlog and TCP options
//! are explicit, then handed to `mio` in non-blocking mode.

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::NetworkError;

/// Resolve `host:port` to the first usable address
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| NetworkError::Resolve(format!("{}:{}: no addresses", host, port)))
}

/// Bind a non-blocking listener with an explicit accept backlog
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&SockAddr::from(addr)).map_err(bind_err)?;
    socket.listen(backlog.min(i32::MAX as u32) as i32).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Open a fresh connection, waiting at most `timeout`, and switch it to
/// non-blocking mode for the readiness loop
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let connect_err = |e: std::io::Error| NetworkError::ConnectionFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(connect_err)?;
    socket
        .connect_timeout(&SockAddr::from(addr), timeout)
        .map_err(connect_err)?;
    // Voice chunks are small and latency-bound
    socket.set_nodelay(true).map_err(connect_err)?;
    socket.set_nonblocking(true).map_err(connect_err)?;

    Ok(TcpStream::from_std(socket.into()))
}

/// Options applied to every accepted client stream
pub fn prepare_accepted(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 5005).unwrap();
        assert_eq!(addr.port(), 5005);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_connect_refused_is_an_error() {
        // Bind then drop to find a port with nobody listening
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = resolve("127.0.0.1", port).unwrap();

        let result = connect(addr, Duration::from_millis(500));
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
    }

    #[test]
    fn test_listener_accepts() {
        let listener = bind_listener(resolve("127.0.0.1", 0).unwrap(), 4).unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect(addr, Duration::from_secs(1)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }
}
