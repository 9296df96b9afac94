//! TCP transport for both channels.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address, giving up after `timeout`
pub async fn connect_tcp<A: ToSocketAddrs>(
    addr: A,
    timeout: Duration,
) -> tokio::io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeout),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
