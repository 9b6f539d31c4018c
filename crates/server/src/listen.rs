use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;

pub const DEFAULT_PORT_ATTEMPTS: u16 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ListenError {
    #[error("no free port in {first}..={last}")]
    PortExhausted { first: u16, last: u16 },
    #[error("bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Binds `host:base_port`, moving to the next port while the current one is
/// in use. Gives up after `max_attempts` ports.
pub async fn bind_with_retry(
    host: IpAddr,
    base_port: u16,
    max_attempts: u16,
) -> Result<TcpListener, ListenError> {
    let mut port = base_port;
    let mut last = base_port;
    for attempt in 1..=max_attempts.max(1) {
        let addr = SocketAddr::new(host, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    tracing::info!(%addr, base_port, "bound after skipping busy ports");
                }
                return Ok(listener);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                last = port;
                let Some(next) = port.checked_add(1) else {
                    break;
                };
                tracing::warn!(port, next, "port in use, trying next");
                port = next;
            }
            Err(source) => return Err(ListenError::Io { addr, source }),
        }
    }
    Err(ListenError::PortExhausted {
        first: base_port,
        last,
    })
}
