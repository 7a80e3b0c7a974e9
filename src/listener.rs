//! Listening socket bootstrap over a fixed list of candidate ports.

use log::{debug, info};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("No candidate ports configured")]
    NoCandidates,
    #[error("No available port, tried {tried:?}")]
    NoAvailablePort { tried: Vec<u16> },
}

/// Try `bind` on each port in order and return the first success.
///
/// Every port is attempted at most once and nothing is attempted after the
/// first success.
pub async fn bind_first<L, F, Fut>(candidates: &[u16], mut bind: F) -> Result<L, ListenerError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = io::Result<L>>,
{
    if candidates.is_empty() {
        return Err(ListenerError::NoCandidates);
    }
    for &port in candidates {
        match bind(port).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }
    Err(ListenerError::NoAvailablePort {
        tried: candidates.to_vec(),
    })
}

/// Bind a TCP listener on `address` at the first free candidate port.
pub async fn bind_first_available(
    address: IpAddr,
    candidates: &[u16],
) -> Result<TcpListener, ListenerError> {
    let listener = bind_first(candidates, |port| {
        TcpListener::bind(SocketAddr::new(address, port))
    })
    .await?;
    if let Ok(local) = listener.local_addr() {
        info!("Listening on {}", local);
    }
    Ok(listener)
}
