//! Async TCP socket helpers.

use ecnode_proto::{EcError, EcResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// Connect to a remote node by `host:port` address.
pub async fn connect_to(addr: &str) -> EcResult<TcpStream> {
    debug!("connecting to {}", addr);

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|_| EcError::NetworkError)?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Create a TCP listener on the given `host:port` address.
pub async fn create_listen_socket(addr: &str) -> EcResult<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("failed to bind to {}: {}", addr, e);
        EcError::Io
    })?;

    debug!("listening on {}", addr);
    Ok(listener)
}
