//! TCP accept loop for the broker side of the transport.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Listening socket plus its accept-loop task.
///
/// Accepted streams are handed to the owner over a channel; the owner
/// decides how to wrap each one (the broker spawns a connection handler).
#[derive(Debug)]
pub struct TransportServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl TransportServer {
    /// Bind `addr` and start accepting.
    ///
    /// Binds with `SO_REUSEADDR` so a bounced broker can reclaim its port
    /// while old connections drain.
    ///
    /// # Errors
    ///
    /// Bind failure is fatal and reported to the caller.
    pub async fn bind(addr: &str, conn_tx: UnboundedSender<TcpStream>) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid bind address: {addr}"))?;
        let socket = if addr.is_ipv6() { TcpSocket::new_v6()? } else { TcpSocket::new_v4()? };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket.listen(128)?;
        let local_addr = listener.local_addr()?;

        log::info!("[Transport] listening on {local_addr}");
        let accept_handle = tokio::spawn(Self::accept_loop(listener, conn_tx));

        Ok(Self { local_addr, accept_handle })
    }

    async fn accept_loop(listener: TcpListener, conn_tx: UnboundedSender<TcpStream>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("[Transport] accepted {addr}");
                    if conn_tx.send(stream).is_err() {
                        log::info!("[Transport] owner gone, stopping accept loop");
                        break;
                    }
                }
                Err(e) => {
                    // Per-connection accept errors are transient; keep serving.
                    log::error!("[Transport] accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.accept_handle.abort();
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn accepts_connections_and_hands_off_streams() {
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let server = TransportServer::bind("127.0.0.1:0", conn_tx).await.unwrap();
        let addr = server.local_addr();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), conn_rx.recv())
                .await
                .expect("timed out waiting for accept")
                .expect("channel closed");
        }
    }

    #[tokio::test]
    async fn invalid_bind_address_is_fatal() {
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();
        assert!(TransportServer::bind("not-an-address", conn_tx).await.is_err());
    }

    #[tokio::test]
    async fn rebind_after_shutdown_reclaims_port() {
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let server = TransportServer::bind("127.0.0.1:0", tx1).await.unwrap();
        let addr = server.local_addr();
        drop(server);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let again = TransportServer::bind(&addr.to_string(), tx2).await.unwrap();
        assert_eq!(again.local_addr(), addr);
    }
}
