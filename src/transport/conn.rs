//! Per-connection transport state.
//!
//! Each TCP connection gets a [`Connection`] that owns a read task and a
//! write task bridging between the socket and the owner's event channel.
//! The owner consumes one ordered stream of [`ConnEvent`]s, which serializes
//! all observable state transitions for that connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::framing::{encode_message, MessageDecoder};

/// Transport-level event delivered to the connection owner.
#[derive(Debug)]
pub enum ConnEvent {
    /// One complete message arrived.
    Message(Vec<u8>),
    /// The peer closed the connection or an I/O error ended it.
    Disconnected,
}

/// One live transport connection.
///
/// Owns read/write tasks; dropping the connection aborts both and closes
/// the socket.
#[derive(Debug)]
pub struct Connection {
    /// Peer label for log lines.
    peer: String,
    /// Sender for outgoing message payloads.
    out_tx: UnboundedSender<Vec<u8>>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl Connection {
    /// Take ownership of an established stream and start its tasks.
    ///
    /// Decoded messages and the disconnect edge are delivered on `event_tx`.
    pub fn spawn(stream: TcpStream, event_tx: UnboundedSender<ConnEvent>) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let read_peer = peer.clone();
        let read_handle = tokio::spawn(Self::read_loop(read_peer, read_half, event_tx));

        let write_peer = peer.clone();
        let write_handle = tokio::spawn(Self::write_loop(write_peer, write_half, out_rx));

        Self { peer, out_tx, read_handle, write_handle }
    }

    /// Queue one message for transmission. Non-blocking.
    ///
    /// Returns `false` if the connection is already down.
    pub fn put(&self, payload: Vec<u8>) -> bool {
        self.out_tx.send(payload).is_ok()
    }

    /// Clone of the outgoing queue sender, for components that emit
    /// messages on their own (e.g. the structured log client).
    pub fn sender(&self) -> UnboundedSender<Vec<u8>> {
        self.out_tx.clone()
    }

    /// True once the write side has shut down.
    pub fn is_closed(&self) -> bool {
        self.out_tx.is_closed()
    }

    /// Peer address label.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn read_loop(
        peer: String,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        event_tx: UnboundedSender<ConnEvent>,
    ) {
        let mut decoder = MessageDecoder::new();
        let mut buf = [0u8; 64 * 1024];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    log::debug!("[Transport] peer closed: {peer}");
                    let _ = event_tx.send(ConnEvent::Disconnected);
                    break;
                }
                Ok(n) => match decoder.feed(&buf[..n]) {
                    Ok(messages) => {
                        for message in messages {
                            if event_tx.send(ConnEvent::Message(message)).is_err() {
                                return; // owner gone
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("[Transport] frame decode error from {peer}: {e}");
                        let _ = event_tx.send(ConnEvent::Disconnected);
                        break;
                    }
                },
                Err(e) => {
                    log::debug!("[Transport] read error from {peer}: {e}");
                    let _ = event_tx.send(ConnEvent::Disconnected);
                    break;
                }
            }
        }
    }

    async fn write_loop(
        peer: String,
        mut writer: tokio::net::tcp::OwnedWriteHalf,
        mut out_rx: UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(payload) = out_rx.recv().await {
            if let Err(e) = writer.write_all(&encode_message(&payload)).await {
                log::debug!("[Transport] write error to {peer}: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ConnEvent>) -> ConnEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn messages_cross_in_both_directions() {
        let (a, b) = pair().await;
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let conn_a = Connection::spawn(a, a_tx);
        let conn_b = Connection::spawn(b, b_tx);

        assert!(conn_a.put(b"ping".to_vec()));
        match recv(&mut b_rx).await {
            ConnEvent::Message(m) => assert_eq!(m, b"ping"),
            other => panic!("expected message, got {other:?}"),
        }

        assert!(conn_b.put(b"pong".to_vec()));
        match recv(&mut a_rx).await {
            ConnEvent::Message(m) => assert_eq!(m, b"pong"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_length_put_pops_as_empty_get() {
        let (a, b) = pair().await;
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let conn_a = Connection::spawn(a, a_tx);
        let _conn_b = Connection::spawn(b, b_tx);

        conn_a.put(Vec::new());
        match recv(&mut b_rx).await {
            ConnEvent::Message(m) => assert!(m.is_empty()),
            other => panic!("expected empty message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn drop_surfaces_disconnect_on_peer() {
        let (a, b) = pair().await;
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let conn_a = Connection::spawn(a, a_tx);
        let _conn_b = Connection::spawn(b, b_tx);

        drop(conn_a);
        match recv(&mut b_rx).await {
            ConnEvent::Disconnected => {}
            other => panic!("expected disconnect, got {other:?}"),
        }
    }
}
