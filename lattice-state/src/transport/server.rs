//! WebSocket server for the authoritative side.
//!
//! Each socket is registered with the [`StateManager`] as one connection.
//! A single task per socket both reads frames and drains the connection's
//! outbound queue, so replies and pushed updates go out in queue order.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::error::{ProtocolError, TransportError};
use crate::sync::{ConnectionId, StateManager};

use super::protocol::{decode, encode, Envelope};

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, manager: StateManager) -> Result<(), TransportError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, keys = manager.keys().len(), "sync server listening");
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "accepted tcp connection");
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, manager).await {
                tracing::warn!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

/// Perform the WebSocket handshake and serve the socket.
pub async fn handle_connection(stream: TcpStream, manager: StateManager) -> Result<(), TransportError> {
    let ws = accept_async(stream).await?;
    handle_socket(ws, manager).await
}

/// Removes a connection from the manager when the socket task ends,
/// including when the task is aborted or dropped.
struct Registration {
    manager: StateManager,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.manager.disconnect(self.id);
        tracing::info!(conn = %self.id, "remote disconnected");
    }
}

/// Serve an established WebSocket until either side closes it.
///
/// A protocol violation is answered with an `error` envelope before the
/// socket is closed. The connection is unregistered when the returned future
/// completes or is dropped.
pub async fn handle_socket<S>(ws: WebSocketStream<S>, manager: StateManager) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection = manager.connect();
    let id = connection.id();
    let _registration = Registration {
        manager: manager.clone(),
        id,
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    tracing::info!(conn = %id, "remote connected");

    let result: Result<(), TransportError> = async {
        loop {
            tokio::select! {
                outbound = connection.recv() => match outbound {
                    Some(envelope) => {
                        ws_tx.send(Message::Text(encode(&envelope)?.into())).await?;
                    }
                    None => {
                        tracing::warn!(conn = %id, "connection closed by server");
                        let _ = ws_tx.close().await;
                        return Ok(());
                    }
                },
                inbound = ws_rx.next() => {
                    let violation = match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match decode(&text).and_then(|envelope| manager.dispatch(id, envelope)) {
                                Ok(()) => continue,
                                Err(err) => err,
                            }
                        }
                        Some(Ok(Message::Binary(_))) => ProtocolError::BinaryFrame,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return Err(err.into()),
                    };

                    tracing::error!(conn = %id, error = %violation, "protocol error; dropping connection");
                    let notice = Envelope::Error {
                        message: violation.to_string(),
                    };
                    if let Ok(text) = encode(&notice) {
                        let _ = ws_tx.send(Message::Text(text.into())).await;
                    }
                    let _ = ws_tx.close().await;
                    return Err(violation.into());
                }
            }
        }
    }
    .await;

    result
}
