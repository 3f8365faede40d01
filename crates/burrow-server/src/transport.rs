//! WebSocket pump between an attached tunnel client and its session
//!
//! The pump is the only writer of the socket. Binary messages are handed to
//! the session untouched; decoding happens in the actor.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use burrow_protocol::MAX_FRAME_SIZE;

use crate::session::{Outbound, SessionHandle, TransportLink};

/// WebSocket limits matching the frame codec
pub fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_SIZE);
    config.max_frame_size = Some(MAX_FRAME_SIZE);
    config
}

/// Wrap an already upgraded connection as the server side of a WebSocket
pub async fn accept_upgraded<S>(io: S) -> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    WebSocketStream::from_raw_socket(io, Role::Server, Some(websocket_config())).await
}

/// Pump messages until either side closes, then report the transport gone
pub async fn serve_websocket<S>(ws: WebSocketStream<S>, link: TransportLink, session: SessionHandle)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let TransportLink { id, mut outbound } = link;
    let (mut sink, mut source) = ws.split();
    let identity = session.identity().to_string();

    let writer_identity = identity.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let message = match message {
                Outbound::Frame(payload) => Message::Binary(payload.to_vec()),
                Outbound::Text(text) => Message::Text(text),
                Outbound::Close { code, reason } => {
                    tracing::debug!(
                        "[{}] closing transport {} with code {}",
                        writer_identity,
                        id,
                        code
                    );
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };

            if let Err(e) = sink.send(message).await {
                tracing::debug!("[{}] transport {} send error: {}", writer_identity, id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reason = loop {
        tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Binary(payload))) => {
                    session.deliver(id, Bytes::from(payload)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::info!("[{}] text message from client: {}", identity, text);
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("client closed ({}): {}", frame.code, frame.reason),
                        None => "client closed".to_string(),
                    };
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("websocket error: {}", e),
                None => break "connection dropped".to_string(),
            },
            // The session asked to close, or the socket refused a write
            _ = &mut writer => break "closed by server".to_string(),
        }
    };

    writer.abort();
    tracing::debug!("[{}] transport {} finished: {}", identity, id, reason);
    session.transport_closed(id, reason).await;
}
