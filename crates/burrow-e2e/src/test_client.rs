//! Test tunnel client for E2E tests
//!
//! Attaches over WebSocket, performs each tunneled request against a local
//! service and answers with either one buffered frame or a chunked stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use burrow_protocol::{
    Frame, FrameCodec, Headers, PartFrame, PartStartFrame, RequestFrame, ResponseFrame,
};

use crate::harness::TestServer;

/// How the client returns responses to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One `response` frame
    Buffered,
    /// `response_part_start`, `response_part`*, `response_part_end` with
    /// bodies split into chunks of this many bytes
    Streamed(usize),
}

/// A test tunnel client
pub struct TestClient {
    handle: tokio::task::JoinHandle<()>,
    /// Welcome text received after the upgrade
    pub welcome: String,
    closed_with: Arc<RwLock<Option<u16>>>,
}

impl TestClient {
    /// Attach `label` and serve requests against `local_addr`
    pub async fn connect(
        server: &TestServer,
        label: &str,
        local_addr: &str,
        mode: ResponseMode,
    ) -> Result<Self> {
        let request = attach_request(server, label, crate::TEST_TOKEN)?;
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket attach failed")?;
        let (mut sink, mut source) = ws.split();

        let welcome = match source.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => anyhow::bail!("Expected welcome text, got {:?}", other),
        };

        let closed_with = Arc::new(RwLock::new(None));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();

        // Single writer for the socket
        let writer = tokio::spawn(async move {
            while let Some(payload) = out_rx.recv().await {
                if sink.send(Message::Binary(payload.to_vec())).await.is_err() {
                    break;
                }
            }
        });

        let local_addr = local_addr.to_string();
        let closed = closed_with.clone();
        let handle = tokio::spawn(async move {
            let http = reqwest::Client::new();
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(payload)) => {
                        let request = match FrameCodec::new().decode(&payload) {
                            Ok(Frame::Request(request)) => request,
                            Ok(other) => {
                                tracing::warn!("Test client got unexpected {} frame", other.kind());
                                continue;
                            }
                            Err(e) => {
                                tracing::warn!("Test client got undecodable frame: {}", e);
                                continue;
                            }
                        };
                        let http = http.clone();
                        let local_addr = local_addr.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            for frame in serve_request(&http, &local_addr, request, mode).await {
                                if let Ok(payload) = FrameCodec::new().encode(&frame) {
                                    let _ = out_tx.send(payload);
                                }
                            }
                        });
                    }
                    Ok(Message::Close(frame)) => {
                        *closed.write() = Some(frame.map(|f| u16::from(f.code)).unwrap_or(1005));
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            writer.abort();
        });

        Ok(Self {
            handle,
            welcome,
            closed_with,
        })
    }

    /// Wait until the broker closes the transport; returns the close code
    pub async fn wait_for_close(&self, timeout: Duration) -> Option<u16> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(code) = *self.closed_with.read() {
                return Some(code);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Drop the connection without a close handshake
    pub fn disconnect(&self) {
        self.handle.abort();
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Try to attach and return the HTTP status of a rejected upgrade
///
/// `None` means the upgrade succeeded (the connection is dropped again).
pub async fn attach_status(server: &TestServer, label: &str, token: &str) -> Result<Option<StatusCode>> {
    let request = attach_request(server, label, token)?;
    match tokio_tungstenite::connect_async(request).await {
        Ok(_) => Ok(None),
        Err(WsError::Http(response)) => Ok(Some(response.status())),
        Err(e) => Err(e.into()),
    }
}

/// Attached socket without the serving loop, for tests that answer frames by hand
pub type RawTransport =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Attach `label` and return the socket after consuming the welcome text
pub async fn attach_raw(server: &TestServer, label: &str) -> Result<RawTransport> {
    let request = attach_request(server, label, crate::TEST_TOKEN)?;
    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket attach failed")?;
    match ws.next().await {
        Some(Ok(Message::Text(_))) => Ok(ws),
        other => anyhow::bail!("Expected welcome text, got {:?}", other),
    }
}

fn attach_request(
    server: &TestServer,
    label: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = format!("ws://{}/?auth_token={}", server.http_addr, token).into_client_request()?;
    request
        .headers_mut()
        .insert("host", HeaderValue::from_str(&server.attach_host_for(label))?);
    Ok(request)
}

/// Perform the tunneled request locally and build the reply frames
async fn serve_request(
    http: &reqwest::Client,
    local_addr: &str,
    request: RequestFrame,
    mode: ResponseMode,
) -> Vec<Frame> {
    let req_id = request.req_id.clone();
    match call_local(http, local_addr, request).await {
        Ok((status, headers, body)) => reply_frames(req_id, status, headers, body, mode),
        Err(e) => {
            tracing::warn!("Local call failed: {}", e);
            vec![Frame::Response(ResponseFrame {
                req_id,
                status: 502,
                headers: Headers::new(),
                body: Bytes::from(e.to_string()),
            })]
        }
    }
}

async fn call_local(
    http: &reqwest::Client,
    local_addr: &str,
    request: RequestFrame,
) -> Result<(u16, Headers, Bytes)> {
    let path = path_of(&request.url);
    let method = reqwest::Method::from_bytes(request.method.as_bytes())?;

    let mut builder = http.request(method, format!("http://{}{}", local_addr, path));
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.body(request.body).send().await?;
    let status = response.status().as_u16();
    let headers: Headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect::<Vec<_>>()
        .into();
    let body = response.bytes().await?;
    Ok((status, headers, body))
}

/// Path and query of an absolute URL
fn path_of(url: &str) -> &str {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match after_scheme.find('/') {
        Some(i) => &after_scheme[i..],
        None => "/",
    }
}

fn reply_frames(req_id: String, status: u16, headers: Headers, body: Bytes, mode: ResponseMode) -> Vec<Frame> {
    let chunk_size = match mode {
        ResponseMode::Buffered => {
            return vec![Frame::Response(ResponseFrame {
                req_id,
                status,
                headers,
                body,
            })];
        }
        ResponseMode::Streamed(n) => n.max(1),
    };

    let mut chunks: Vec<Bytes> = body.chunks(chunk_size).map(Bytes::copy_from_slice).collect();
    let first = if chunks.is_empty() { Bytes::new() } else { chunks.remove(0) };
    let last = chunks.pop().unwrap_or_default();

    let mut frames = vec![Frame::ResponsePartStart(PartStartFrame {
        req_id: req_id.clone(),
        status,
        headers,
        bytes: first,
    })];
    frames.extend(chunks.into_iter().map(|bytes| {
        Frame::ResponsePart(PartFrame {
            req_id: req_id.clone(),
            bytes,
        })
    }));
    frames.push(Frame::ResponsePartEnd(PartFrame { req_id, bytes: last }));
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_of() {
        assert_eq!(path_of("https://myapp.test.example.com/a/b?c=d"), "/a/b?c=d");
        assert_eq!(path_of("http://myapp.test.example.com"), "/");
    }

    #[test]
    fn test_reply_frames_streamed() {
        let frames = reply_frames(
            "r".to_string(),
            200,
            Headers::new(),
            Bytes::from_static(b"abcd"),
            ResponseMode::Streamed(1),
        );
        let kinds: Vec<_> = frames.iter().map(|f| f.kind().as_str()).collect();
        assert_eq!(
            kinds,
            vec!["response_part_start", "response_part", "response_part", "response_part_end"]
        );
    }

    #[test]
    fn test_reply_frames_single_chunk() {
        let frames = reply_frames(
            "r".to_string(),
            200,
            Headers::new(),
            Bytes::from_static(b"ab"),
            ResponseMode::Streamed(8),
        );
        assert_eq!(frames.len(), 2);
        match &frames[1] {
            Frame::ResponsePartEnd(end) => assert!(end.bytes.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
