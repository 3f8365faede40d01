//! Per-session HTTP surface
//!
//! Two routes: a WebSocket upgrade that attaches the tunnel client, and
//! `POST /fwd/{req_id}` carrying an encoded request frame to forward.

use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame as BodyFrame};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use burrow_protocol::{Frame, FrameCodec, Headers};

use crate::auth::token_from_uri;
use crate::error::{AttachError, ForwardError};
use crate::pending::{BodyReceiver, ExchangeResponse, ResponseHead, StreamAborted};
use crate::session::SessionHandle;
use crate::transport;

/// Path prefix of the forward route
pub const FORWARD_PATH_PREFIX: &str = "/fwd/";

/// Body of every response the broker produces
pub type ProxyBody = UnsyncBoxBody<Bytes, StreamAborted>;

/// Headers the HTTP layer manages itself
///
/// `content-length` is always recomputed by hyper from the relayed body.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    full(Bytes::new())
}

fn streaming(body: BodyReceiver) -> ProxyBody {
    let chunks = stream::unfold(body, |mut body| async move {
        let chunk = body.recv().await?;
        Some((chunk.map(BodyFrame::data), body))
    });
    StreamBody::new(chunks).boxed_unsync()
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// JSON response with the given status
pub fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ProxyBody> {
    let mut response = Response::new(full(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// True for a request asking to switch to the WebSocket protocol
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Route a request addressed to one session
pub async fn handle<B>(session: &SessionHandle, req: Request<B>) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    if is_websocket_upgrade(&req) {
        return attach(session, req).await;
    }

    if req.method() == Method::POST {
        if let Some(req_id) = req.uri().path().strip_prefix(FORWARD_PATH_PREFIX) {
            let req_id = req_id.to_string();
            return forward(session, &req_id, req).await;
        }
    }

    text_response(StatusCode::NOT_FOUND, "Not found")
}

async fn attach<B>(session: &SessionHandle, mut req: Request<B>) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
{
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key header");
    };
    let accept = derive_accept_key(key.as_bytes());

    let credentials = token_from_uri(req.uri()).unwrap_or_default();
    let link = match session.attach_transport(&credentials).await {
        Ok(link) => link,
        Err(AttachError::Unauthorized) => {
            return json_response(
                StatusCode::UNAUTHORIZED,
                json!({ "ok": false, "msg": AttachError::Unauthorized.to_string() }),
            );
        }
        Err(e @ AttachError::AlreadyAttached) => {
            return text_response(StatusCode::BAD_REQUEST, e.to_string());
        }
        Err(e @ AttachError::SessionClosed) => {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let session = session.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = transport::accept_upgraded(TokioIo::new(upgraded)).await;
                transport::serve_websocket(ws, link, session).await;
            }
            Err(e) => {
                tracing::warn!("[{}] websocket upgrade failed: {}", session.identity(), e);
                session.transport_closed(link.id, "upgrade failed").await;
            }
        }
    });

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&accept) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    response
}

async fn forward<B>(session: &SessionHandle, req_id: &str, req: Request<B>) -> Response<ProxyBody>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let payload = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!("Failed to read forward body for {}: {}", req_id, e);
            return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    match FrameCodec::new().decode(&payload) {
        Ok(Frame::Request(frame)) if frame.req_id == req_id => {}
        Ok(other) => {
            tracing::warn!("Forward {} carried a mismatched {} frame", req_id, other.kind());
            return text_response(StatusCode::BAD_REQUEST, "Expected a request frame for this id");
        }
        Err(e) => {
            tracing::warn!("Forward {} carried an undecodable frame: {}", req_id, e);
            return text_response(StatusCode::BAD_REQUEST, "Undecodable request frame");
        }
    }

    match session.forward(req_id.to_string(), payload).await {
        Ok(response) => into_http(response),
        Err(e @ ForwardError::DuplicateRequestId(_)) => {
            text_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            tracing::warn!("[{}] request {} failed: {}", session.identity(), req_id, e);
            text_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

fn into_http(response: ExchangeResponse) -> Response<ProxyBody> {
    let (head, body) = match response {
        ExchangeResponse::Complete { head, body } => (head, full(body)),
        ExchangeResponse::Streaming { head, body } => (head, streaming(body)),
    };
    let ResponseHead { status, headers } = head;

    let mut response = Response::new(body);
    *response.status_mut() = status;
    copy_headers(&headers, response.headers_mut());
    response
}

/// Copy tunneled headers, skipping hop-by-hop and malformed ones
fn copy_headers(from: &Headers, to: &mut hyper::HeaderMap) {
    for (name, value) in from.iter() {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                to.append(name, value);
            }
            _ => tracing::debug!("Dropping invalid tunneled header {:?}", name),
        }
    }
}
