//! Mock local HTTP service for E2E tests
//!
//! Plays the developer's local server behind the tunnel client: records what
//! it receives and answers with a configurable canned response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A request as seen by the local service
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Path and query
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct MockState {
    requests: Vec<RecordedRequest>,
    status: StatusCode,
    body: Bytes,
    headers: Vec<(String, String)>,
}

/// A mock HTTP service listening on an ephemeral local port
pub struct MockHttpService {
    addr: SocketAddr,
    state: Arc<RwLock<MockState>>,
}

impl MockHttpService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(RwLock::new(MockState {
            requests: Vec::new(),
            status: StatusCode::OK,
            body: Bytes::from_static(b"ok"),
            headers: Vec::new(),
        }));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(respond(&state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.state.read().requests.clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.read().requests.last().cloned()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.state.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Bytes>) {
        self.state.write().body = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.write().headers.push((name.into(), value.into()));
    }
}

async fn respond(state: &RwLock<MockState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let uri = req
        .uri()
        .path_and_query()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    let mut state = state.write();
    state.requests.push(RecordedRequest {
        method,
        uri,
        headers,
        body,
    });

    let mut response = Response::new(Full::new(state.body.clone()));
    *response.status_mut() = state.status;
    for (name, value) in &state.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_service_records_and_answers() {
        let service = MockHttpService::start().await;
        service.set_response_status(StatusCode::CREATED);
        service.set_response_body("created");
        service.add_response_header("x-mock", "1");

        let resp = reqwest::Client::new()
            .post(format!("http://{}/users?page=2", service.addr()))
            .body("name=test")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 201);
        assert_eq!(resp.headers().get("x-mock").unwrap(), "1");
        assert_eq!(resp.text().await.unwrap(), "created");

        let request = service.last_request().unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/users?page=2");
        assert_eq!(request.body, b"name=test");
    }
}
