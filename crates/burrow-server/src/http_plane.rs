use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;

use burrow_protocol::{CodecError, Frame, FrameCodec, Headers, RequestFrame};

use crate::auth::Authenticator;
use crate::config::Environment;
use crate::endpoint::{self, ProxyBody, FORWARD_PATH_PREFIX};
use crate::error::AttachError;
use crate::identity::TunnelIdentity;
use crate::registry::SessionRegistry;

/// Suffix of the attach host label, `<label>-ws`
const ATTACH_SUFFIX: &str = "-ws";
/// Suffix of the metadata host label, `<label>-api`
const API_SUFFIX: &str = "-api";

/// How often handles from previous days are dropped
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// What a hostname asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRoute {
    /// `<label>.<base>`: tunneled to the client
    Public(String),
    /// `<label>-ws.<base>`: tunnel client attach
    Attach(String),
    /// `<label>-api.<base>`: broker metadata
    Api(String),
}

impl HostRoute {
    pub fn label(&self) -> &str {
        match self {
            HostRoute::Public(l) | HostRoute::Attach(l) | HostRoute::Api(l) => l,
        }
    }
}

/// Public edge: maps hostnames to sessions and dispatches
pub struct HttpPlane {
    registry: Arc<SessionRegistry>,
    auth: Authenticator,
    base_domain: String,
    env: Environment,
}

impl HttpPlane {
    pub fn new(
        registry: Arc<SessionRegistry>,
        auth: Authenticator,
        base_domain: String,
        env: Environment,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            auth,
            base_domain: base_domain.to_ascii_lowercase(),
            env,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start listening for HTTP traffic
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("HTTP plane listening on {}", listener.local_addr()?);

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    tracing::debug!("HTTP connection from {}", peer_addr);
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.serve_connection(stream, peer_addr).await;
                    });
                }
                _ = sweep.tick() => {
                    let removed = self.registry.sweep(Utc::now().date_naive());
                    if removed > 0 {
                        tracing::debug!("Dropped {} stale session handles", removed);
                    }
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let this = self.clone();
            async move { Ok::<_, Infallible>(this.handle(req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    /// Dispatch one request by hostname
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        tracing::debug!(
            "HTTP request: {} {} (Host: {:?})",
            req.method(),
            req.uri(),
            req.headers().get(header::HOST)
        );

        let route = match request_host(&req).and_then(|host| parse_host(&host, &self.base_domain)) {
            Some(route) => route,
            None => {
                tracing::warn!("Request without valid tunnel hostname");
                return endpoint::text_response(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "Hostname must be a single label under {} like 'myapp.{}'",
                        self.base_domain, self.base_domain
                    ),
                );
            }
        };

        match route {
            HostRoute::Public(label) => self.forward_public(label, req).await,
            HostRoute::Attach(label) => self.attach(label, req).await,
            HostRoute::Api(_) => api(&req),
        }
    }

    async fn attach<B>(&self, label: String, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        if !self.auth.verify_uri(req.uri()) {
            tracing::info!("Attach for {} not authorised", label);
            return endpoint::json_response(
                StatusCode::UNAUTHORIZED,
                json!({ "ok": false, "msg": AttachError::Unauthorized.to_string() }),
            );
        }

        if !endpoint::is_websocket_upgrade(&req) {
            return endpoint::text_response(StatusCode::UPGRADE_REQUIRED, "Expected Upgrade: websocket");
        }

        let session = self.registry.get_or_create(&TunnelIdentity::for_today(label));
        endpoint::handle(&session, req).await
    }

    async fn forward_public<B>(&self, label: String, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        if self.env == Environment::Dev && req.uri().path().starts_with("/favicon.ico") {
            let mut response = Response::new(endpoint::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            return response;
        }

        let req_id = uuid::Uuid::new_v4().to_string();
        let url = public_url(&req);
        let method = req.method().to_string();
        let headers: Headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect::<Vec<_>>()
            .into();

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::error!("Failed to read request body: {}", e);
                return endpoint::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to read request body",
                );
            }
        };

        let frame = Frame::Request(RequestFrame {
            req_id: req_id.clone(),
            url,
            method,
            integrity: String::new(),
            headers,
            body,
        });

        let payload = match FrameCodec::new().encode(&frame) {
            Ok(payload) => payload,
            Err(e @ CodecError::FrameTooLarge(_)) => {
                return endpoint::text_response(StatusCode::PAYLOAD_TOO_LARGE, e.to_string());
            }
            Err(e) => {
                tracing::error!("Failed to encode request {}: {}", req_id, e);
                return endpoint::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode request",
                );
            }
        };

        let uri: Uri = match format!("{}{}", FORWARD_PATH_PREFIX, req_id).parse() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!("Invalid forward path for {}: {}", req_id, e);
                return endpoint::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid request id");
            }
        };
        let mut internal = Request::new(Full::new(payload));
        *internal.method_mut() = Method::POST;
        *internal.uri_mut() = uri;

        tracing::debug!("Forwarding {} to tunnel {}", req_id, label);
        let session = self.registry.get_or_create(&TunnelIdentity::for_today(label));
        endpoint::handle(&session, internal).await
    }
}

fn api<B>(req: &Request<B>) -> Response<ProxyBody> {
    if req.method() == Method::GET && req.uri().path() == "/meta" {
        return endpoint::json_response(
            StatusCode::OK,
            json!({ "ok": true, "data": { "version": env!("CARGO_PKG_VERSION") } }),
        );
    }
    endpoint::text_response(StatusCode::NOT_FOUND, "Not found.")
}

/// Hostname without port, from the Host header or an absolute URI
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let host = match req.headers().get(header::HOST) {
        Some(value) => value.to_str().ok()?.to_string(),
        None => req.uri().host()?.to_string(),
    };
    let host = host.split(':').next()?.trim().trim_end_matches('.');
    Some(host.to_ascii_lowercase())
}

/// Absolute URL of a public request as the client should see it
fn public_url<B>(req: &Request<B>) -> String {
    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|v| *v == "http" || *v == "https")
        .unwrap_or("http");
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}

/// Map a hostname to a route; `None` for hosts outside the base domain
pub fn parse_host(host: &str, base_domain: &str) -> Option<HostRoute> {
    let label = host.strip_suffix(base_domain)?.strip_suffix('.')?;

    // Exactly one label under the base domain
    if label.contains('.') {
        return None;
    }

    let route = if let Some(id) = label.strip_suffix(ATTACH_SUFFIX) {
        HostRoute::Attach(id.to_string())
    } else if let Some(id) = label.strip_suffix(API_SUFFIX) {
        HostRoute::Api(id.to_string())
    } else {
        HostRoute::Public(label.to_string())
    };

    is_valid_label(route.label()).then_some(route)
}

/// Validate a tunnel label (DNS label rules)
fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }

    // Must start and end with alphanumeric
    let starts_ok = label.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = label.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());

    starts_ok && ends_ok && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Outbound, SessionConfig, SessionContext};
    use crate::store::MemoryStoreProvider;
    use burrow_protocol::ResponseFrame;

    const BASE: &str = "tunnel.example.com";
    const TOKEN: &str = "plane-test-token-0123456789-0123456789-abcdef";

    fn plane(env: Environment) -> Arc<HttpPlane> {
        let auth = Authenticator::new(TOKEN);
        let registry = SessionRegistry::new(SessionContext {
            auth: auth.clone(),
            stores: MemoryStoreProvider::new(),
            config: SessionConfig::default(),
        });
        HttpPlane::new(registry, auth, BASE.to_string(), env)
    }

    fn request(host: &str, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_parse_host() {
        assert_eq!(
            parse_host("myapp.tunnel.example.com", BASE),
            Some(HostRoute::Public("myapp".to_string()))
        );
        assert_eq!(
            parse_host("myapp-ws.tunnel.example.com", BASE),
            Some(HostRoute::Attach("myapp".to_string()))
        );
        assert_eq!(
            parse_host("my-app-api.tunnel.example.com", BASE),
            Some(HostRoute::Api("my-app".to_string()))
        );
        assert_eq!(parse_host("tunnel.example.com", BASE), None);
        assert_eq!(parse_host("a.b.tunnel.example.com", BASE), None);
        assert_eq!(parse_host("myapp.elsewhere.com", BASE), None);
        assert_eq!(parse_host("mytunnel.example.com", BASE), None);
        assert_eq!(parse_host("-ws.tunnel.example.com", BASE), None);
    }

    #[test]
    fn test_valid_labels() {
        assert!(is_valid_label("myapp"));
        assert!(is_valid_label("my-app"));
        assert!(is_valid_label("app123"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("-myapp"));
        assert!(!is_valid_label("myapp-"));
        assert!(!is_valid_label("my_app"));
        assert!(!is_valid_label(&"a".repeat(64)));
    }

    #[test]
    fn test_request_host_strips_port() {
        let req = request("MyApp.Tunnel.Example.com:8080", "/");
        assert_eq!(request_host(&req).as_deref(), Some("myapp.tunnel.example.com"));
    }

    #[test]
    fn test_public_url() {
        let req = Request::builder()
            .uri("/path?q=1")
            .header(header::HOST, "myapp.tunnel.example.com")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();
        assert_eq!(public_url(&req), "https://myapp.tunnel.example.com/path?q=1");
    }

    #[tokio::test]
    async fn test_unknown_host_is_bad_request() {
        let response = plane(Environment::Prod).handle(request("example.org", "/")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_meta() {
        let plane = plane(Environment::Prod);
        let response = plane.handle(request("myapp-api.tunnel.example.com", "/meta")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));

        let missing = plane.handle(request("myapp-api.tunnel.example.com", "/other")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_attach_checks() {
        let plane = plane(Environment::Prod);

        let unauthorised = plane
            .handle(request("myapp-ws.tunnel.example.com", "/?auth_token=nope"))
            .await;
        assert_eq!(unauthorised.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_str(&body_string(unauthorised).await).unwrap();
        assert_eq!(body["ok"], false);

        let not_upgrade = plane
            .handle(request(
                "myapp-ws.tunnel.example.com",
                &format!("/?auth_token={}", TOKEN),
            ))
            .await;
        assert_eq!(not_upgrade.status(), StatusCode::UPGRADE_REQUIRED);
        assert!(plane.registry().is_empty());
    }

    #[tokio::test]
    async fn test_dev_favicon_short_circuit() {
        let dev = plane(Environment::Dev);
        let response = dev.handle(request("myapp.tunnel.example.com", "/favicon.ico")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(dev.registry().is_empty());
    }

    #[tokio::test]
    async fn test_public_request_is_tunneled() {
        let plane = plane(Environment::Prod);
        let session = plane
            .registry()
            .get_or_create(&TunnelIdentity::for_today("myapp"));
        let mut link = session.attach_transport(TOKEN).await.unwrap();

        let call = tokio::spawn({
            let plane = plane.clone();
            async move {
                let req = Request::builder()
                    .method(Method::PUT)
                    .uri("/items/7?x=y")
                    .header(header::HOST, "myapp.tunnel.example.com")
                    .header("x-custom", "1")
                    .body(Full::new(Bytes::from_static(b"payload")))
                    .unwrap();
                plane.handle(req).await
            }
        });

        let request = loop {
            if let Some(Outbound::Frame(raw)) = link.outbound.recv().await {
                match FrameCodec::new().decode(&raw).unwrap() {
                    Frame::Request(req) => break req,
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        };
        assert_eq!(request.method, "PUT");
        assert_eq!(request.url, "http://myapp.tunnel.example.com/items/7?x=y");
        assert_eq!(request.headers.get("X-Custom"), Some("1"));
        assert_eq!(&request.body[..], b"payload");
        assert!(uuid::Uuid::parse_str(&request.req_id).is_ok());

        session
            .deliver(
                link.id,
                FrameCodec::new()
                    .encode(&Frame::Response(ResponseFrame {
                        req_id: request.req_id.clone(),
                        status: 200,
                        headers: Headers::new(),
                        body: Bytes::from_static(b"done"),
                    }))
                    .unwrap(),
            )
            .await;

        let response = call.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "done");
    }
}
