//! Test server harness for E2E tests
//!
//! Starts a complete broker on an ephemeral port with in-memory session
//! state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use burrow_server::{
    Authenticator, Environment, HttpPlane, MemoryStoreProvider, SessionConfig, SessionContext,
    SessionHandle, SessionRegistry, TunnelIdentity,
};

/// Attach token accepted by every test server
pub const TEST_TOKEN: &str = "e2e-test-token-0123456789-0123456789-0123456789";

/// A running test server instance
pub struct TestServer {
    /// HTTP plane address (public traffic and attaches)
    pub http_addr: SocketAddr,
    /// Base domain for the test server
    pub base_domain: String,
    /// Session tunables the server was started with
    pub session_config: SessionConfig,
    registry: Arc<SessionRegistry>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Start a test server with a short forward retry interval
    pub async fn start() -> Self {
        Self::start_with(SessionConfig {
            retry_interval: Duration::from_millis(50),
            ..SessionConfig::default()
        })
        .await
    }

    pub async fn start_with(session_config: SessionConfig) -> Self {
        let base_domain = "test.example.com".to_string();
        let auth = Authenticator::new(TEST_TOKEN);

        let registry = SessionRegistry::new(SessionContext {
            auth: auth.clone(),
            stores: MemoryStoreProvider::new(),
            config: session_config,
        });

        let http_plane = HttpPlane::new(
            registry.clone(),
            auth,
            base_domain.clone(),
            Environment::Prod,
        );

        // Bind to an ephemeral port
        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP plane");
        let http_addr = http_listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                result = http_plane.run_with_listener(http_listener) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP plane error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("HTTP plane shutting down");
                }
            }
        });

        Self {
            http_addr,
            base_domain,
            session_config,
            registry,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the Host header value for a public label (e.g., "myapp.test.example.com")
    pub fn host_for(&self, label: &str) -> String {
        format!("{}.{}", label, self.base_domain)
    }

    /// Host header value of the attach endpoint for a label
    pub fn attach_host_for(&self, label: &str) -> String {
        format!("{}-ws.{}", label, self.base_domain)
    }

    /// Host header value of the metadata endpoint for a label
    pub fn api_host_for(&self, label: &str) -> String {
        format!("{}-api.{}", label, self.base_domain)
    }

    /// Today's session for a label, if one was created
    pub fn session(&self, label: &str) -> Option<SessionHandle> {
        self.registry.get(&TunnelIdentity::for_today(label))
    }

    /// Shutdown the test server
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
