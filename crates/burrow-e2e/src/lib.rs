//! End-to-end test utilities for the Burrow tunnel broker
//!
//! This crate provides a test harness, a mock local service and a minimal
//! tunnel client so the whole request path can be exercised over real sockets.

pub mod harness;
pub mod mock_service;
pub mod test_client;

pub use harness::{TestServer, TEST_TOKEN};
pub use mock_service::MockHttpService;
pub use test_client::{attach_raw, attach_status, RawTransport, ResponseMode, TestClient};
