//! Burrow tunnel broker library
//!
//! This library provides the core components for running a burrow broker.
//! It can be used to embed the broker in other applications or for testing.

pub mod auth;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http_plane;
pub mod identity;
pub mod pending;
pub mod registry;
pub mod rotation;
pub mod secret;
pub mod session;
pub mod store;
pub mod transport;

// Re-export public types
pub use auth::Authenticator;
pub use config::{ConfigError, Environment, ResolvedServerConfig, ServerConfig};
pub use error::{AttachError, ForwardError};
pub use http_plane::HttpPlane;
pub use identity::TunnelIdentity;
pub use registry::SessionRegistry;
pub use session::{SessionConfig, SessionContext, SessionHandle, SessionSnapshot};
pub use store::{FileStoreProvider, MemoryStoreProvider, StateStore, StoreProvider};
