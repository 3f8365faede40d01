use thiserror::Error;

/// Why a transport attach was refused
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Auth invalid. Pass the configured token as the `auth_token` query parameter.")]
    Unauthorized,

    #[error("Cannot upgrade to a websocket as there is a websocket already connected.")]
    AlreadyAttached,

    #[error("Session is shut down")]
    SessionClosed,
}

/// Why a forwarded exchange did not produce a response
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// No transport at the moment the request reached the session
    #[error("No tunnel connection is attached")]
    NoTransport,

    /// No transport attached within the retry window
    #[error(
        "No websocket connection to forward over. Dropping request. \
         Ensure that your client is running, has an internet connection and the server is on."
    )]
    GatewayTimeout,

    #[error("Tunnel connection lost before the response arrived")]
    TransportLost,

    #[error("Request id {0} is already pending")]
    DuplicateRequestId(String),

    #[error("Tunnel client sent an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session is shut down")]
    SessionClosed,
}
