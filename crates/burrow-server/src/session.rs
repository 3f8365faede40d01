//! Per-tunnel session actor
//!
//! One actor task per [`TunnelIdentity`] owns the transport slot, the pending
//! exchange table and the rotation timer. Everything that touches that state
//! goes through the actor's command channel and is handled one command at a
//! time, so no locks are needed.
//!
//! Callers never block the actor: [`SessionHandle::forward`] waits for
//! transport availability and for its waiter in the caller's own task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use burrow_protocol::FrameCodec;

use crate::auth::Authenticator;
use crate::error::{AttachError, ForwardError};
use crate::identity::TunnelIdentity;
use crate::pending::{Applied, Completion, ExchangeResponse, PendingTable, ProtocolViolation};
use crate::rotation::{self, RotationState, RECONNECT_CLOSE_CODE, RECONNECT_CLOSE_REASON};
use crate::store::StoreProvider;

/// Text sent to a client right after its transport is accepted
pub const WELCOME_MESSAGE: &str = "Connected.";

/// Source of per-attempt forward tickets
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Tunables for every session
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How many times a forward re-checks for a transport before giving up
    pub forward_retries: u32,
    /// Pause between transport checks
    pub retry_interval: Duration,
    /// Capacity of the actor's command channel
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            forward_retries: 10,
            retry_interval: Duration::from_secs(1),
            command_buffer: 256,
        }
    }
}

/// Shared dependencies used to spawn sessions
#[derive(Clone)]
pub struct SessionContext {
    pub auth: Authenticator,
    pub stores: Arc<dyn StoreProvider>,
    pub config: SessionConfig,
}

/// Message from the session to the transport pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded frame
    Frame(Bytes),
    Text(String),
    /// Close the transport with a WebSocket close code
    Close { code: u16, reason: String },
}

/// Transport side of a successful attach
///
/// The holder pumps `outbound` into the socket and reports inbound messages
/// and closure back through [`SessionHandle::deliver`] and
/// [`SessionHandle::transport_closed`] using `id`.
#[derive(Debug)]
pub struct TransportLink {
    pub id: u64,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Absent,
    Active,
    /// Close requested, waiting for the pump to report it gone
    Closing,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub transport: TransportState,
    pub transport_id: Option<u64>,
    pub pending: usize,
    pub streaming: usize,
    pub rotation_armed: bool,
}

enum Command {
    Attach {
        credentials: String,
        reply: oneshot::Sender<Result<TransportLink, AttachError>>,
    },
    Forward {
        req_id: String,
        ticket: u64,
        payload: Bytes,
        reply: Completion,
    },
    Cancel {
        req_id: String,
        ticket: u64,
    },
    Inbound {
        transport_id: u64,
        payload: Bytes,
    },
    TransportClosed {
        transport_id: u64,
        reason: String,
    },
    Rotate,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Cloneable handle to a running session actor
#[derive(Clone)]
pub struct SessionHandle {
    identity: Arc<TunnelIdentity>,
    commands: mpsc::Sender<Command>,
    config: SessionConfig,
    /// Counts live clones of this handle
    holders: Arc<()>,
}

impl SessionHandle {
    /// Spawn the actor for `identity` on the current runtime
    pub fn spawn(identity: TunnelIdentity, ctx: &SessionContext) -> Self {
        let (tx, rx) = mpsc::channel(ctx.config.command_buffer);
        let store = ctx.stores.open(&identity);
        let identity = Arc::new(identity);

        let actor = SessionActor {
            identity: identity.clone(),
            auth: ctx.auth.clone(),
            commands: rx,
            myself: tx.downgrade(),
            transport: TransportSlot::Absent,
            next_transport_id: 1,
            pending: PendingTable::new(),
            rotation: RotationState::new(store),
            codec: FrameCodec::new(),
        };
        tokio::spawn(actor.run());

        tracing::debug!("Session {} started", identity);

        Self {
            identity,
            commands: tx,
            config: ctx.config,
            holders: Arc::new(()),
        }
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    /// True once the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// True while another clone of this handle exists, such as a transport
    /// pump or a forward still in flight
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.holders) > 1
    }

    /// Claim the transport slot
    pub async fn attach_transport(&self, credentials: &str) -> Result<TransportLink, AttachError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Attach {
                credentials: credentials.to_string(),
                reply,
            })
            .await
            .map_err(|_| AttachError::SessionClosed)?;
        outcome.await.map_err(|_| AttachError::SessionClosed)?
    }

    /// Send an encoded request frame and wait for the tunnel client's answer
    ///
    /// Tolerates a transport that is briefly absent (client reconnecting) by
    /// re-checking once per `retry_interval`, then fails with
    /// [`ForwardError::GatewayTimeout`] without having sent anything.
    pub async fn forward(
        &self,
        req_id: String,
        payload: Bytes,
    ) -> Result<ExchangeResponse, ForwardError> {
        let mut retried = 0;
        loop {
            let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
            let (reply, outcome) = oneshot::channel();
            self.commands
                .send(Command::Forward {
                    req_id: req_id.clone(),
                    ticket,
                    payload: payload.clone(),
                    reply,
                })
                .await
                .map_err(|_| ForwardError::SessionClosed)?;

            let mut guard = CancelOnDrop::new(self.commands.clone(), req_id.clone(), ticket);
            let result = outcome.await.map_err(|_| ForwardError::SessionClosed)?;
            guard.disarm();

            match result {
                Err(ForwardError::NoTransport) => {
                    if retried >= self.config.forward_retries {
                        tracing::warn!(
                            "No transport for {} after {} retries, dropping request {}",
                            self.identity,
                            retried,
                            req_id
                        );
                        return Err(ForwardError::GatewayTimeout);
                    }
                    tracing::debug!(
                        "No transport for {}, waiting for client to connect ({})",
                        self.identity,
                        req_id
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                    retried += 1;
                }
                other => return other,
            }
        }
    }

    /// Hand one binary transport message to the session
    pub async fn deliver(&self, transport_id: u64, payload: Bytes) {
        let _ = self
            .commands
            .send(Command::Inbound {
                transport_id,
                payload,
            })
            .await;
    }

    /// Report that a transport is gone
    pub async fn transport_closed(&self, transport_id: u64, reason: impl Into<String>) {
        let _ = self
            .commands
            .send(Command::TransportClosed {
                transport_id,
                reason: reason.into(),
            })
            .await;
    }

    /// Force the daily rotation now
    pub async fn rotate(&self) {
        let _ = self.commands.send(Command::Rotate).await;
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, outcome) = oneshot::channel();
        self.commands.send(Command::Snapshot { reply }).await.ok()?;
        outcome.await.ok()
    }
}

/// Withdraws a waiter if the forwarding caller goes away before it resolves
struct CancelOnDrop {
    commands: mpsc::Sender<Command>,
    req_id: Option<String>,
    ticket: u64,
}

impl CancelOnDrop {
    fn new(commands: mpsc::Sender<Command>, req_id: String, ticket: u64) -> Self {
        Self {
            commands,
            req_id: Some(req_id),
            ticket,
        }
    }

    fn disarm(&mut self) {
        self.req_id = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(req_id) = self.req_id.take() else {
            return;
        };
        let cancel = Command::Cancel {
            req_id,
            ticket: self.ticket,
        };
        match self.commands.try_send(cancel) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let commands = self.commands.clone();
                    runtime.spawn(async move {
                        let _ = commands.send(cmd).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct ActiveTransport {
    id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

enum TransportSlot {
    Absent,
    Active(ActiveTransport),
    Closing(ActiveTransport),
}

impl TransportSlot {
    fn id(&self) -> Option<u64> {
        match self {
            TransportSlot::Absent => None,
            TransportSlot::Active(t) | TransportSlot::Closing(t) => Some(t.id),
        }
    }

    fn state(&self) -> TransportState {
        match self {
            TransportSlot::Absent => TransportState::Absent,
            TransportSlot::Active(_) => TransportState::Active,
            TransportSlot::Closing(_) => TransportState::Closing,
        }
    }
}

struct SessionActor {
    identity: Arc<TunnelIdentity>,
    auth: Authenticator,
    commands: mpsc::Receiver<Command>,
    /// Lets timers post back without keeping the actor alive
    myself: mpsc::WeakSender<Command>,
    transport: TransportSlot,
    next_transport_id: u64,
    pending: PendingTable,
    rotation: RotationState,
    codec: FrameCodec,
}

impl SessionActor {
    async fn run(mut self) {
        self.restore_rotation().await;

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Attach { credentials, reply } => self.on_attach(credentials, reply).await,
                Command::Forward {
                    req_id,
                    ticket,
                    payload,
                    reply,
                } => self.on_forward(req_id, ticket, payload, reply),
                Command::Cancel { req_id, ticket } => {
                    if self.pending.cancel(&req_id, ticket) {
                        tracing::debug!("Caller for {} went away, waiter removed", req_id);
                    }
                }
                Command::Inbound {
                    transport_id,
                    payload,
                } => self.on_message(transport_id, payload),
                Command::TransportClosed {
                    transport_id,
                    reason,
                } => self.on_transport_closed(transport_id, &reason),
                Command::Rotate => self.on_rotate().await,
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }

        if let Some(id) = self.transport.id() {
            self.on_transport_closed(id, "session shut down");
        }
        tracing::debug!("Session {} stopped", self.identity);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            transport: self.transport.state(),
            transport_id: self.transport.id(),
            pending: self.pending.len(),
            streaming: self.pending.streaming_count(),
            rotation_armed: self.rotation.is_armed(),
        }
    }

    /// Re-arm a wake-up that was persisted before a restart
    async fn restore_rotation(&mut self) {
        match self.rotation.store().alarm().await {
            Ok(Some(at)) => {
                tracing::debug!("Session {} restoring rotation wake-up at {}", self.identity, at);
                self.arm_rotation(at);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Session {}: failed to read rotation alarm: {}", self.identity, e),
        }
    }

    fn arm_rotation(&mut self, at: chrono::DateTime<Utc>) {
        let myself = self.myself.clone();
        self.rotation.arm(at, async move {
            if let Some(commands) = myself.upgrade() {
                let _ = commands.send(Command::Rotate).await;
            }
        });
    }

    async fn on_attach(
        &mut self,
        credentials: String,
        reply: oneshot::Sender<Result<TransportLink, AttachError>>,
    ) {
        if !self.auth.verify(&credentials) {
            tracing::info!("Session {}: attach rejected, invalid token", self.identity);
            let _ = reply.send(Err(AttachError::Unauthorized));
            return;
        }

        if let Some(current) = self.transport.id() {
            tracing::info!(
                "Session {}: attach rejected, transport {} already connected",
                self.identity,
                current
            );
            let _ = reply.send(Err(AttachError::AlreadyAttached));
            return;
        }

        let id = self.next_transport_id;
        self.next_transport_id += 1;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let _ = outbound.send(Outbound::Text(WELCOME_MESSAGE.to_string()));

        if reply
            .send(Ok(TransportLink {
                id,
                outbound: outbound_rx,
            }))
            .is_err()
        {
            tracing::debug!("Session {}: attacher went away before transport {}", self.identity, id);
            return;
        }

        self.transport = TransportSlot::Active(ActiveTransport { id, outbound });
        tracing::info!("Session {}: transport {} attached", self.identity, id);

        let today = Utc::now().date_naive();
        match rotation::ensure_scheduled(self.rotation.store(), today).await {
            Ok(Some(at)) => {
                tracing::info!("Session {}: first attach, rotation scheduled for {}", self.identity, at);
                self.arm_rotation(at);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Session {}: failed to persist rotation state: {}", self.identity, e),
        }
    }

    fn on_forward(&mut self, req_id: String, ticket: u64, payload: Bytes, reply: Completion) {
        let (transport_id, sent) = match &self.transport {
            TransportSlot::Active(t) => {
                if let Err(completion) = self.pending.register(req_id.clone(), ticket, reply) {
                    tracing::warn!("Session {}: request id {} already pending", self.identity, req_id);
                    let _ = completion.send(Err(ForwardError::DuplicateRequestId(req_id)));
                    return;
                }
                (t.id, t.outbound.send(Outbound::Frame(payload)).is_ok())
            }
            TransportSlot::Absent | TransportSlot::Closing(_) => {
                let _ = reply.send(Err(ForwardError::NoTransport));
                return;
            }
        };

        if sent {
            tracing::debug!("Session {}: request {} sent, waiting for response", self.identity, req_id);
        } else {
            self.on_transport_closed(transport_id, "transport writer stopped");
        }
    }

    fn on_message(&mut self, transport_id: u64, payload: Bytes) {
        if self.transport.id() != Some(transport_id) {
            tracing::debug!(
                "Session {}: dropping message from stale transport {}",
                self.identity,
                transport_id
            );
            return;
        }

        let frame = match self.codec.decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                let violation = ProtocolViolation::Undecodable(e.to_string());
                tracing::warn!("Session {}: {}", self.identity, violation);
                return;
            }
        };

        let kind = frame.kind();
        match self.pending.apply(frame) {
            Ok(Applied::Stale(req_id)) => {
                tracing::warn!(
                    "Session {}: {} for request {} has no waiting exchange",
                    self.identity,
                    kind,
                    req_id
                );
            }
            Ok(Applied::CallerGone) => {
                tracing::debug!("Session {}: {} arrived after caller went away", self.identity, kind);
            }
            Ok(applied) => {
                tracing::trace!("Session {}: {} -> {:?}", self.identity, kind, applied);
            }
            Err(violation) => {
                tracing::warn!("Session {}: protocol violation: {}", self.identity, violation);
            }
        }
    }

    fn on_transport_closed(&mut self, transport_id: u64, reason: &str) {
        if self.transport.id() != Some(transport_id) {
            tracing::debug!(
                "Session {}: ignoring close of stale transport {}",
                self.identity,
                transport_id
            );
            return;
        }

        self.transport = TransportSlot::Absent;
        let (failed, aborted) = self.pending.fail_all(reason);
        tracing::info!(
            "Session {}: transport {} closed ({}), {} waiters failed, {} streams aborted",
            self.identity,
            transport_id,
            reason,
            failed,
            aborted
        );
    }

    async fn on_rotate(&mut self) {
        if let Err(e) = self.rotation.fired().await {
            tracing::warn!("Session {}: failed to clear rotation alarm: {}", self.identity, e);
        }

        let transport = match std::mem::replace(&mut self.transport, TransportSlot::Absent) {
            TransportSlot::Active(t) => t,
            other => {
                self.transport = other;
                tracing::debug!("Session {}: rotation with no active transport", self.identity);
                return;
            }
        };

        tracing::info!(
            "Session {}: closing transport {} to force a reconnect",
            self.identity,
            transport.id
        );
        let id = transport.id;
        let delivered = transport
            .outbound
            .send(Outbound::Close {
                code: RECONNECT_CLOSE_CODE,
                reason: RECONNECT_CLOSE_REASON.to_string(),
            })
            .is_ok();
        self.transport = TransportSlot::Closing(transport);

        if !delivered {
            self.on_transport_closed(id, "transport writer stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::BodyReceiver;
    use crate::store::{MemoryStoreProvider, StoreProvider};
    use burrow_protocol::{Frame, Headers, PartFrame, PartStartFrame, RequestFrame, ResponseFrame};
    use chrono::NaiveDate;
    use hyper::StatusCode;

    const TOKEN: &str = "session-test-token-0123456789-0123456789-abcdef";

    fn context() -> SessionContext {
        SessionContext {
            auth: Authenticator::new(TOKEN),
            stores: MemoryStoreProvider::new(),
            config: SessionConfig::default(),
        }
    }

    fn spawn() -> SessionHandle {
        let day = NaiveDate::from_ymd_opt(2024, 5, 3).unwrap();
        SessionHandle::spawn(TunnelIdentity::new("myapp", day), &context())
    }

    fn request_payload(req_id: &str) -> Bytes {
        FrameCodec::new()
            .encode(&Frame::Request(RequestFrame {
                req_id: req_id.to_string(),
                url: "https://myapp.tunnel.example.com/".to_string(),
                method: "GET".to_string(),
                integrity: String::new(),
                headers: Headers::new(),
                body: Bytes::new(),
            }))
            .unwrap()
    }

    fn encode(frame: Frame) -> Bytes {
        FrameCodec::new().encode(&frame).unwrap()
    }

    /// Receive the next frame the session pushed to the transport
    async fn next_request(link: &mut TransportLink) -> RequestFrame {
        loop {
            match link.outbound.recv().await.expect("transport closed") {
                Outbound::Frame(raw) => match FrameCodec::new().decode(&raw).unwrap() {
                    Frame::Request(req) => return req,
                    other => panic!("unexpected frame {:?}", other),
                },
                Outbound::Text(_) => continue,
                Outbound::Close { .. } => panic!("unexpected close"),
            }
        }
    }

    async fn drain(mut body: BodyReceiver) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.recv().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_attach_rejects_bad_token() {
        let session = spawn();
        let err = session.attach_transport("wrong").await.unwrap_err();
        assert_eq!(err, AttachError::Unauthorized);
    }

    #[tokio::test]
    async fn test_single_transport_invariant() {
        let session = spawn();
        let mut first = session.attach_transport(TOKEN).await.unwrap();
        assert_eq!(
            first.outbound.recv().await,
            Some(Outbound::Text(WELCOME_MESSAGE.to_string()))
        );

        // Concurrent seconds all fail
        let (a, b) = tokio::join!(session.attach_transport(TOKEN), session.attach_transport(TOKEN));
        assert_eq!(a.unwrap_err(), AttachError::AlreadyAttached);
        assert_eq!(b.unwrap_err(), AttachError::AlreadyAttached);

        // The first transport still serves exchanges
        let forward = tokio::spawn({
            let session = session.clone();
            async move { session.forward("b".to_string(), request_payload("b")).await }
        });
        let req = next_request(&mut first).await;
        assert_eq!(req.req_id, "b");
        session
            .deliver(
                first.id,
                encode(Frame::Response(ResponseFrame {
                    req_id: "b".to_string(),
                    status: 200,
                    headers: Headers::new(),
                    body: Bytes::from_static(b"ok"),
                })),
            )
            .await;

        match forward.await.unwrap().unwrap() {
            ExchangeResponse::Complete { head, body } => {
                assert_eq!(head.status, StatusCode::OK);
                assert_eq!(&body[..], b"ok");
            }
            other => panic!("expected complete response, got {:?}", other),
        }

        // After the first closes, a new attach succeeds with a fresh id
        session.transport_closed(first.id, "client disconnected").await;
        let second = session.attach_transport(TOKEN).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_without_transport_times_out_after_ten_seconds() {
        let session = spawn();
        let started = tokio::time::Instant::now();

        let err = session
            .forward("a".to_string(), request_payload("a"))
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert_eq!(err, ForwardError::GatewayTimeout);
        assert!(elapsed >= Duration::from_secs(10), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(11), "gave up after {:?}", elapsed);
        assert_eq!(session.snapshot().await.unwrap().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_survives_brief_reconnect_gap() {
        let session = spawn();

        let forward = tokio::spawn({
            let session = session.clone();
            async move { session.forward("late".to_string(), request_payload("late")).await }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let mut link = session.attach_transport(TOKEN).await.unwrap();
        let req = next_request(&mut link).await;
        assert_eq!(req.req_id, "late");

        session
            .deliver(
                link.id,
                encode(Frame::Response(ResponseFrame {
                    req_id: "late".to_string(),
                    status: 204,
                    headers: Headers::new(),
                    body: Bytes::new(),
                })),
            )
            .await;

        let response = forward.await.unwrap().unwrap();
        assert_eq!(response.head().status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_streamed_response_in_order() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();

        let forward = tokio::spawn({
            let session = session.clone();
            async move { session.forward("c".to_string(), request_payload("c")).await }
        });
        next_request(&mut link).await;

        session
            .deliver(
                link.id,
                encode(Frame::ResponsePartStart(PartStartFrame {
                    req_id: "c".to_string(),
                    status: 200,
                    headers: Headers::new(),
                    bytes: Bytes::from_static(b"a"),
                })),
            )
            .await;

        // The caller sees the head before the stream finishes
        let response = forward.await.unwrap().unwrap();
        let body = match response {
            ExchangeResponse::Streaming { head, body } => {
                assert_eq!(head.status, StatusCode::OK);
                body
            }
            other => panic!("expected streaming response, got {:?}", other),
        };

        for (frame_end, chunk) in [(false, "b"), (false, "c"), (true, "d")] {
            let part = PartFrame {
                req_id: "c".to_string(),
                bytes: Bytes::from(chunk),
            };
            let frame = if frame_end {
                Frame::ResponsePartEnd(part)
            } else {
                Frame::ResponsePart(part)
            };
            session.deliver(link.id, encode(frame)).await;
        }

        assert_eq!(drain(body).await, b"abcd");
        assert_eq!(session.snapshot().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_stale_and_garbage_frames_are_ignored() {
        let session = spawn();
        let link = session.attach_transport(TOKEN).await.unwrap();

        session
            .deliver(
                link.id,
                encode(Frame::ResponsePart(PartFrame {
                    req_id: "ghost".to_string(),
                    bytes: Bytes::from_static(b"x"),
                })),
            )
            .await;
        session
            .deliver(
                link.id,
                encode(Frame::ResponsePartEnd(PartFrame {
                    req_id: "ghost".to_string(),
                    bytes: Bytes::from_static(b"y"),
                })),
            )
            .await;
        session.deliver(link.id, Bytes::from_static(b"\xc1garbage")).await;
        // From a transport that no longer exists
        session.deliver(link.id + 7, Bytes::from_static(b"\x00")).await;

        let snapshot = session.snapshot().await.expect("session still running");
        assert_eq!(snapshot.transport, TransportState::Active);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn test_transport_loss_fails_waiters_and_aborts_streams() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();

        let waiting = tokio::spawn({
            let session = session.clone();
            async move { session.forward("w".to_string(), request_payload("w")).await }
        });
        next_request(&mut link).await;

        let streaming = tokio::spawn({
            let session = session.clone();
            async move { session.forward("s".to_string(), request_payload("s")).await }
        });
        next_request(&mut link).await;

        session
            .deliver(
                link.id,
                encode(Frame::ResponsePartStart(PartStartFrame {
                    req_id: "s".to_string(),
                    status: 200,
                    headers: Headers::new(),
                    bytes: Bytes::from_static(b"partial"),
                })),
            )
            .await;
        let stream = streaming.await.unwrap().unwrap();

        session.transport_closed(link.id, "client disconnected").await;

        assert_eq!(waiting.await.unwrap().unwrap_err(), ForwardError::TransportLost);
        match stream {
            ExchangeResponse::Streaming { mut body, .. } => {
                assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
                assert!(body.recv().await.unwrap().is_err());
                assert!(body.recv().await.is_none());
            }
            other => panic!("expected streaming response, got {:?}", other),
        }

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.transport, TransportState::Absent);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn test_stale_close_does_not_clear_new_transport() {
        let session = spawn();
        let first = session.attach_transport(TOKEN).await.unwrap();
        session.transport_closed(first.id, "gone").await;
        let second = session.attach_transport(TOKEN).await.unwrap();

        // A late close event for the first transport
        session.transport_closed(first.id, "gone again").await;

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.transport, TransportState::Active);
        assert_eq!(snapshot.transport_id, Some(second.id));
    }

    #[tokio::test]
    async fn test_cancelled_forward_removes_waiter() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();

        let forward = tokio::spawn({
            let session = session.clone();
            async move { session.forward("x".to_string(), request_payload("x")).await }
        });
        next_request(&mut link).await;
        assert_eq!(session.snapshot().await.unwrap().pending, 1);

        forward.abort();
        let _ = forward.await;

        // Cancel is queued ahead of this snapshot
        assert_eq!(session.snapshot().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_rotation_closes_transport_with_reconnect_code() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();
        assert!(session.snapshot().await.unwrap().rotation_armed);

        let waiting = tokio::spawn({
            let session = session.clone();
            async move { session.forward("r".to_string(), request_payload("r")).await }
        });
        next_request(&mut link).await;

        session.rotate().await;
        assert_eq!(
            link.outbound.recv().await,
            Some(Outbound::Close {
                code: RECONNECT_CLOSE_CODE,
                reason: RECONNECT_CLOSE_REASON.to_string(),
            })
        );

        // Still attached while closing: a new attach is refused
        assert_eq!(
            session.attach_transport(TOKEN).await.unwrap_err(),
            AttachError::AlreadyAttached
        );
        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.transport, TransportState::Closing);
        assert_eq!(snapshot.pending, 1);
        assert!(!snapshot.rotation_armed);

        session.transport_closed(link.id, "closed by rotation").await;
        assert_eq!(waiting.await.unwrap().unwrap_err(), ForwardError::TransportLost);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_refused() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.forward("d".to_string(), request_payload("d")).await }
        });
        next_request(&mut link).await;

        let err = session
            .forward("d".to_string(), request_payload("d"))
            .await
            .unwrap_err();
        assert_eq!(err, ForwardError::DuplicateRequestId("d".to_string()));

        // The original exchange is untouched
        session
            .deliver(
                link.id,
                encode(Frame::Response(ResponseFrame {
                    req_id: "d".to_string(),
                    status: 200,
                    headers: Headers::new(),
                    body: Bytes::from_static(b"first"),
                })),
            )
            .await;
        assert_eq!(first.await.unwrap().unwrap().head().status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cancel_from_refused_duplicate_keeps_original() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.forward("o".to_string(), request_payload("o")).await }
        });
        next_request(&mut link).await;

        // Cancel carrying a ticket the waiter was not registered with
        session
            .commands
            .send(Command::Cancel {
                req_id: "o".to_string(),
                ticket: u64::MAX,
            })
            .await
            .unwrap();
        assert_eq!(session.snapshot().await.unwrap().pending, 1);

        session
            .deliver(
                link.id,
                encode(Frame::Response(ResponseFrame {
                    req_id: "o".to_string(),
                    status: 200,
                    headers: Headers::new(),
                    body: Bytes::from_static(b"mine"),
                })),
            )
            .await;
        assert_eq!(first.await.unwrap().unwrap().head().status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_midnight_timer_closes_transport() {
        let session = spawn();
        let mut link = session.attach_transport(TOKEN).await.unwrap();
        assert!(session.snapshot().await.unwrap().rotation_armed);

        tokio::time::advance(Duration::from_secs(24 * 60 * 60 + 1)).await;
        loop {
            match link.outbound.recv().await.expect("transport closed") {
                Outbound::Close { code, .. } => {
                    assert_eq!(code, RECONNECT_CLOSE_CODE);
                    break;
                }
                Outbound::Text(_) => continue,
                Outbound::Frame(_) => panic!("unexpected frame"),
            }
        }

        let snapshot = session.snapshot().await.unwrap();
        assert_eq!(snapshot.transport, TransportState::Closing);
        assert!(!snapshot.rotation_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_wake_up_is_rearmed_on_start() {
        let stores = MemoryStoreProvider::new();
        let ctx = SessionContext {
            auth: Authenticator::new(TOKEN),
            stores: stores.clone(),
            config: SessionConfig::default(),
        };
        let identity = TunnelIdentity::for_today("restored");
        let store = stores.open(&identity);
        store
            .set_alarm(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let session = SessionHandle::spawn(identity, &ctx);
        assert!(session.snapshot().await.unwrap().rotation_armed);

        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!session.snapshot().await.unwrap().rotation_armed);
        assert_eq!(store.alarm().await.unwrap(), None);
    }
}
