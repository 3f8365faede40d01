//! Pending exchange table and the per-request response state machine
//!
//! ```text
//! Sent --response--------------------------------------> Completed
//! Sent --response_part_start--> Streaming --part*--end--> Completed
//! ```
//!
//! Every terminal transition removes the entry, so nothing outlives its
//! exchange.

use std::collections::HashMap;

use bytes::Bytes;
use hyper::StatusCode;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use burrow_protocol::{Frame, FrameKind, Headers, PartFrame, PartStartFrame, ResponseFrame};

use crate::error::ForwardError;

/// A streamed body ended abnormally
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Tunnel stream aborted: {0}")]
pub struct StreamAborted(pub String);

/// One chunk of a streamed body as seen by the caller
pub type BodyChunk = Result<Bytes, StreamAborted>;

/// Receiving half of a streamed body
pub type BodyReceiver = mpsc::UnboundedReceiver<BodyChunk>;

/// Status line and headers of a tunneled response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Headers,
}

/// What a forwarded exchange resolves to
#[derive(Debug)]
pub enum ExchangeResponse {
    /// The whole body arrived in one frame
    Complete { head: ResponseHead, body: Bytes },
    /// Headers are known; the body keeps arriving on `body`
    Streaming { head: ResponseHead, body: BodyReceiver },
}

impl ExchangeResponse {
    pub fn head(&self) -> &ResponseHead {
        match self {
            ExchangeResponse::Complete { head, .. } => head,
            ExchangeResponse::Streaming { head, .. } => head,
        }
    }
}

/// One-shot completion handle of a waiter
pub type Completion = oneshot::Sender<Result<ExchangeResponse, ForwardError>>;

/// The caller stopped reading the streamed body
#[derive(Debug, Error)]
#[error("Stream receiver dropped")]
pub struct SinkClosed;

/// Ordered, append-only destination for a streamed response body
#[derive(Debug)]
pub struct StreamSink {
    tx: mpsc::UnboundedSender<BodyChunk>,
}

impl StreamSink {
    pub fn open() -> (Self, BodyReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn append(&self, chunk: Bytes) -> Result<(), SinkClosed> {
        if chunk.is_empty() {
            return if self.tx.is_closed() {
                Err(SinkClosed)
            } else {
                Ok(())
            };
        }
        self.tx.send(Ok(chunk)).map_err(|_| SinkClosed)
    }

    /// Finish the body normally; the caller sees end of stream once the
    /// sender is gone
    pub fn close(self) {
        drop(self.tx);
    }

    /// Finish the body with an error so the caller sees a truncated response
    pub fn abort(self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(StreamAborted(reason.into())));
    }
}

/// Frames that break the state machine; logged by the session and discarded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unexpected {0} frame from tunnel client")]
    UnexpectedKind(FrameKind),

    #[error("{kind} for request {req_id} before response_part_start")]
    NotStreaming { req_id: String, kind: FrameKind },

    #[error("{kind} for request {req_id} which is already streaming")]
    AlreadyStreaming { req_id: String, kind: FrameKind },

    #[error("invalid status {status} for request {req_id}")]
    InvalidStatus { req_id: String, status: u16 },

    #[error("undecodable frame: {0}")]
    Undecodable(String),
}

/// What applying a frame did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Buffered response delivered, entry erased
    Resolved,
    /// Streaming response handed to the caller
    StreamOpened,
    Appended,
    /// Final chunk written and body closed, entry erased
    StreamClosed,
    /// The caller is gone; entry erased
    CallerGone,
    /// No entry for this request id (completed, cancelled or from an
    /// earlier transport)
    Stale(String),
}

enum WaiterState {
    /// Request sent; `ticket` identifies the caller that registered it
    Sent { ticket: u64, completion: Completion },
    Streaming(StreamSink),
}

/// Outstanding exchanges keyed by request id
#[derive(Default)]
pub struct PendingTable {
    waiters: HashMap<String, WaiterState>,
}

fn parse_status(req_id: &str, status: u16) -> Result<StatusCode, ProtocolViolation> {
    StatusCode::from_u16(status).map_err(|_| ProtocolViolation::InvalidStatus {
        req_id: req_id.to_string(),
        status,
    })
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn contains(&self, req_id: &str) -> bool {
        self.waiters.contains_key(req_id)
    }

    pub fn streaming_count(&self) -> usize {
        self.waiters
            .values()
            .filter(|w| matches!(w, WaiterState::Streaming(_)))
            .count()
    }

    /// Register a waiter; hands the completion back if the id is taken
    pub fn register(
        &mut self,
        req_id: String,
        ticket: u64,
        completion: Completion,
    ) -> Result<(), Completion> {
        if self.waiters.contains_key(&req_id) {
            return Err(completion);
        }
        self.waiters
            .insert(req_id, WaiterState::Sent { ticket, completion });
        Ok(())
    }

    /// Drop a waiter whose caller went away
    ///
    /// Only the registration holding `ticket` is removed, so a refused
    /// duplicate cannot withdraw the exchange that owns the id.
    pub fn cancel(&mut self, req_id: &str, ticket: u64) -> bool {
        let owned = matches!(
            self.waiters.get(req_id),
            Some(WaiterState::Sent { ticket: owner, .. }) if *owner == ticket
        );
        if owned {
            self.waiters.remove(req_id);
        }
        owned
    }

    /// Fail every outstanding exchange after the transport went away
    ///
    /// Returns how many waiters were failed and how many streams aborted.
    pub fn fail_all(&mut self, reason: &str) -> (usize, usize) {
        let mut failed = 0;
        let mut aborted = 0;
        for (_, waiter) in self.waiters.drain() {
            match waiter {
                WaiterState::Sent { completion, .. } => {
                    let _ = completion.send(Err(ForwardError::TransportLost));
                    failed += 1;
                }
                WaiterState::Streaming(sink) => {
                    sink.abort(reason);
                    aborted += 1;
                }
            }
        }
        (failed, aborted)
    }

    /// Route one frame from the tunnel client to its waiter
    pub fn apply(&mut self, frame: Frame) -> Result<Applied, ProtocolViolation> {
        match frame {
            Frame::Request(_) => Err(ProtocolViolation::UnexpectedKind(FrameKind::Request)),
            Frame::Response(f) => self.on_response(f),
            Frame::ResponsePartStart(f) => self.on_part_start(f),
            Frame::ResponsePart(f) => self.on_part(f),
            Frame::ResponsePartEnd(f) => self.on_part_end(f),
        }
    }

    fn on_response(&mut self, frame: ResponseFrame) -> Result<Applied, ProtocolViolation> {
        let ResponseFrame {
            req_id,
            status,
            headers,
            body,
        } = frame;

        let completion = match self.waiters.remove(&req_id) {
            None => return Ok(Applied::Stale(req_id)),
            Some(WaiterState::Sent { completion, .. }) => completion,
            Some(streaming) => {
                self.waiters.insert(req_id.clone(), streaming);
                return Err(ProtocolViolation::AlreadyStreaming {
                    req_id,
                    kind: FrameKind::Response,
                });
            }
        };

        let status = match parse_status(&req_id, status) {
            Ok(status) => status,
            Err(violation) => {
                let _ = completion.send(Err(ForwardError::InvalidResponse(violation.to_string())));
                return Err(violation);
            }
        };

        let response = ExchangeResponse::Complete {
            head: ResponseHead { status, headers },
            body,
        };
        match completion.send(Ok(response)) {
            Ok(()) => Ok(Applied::Resolved),
            Err(_) => Ok(Applied::CallerGone),
        }
    }

    fn on_part_start(&mut self, frame: PartStartFrame) -> Result<Applied, ProtocolViolation> {
        let PartStartFrame {
            req_id,
            status,
            headers,
            bytes,
        } = frame;

        let completion = match self.waiters.remove(&req_id) {
            None => return Ok(Applied::Stale(req_id)),
            Some(WaiterState::Sent { completion, .. }) => completion,
            Some(streaming) => {
                self.waiters.insert(req_id.clone(), streaming);
                return Err(ProtocolViolation::AlreadyStreaming {
                    req_id,
                    kind: FrameKind::ResponsePartStart,
                });
            }
        };

        let status = match parse_status(&req_id, status) {
            Ok(status) => status,
            Err(violation) => {
                let _ = completion.send(Err(ForwardError::InvalidResponse(violation.to_string())));
                return Err(violation);
            }
        };

        let (sink, body) = StreamSink::open();
        let response = ExchangeResponse::Streaming {
            head: ResponseHead { status, headers },
            body,
        };
        if completion.send(Ok(response)).is_err() {
            return Ok(Applied::CallerGone);
        }
        if sink.append(bytes).is_err() {
            return Ok(Applied::CallerGone);
        }

        self.waiters.insert(req_id, WaiterState::Streaming(sink));
        Ok(Applied::StreamOpened)
    }

    fn on_part(&mut self, frame: PartFrame) -> Result<Applied, ProtocolViolation> {
        let PartFrame { req_id, bytes } = frame;

        let sink = match self.waiters.get(&req_id) {
            None => return Ok(Applied::Stale(req_id)),
            Some(WaiterState::Sent { .. }) => {
                return Err(ProtocolViolation::NotStreaming {
                    req_id,
                    kind: FrameKind::ResponsePart,
                })
            }
            Some(WaiterState::Streaming(sink)) => sink,
        };

        if sink.append(bytes).is_err() {
            self.waiters.remove(&req_id);
            return Ok(Applied::CallerGone);
        }
        Ok(Applied::Appended)
    }

    fn on_part_end(&mut self, frame: PartFrame) -> Result<Applied, ProtocolViolation> {
        let PartFrame { req_id, bytes } = frame;

        let sink = match self.waiters.remove(&req_id) {
            None => return Ok(Applied::Stale(req_id)),
            Some(WaiterState::Streaming(sink)) => sink,
            Some(sent) => {
                self.waiters.insert(req_id.clone(), sent);
                return Err(ProtocolViolation::NotStreaming {
                    req_id,
                    kind: FrameKind::ResponsePartEnd,
                });
            }
        };

        if sink.append(bytes).is_err() {
            return Ok(Applied::CallerGone);
        }
        sink.close();
        Ok(Applied::StreamClosed)
    }
}
