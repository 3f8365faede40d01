//! Wire protocol for Burrow tunnels
//!
//! Frames are MessagePack envelopes exchanged over a WebSocket between the
//! broker and a remote tunnel client.

mod codec;
mod messages;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use messages::{
    Frame, FrameKind, Headers, PartFrame, PartStartFrame, RequestFrame, ResponseFrame,
};
