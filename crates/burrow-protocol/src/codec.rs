use bytes::Bytes;
use thiserror::Error;

use crate::messages::Frame;

/// Maximum encoded frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// MessagePack codec for tunnel frames
///
/// Each transport message carries exactly one frame, so no length prefix is
/// needed; the transport preserves message boundaries.
///
/// Wire format:
/// ```text
/// map {
///   "kind": str,   // request | response | response_part_start | ...
///   "data": map    // variant payload, byte fields as `bin`
/// }
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let encoded = rmp_serde::to_vec_named(frame)?;

        if encoded.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(encoded.len()));
        }

        Ok(Bytes::from(encoded))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Frame, CodecError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        Ok(rmp_serde::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Headers, PartStartFrame, RequestFrame, ResponseFrame};
    use serde::Serialize;

    #[test]
    fn test_request_roundtrip() {
        let codec = FrameCodec::new();
        let mut headers = Headers::new();
        headers.push("host", "myapp.tunnel.example.com");
        headers.push("accept", "*/*");

        let frame = Frame::Request(RequestFrame {
            req_id: "5b0c4c1e".to_string(),
            url: "https://myapp.tunnel.example.com/api/test?x=1".to_string(),
            method: "POST".to_string(),
            integrity: String::new(),
            headers,
            body: Bytes::from_static(b"{\"a\":1}"),
        });

        let encoded = codec.encode(&frame).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        #[derive(Serialize)]
        struct Envelope {
            kind: &'static str,
            data: ResponseFrame,
        }

        let raw = rmp_serde::to_vec_named(&Envelope {
            kind: "teleport",
            data: ResponseFrame {
                req_id: "a".to_string(),
                status: 200,
                headers: Headers::new(),
                body: Bytes::new(),
            },
        })
        .unwrap();

        let err = FrameCodec::new().decode(&raw).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_data_before_kind_is_accepted() {
        #[derive(Serialize)]
        struct Envelope {
            data: ResponseFrame,
            kind: &'static str,
        }

        let mut headers = Headers::new();
        headers.push("content-type", "text/plain");
        let data = ResponseFrame {
            req_id: "late-kind".to_string(),
            status: 404,
            headers,
            body: Bytes::from_static(b"missing"),
        };
        let raw = rmp_serde::to_vec_named(&Envelope {
            data: data.clone(),
            kind: "response",
        })
        .unwrap();

        let frame = FrameCodec::new().decode(&raw).unwrap();
        assert_eq!(frame, Frame::Response(data));
    }

    #[test]
    fn test_data_before_unknown_kind_is_rejected() {
        #[derive(Serialize)]
        struct Envelope {
            data: ResponseFrame,
            kind: &'static str,
        }

        let raw = rmp_serde::to_vec_named(&Envelope {
            data: ResponseFrame {
                req_id: "a".to_string(),
                status: 200,
                headers: Headers::new(),
                body: Bytes::new(),
            },
            kind: "teleport",
        })
        .unwrap();

        let err = FrameCodec::new().decode(&raw).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_headers_accept_pair_list() {
        // Some clients send headers as [[name, value], ...]
        #[derive(Serialize)]
        struct StartData {
            req_id: &'static str,
            status: u16,
            headers: Vec<(&'static str, &'static str)>,
            #[serde(with = "bytes_as_bin")]
            bytes: &'static [u8],
        }

        #[derive(Serialize)]
        struct Envelope {
            kind: &'static str,
            data: StartData,
        }

        mod bytes_as_bin {
            pub fn serialize<S: serde::Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
                s.serialize_bytes(v)
            }
        }

        let raw = rmp_serde::to_vec_named(&Envelope {
            kind: "response_part_start",
            data: StartData {
                req_id: "abc",
                status: 206,
                headers: vec![("set-cookie", "a=1"), ("set-cookie", "b=2")],
                bytes: b"first",
            },
        })
        .unwrap();

        let frame = FrameCodec::new().decode(&raw).unwrap();
        match frame {
            Frame::ResponsePartStart(PartStartFrame {
                req_id,
                status,
                headers,
                bytes,
            }) => {
                assert_eq!(req_id, "abc");
                assert_eq!(status, 206);
                assert_eq!(headers.len(), 2);
                assert_eq!(&bytes[..], b"first");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = FrameCodec::new().decode(&[0xc1, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
