use std::fmt;

use bytes::Bytes;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered list of HTTP header pairs
///
/// Encoded as a map of name -> value so that JavaScript clients see a plain
/// object. Decoding also accepts a list of `[name, value]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for a header name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(String, String)>> for Headers {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values or a list of [name, value] pairs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Headers, A::Error> {
                let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, String>()? {
                    pairs.push((name, value));
                }
                Ok(Headers(pairs))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Headers, A::Error> {
                let mut pairs = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(pair) = seq.next_element::<(String, String)>()? {
                    pairs.push(pair);
                }
                Ok(Headers(pairs))
            }
        }

        deserializer.deserialize_any(HeadersVisitor)
    }
}

/// A public HTTP request, sent from the broker to the remote client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    pub req_id: String,
    /// Absolute URL as seen by the public endpoint
    pub url: String,
    pub method: String,
    /// Subresource integrity metadata, usually empty
    #[serde(default)]
    pub integrity: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Bytes,
}

/// A complete, buffered response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFrame {
    pub req_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Bytes,
}

/// Head of a streamed response, carrying the first chunk of the body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartStartFrame {
    pub req_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub bytes: Bytes,
}

/// A chunk of a streamed response body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartFrame {
    pub req_id: String,
    #[serde(default)]
    pub bytes: Bytes,
}

/// Frame discriminant, encoded as the `kind` field of the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Request,
    Response,
    ResponsePartStart,
    ResponsePart,
    ResponsePartEnd,
}

impl FrameKind {
    const NAMES: &'static [&'static str] = &[
        "request",
        "response",
        "response_part_start",
        "response_part",
        "response_part_end",
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::ResponsePartStart => "response_part_start",
            FrameKind::ResponsePart => "response_part",
            FrameKind::ResponsePartEnd => "response_part_end",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "request" => Some(FrameKind::Request),
            "response" => Some(FrameKind::Response),
            "response_part_start" => Some(FrameKind::ResponsePartStart),
            "response_part" => Some(FrameKind::ResponsePart),
            "response_part_end" => Some(FrameKind::ResponsePartEnd),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message exchanged over a tunnel transport
///
/// Wire shape is the envelope `{kind, data}`, where `kind` names the variant
/// and `data` holds its payload. Keys may arrive in either order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    ResponsePartStart(PartStartFrame),
    ResponsePart(PartFrame),
    ResponsePartEnd(PartFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request(_) => FrameKind::Request,
            Frame::Response(_) => FrameKind::Response,
            Frame::ResponsePartStart(_) => FrameKind::ResponsePartStart,
            Frame::ResponsePart(_) => FrameKind::ResponsePart,
            Frame::ResponsePartEnd(_) => FrameKind::ResponsePartEnd,
        }
    }

    /// Request id of a frame travelling from the remote client back to the
    /// broker. `None` for frames that do not answer a request.
    pub fn response_req_id(&self) -> Option<&str> {
        match self {
            Frame::Request(_) => None,
            Frame::Response(f) => Some(&f.req_id),
            Frame::ResponsePartStart(f) => Some(&f.req_id),
            Frame::ResponsePart(f) | Frame::ResponsePartEnd(f) => Some(&f.req_id),
        }
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut envelope = serializer.serialize_struct("Frame", 2)?;
        envelope.serialize_field("kind", self.kind().as_str())?;
        match self {
            Frame::Request(data) => envelope.serialize_field("data", data)?,
            Frame::Response(data) => envelope.serialize_field("data", data)?,
            Frame::ResponsePartStart(data) => envelope.serialize_field("data", data)?,
            Frame::ResponsePart(data) | Frame::ResponsePartEnd(data) => {
                envelope.serialize_field("data", data)?
            }
        }
        envelope.end()
    }
}

fn parse_kind<E: de::Error>(name: &str) -> Result<FrameKind, E> {
    FrameKind::from_name(name).ok_or_else(|| de::Error::unknown_variant(name, FrameKind::NAMES))
}

fn next_data<'de, A: MapAccess<'de>>(map: &mut A, kind: FrameKind) -> Result<Frame, A::Error> {
    Ok(match kind {
        FrameKind::Request => Frame::Request(map.next_value()?),
        FrameKind::Response => Frame::Response(map.next_value()?),
        FrameKind::ResponsePartStart => Frame::ResponsePartStart(map.next_value()?),
        FrameKind::ResponsePart => Frame::ResponsePart(map.next_value()?),
        FrameKind::ResponsePartEnd => Frame::ResponsePartEnd(map.next_value()?),
    })
}

fn data_from_value(kind: FrameKind, value: rmpv::Value) -> Result<Frame, rmpv::ext::Error> {
    use rmpv::ext::from_value;

    Ok(match kind {
        FrameKind::Request => Frame::Request(from_value(value)?),
        FrameKind::Response => Frame::Response(from_value(value)?),
        FrameKind::ResponsePartStart => Frame::ResponsePartStart(from_value(value)?),
        FrameKind::ResponsePart => Frame::ResponsePart(from_value(value)?),
        FrameKind::ResponsePartEnd => Frame::ResponsePartEnd(from_value(value)?),
    })
}

fn next_data_element<'de, A: SeqAccess<'de>>(
    seq: &mut A,
    kind: FrameKind,
) -> Result<Option<Frame>, A::Error> {
    Ok(match kind {
        FrameKind::Request => seq.next_element()?.map(Frame::Request),
        FrameKind::Response => seq.next_element()?.map(Frame::Response),
        FrameKind::ResponsePartStart => seq.next_element()?.map(Frame::ResponsePartStart),
        FrameKind::ResponsePart => seq.next_element()?.map(Frame::ResponsePart),
        FrameKind::ResponsePartEnd => seq.next_element()?.map(Frame::ResponsePartEnd),
    })
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameVisitor;

        impl<'de> Visitor<'de> for FrameVisitor {
            type Value = Frame;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a frame envelope {kind, data}")
            }

            // Encoders are free to order map keys; a `data` seen before
            // `kind` is held as a raw value until the variant is known.
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Frame, A::Error> {
                let mut kind = None;
                let mut frame = None;
                let mut early_data: Option<rmpv::Value> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "kind" => {
                            if kind.is_some() {
                                return Err(de::Error::duplicate_field("kind"));
                            }
                            let name: String = map.next_value()?;
                            kind = Some(parse_kind(&name)?);
                        }
                        "data" => {
                            if frame.is_some() || early_data.is_some() {
                                return Err(de::Error::duplicate_field("data"));
                            }
                            match kind {
                                Some(kind) => frame = Some(next_data(&mut map, kind)?),
                                None => early_data = Some(map.next_value()?),
                            }
                        }
                        _ => {
                            map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }
                let kind = kind.ok_or_else(|| de::Error::missing_field("kind"))?;
                match (frame, early_data) {
                    (Some(frame), _) => Ok(frame),
                    (None, Some(value)) => data_from_value(kind, value).map_err(de::Error::custom),
                    (None, None) => Err(de::Error::missing_field("data")),
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Frame, A::Error> {
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let kind = parse_kind(&name)?;
                next_data_element(&mut seq, kind)?.ok_or_else(|| de::Error::invalid_length(1, &self))
            }
        }

        deserializer.deserialize_struct("Frame", &["kind", "data"], FrameVisitor)
    }
}
