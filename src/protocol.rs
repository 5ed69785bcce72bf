use crate::err::{RemoteError, RpcError, RpcResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// A dynamically typed argument or result value.
pub type Value = serde_json::Value;

/// Keyword arguments of a call.
pub type Kwargs = serde_json::Map<String, Value>;

/// The keyword argument through which a caller's deadline (in seconds) reaches the handler.
pub const TIMEOUT_KWARG: &str = "timeout";

pub const CORRELATION_ID_LEN: usize = 20;

/// Links a `REQUEST` frame to its eventual `RESPONSE` (or `CANCEL`) frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; CORRELATION_ID_LEN]);

impl CorrelationId {
    /// A fresh random id. Uniqueness is probabilistic.
    pub fn random() -> Self {
        CorrelationId(rand::random())
    }

    pub fn from_bytes(bytes: [u8; CORRELATION_ID_LEN]) -> Self {
        CorrelationId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CorrelationId({})", self)
    }
}

/// The first byte of every frame.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tag {
    Request = 0x01,
    Response = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Cancel = 0x05,
    Shutdown = 0x06,
}

impl TryFrom<u8> for Tag {
    type Error = RpcError;

    fn try_from(byte: u8) -> RpcResult<Tag> {
        match byte {
            0x01 => Ok(Tag::Request),
            0x02 => Ok(Tag::Response),
            0x03 => Ok(Tag::Ping),
            0x04 => Ok(Tag::Pong),
            0x05 => Ok(Tag::Cancel),
            0x06 => Ok(Tag::Shutdown),
            other => Err(RpcError::UnknownTag(other)),
        }
    }
}

/// One datagram exchanged between endpoints.
///
/// ```text
/// byte 0       : tag
/// bytes 1..21  : correlation id   (REQUEST, RESPONSE, CANCEL)
/// bytes 21..   : codec-encoded payload (REQUEST, RESPONSE)
/// ```
///
/// `SHUTDOWN` carries an optional admin token directly after the tag. Trailing bytes after a
/// `PING`, `PONG` or `CANCEL` are ignored.
#[derive(Clone, PartialEq, Debug)]
pub enum Frame {
    Request { id: CorrelationId, payload: Bytes },
    Response { id: CorrelationId, payload: Bytes },
    Ping,
    Pong,
    Cancel { id: CorrelationId },
    Shutdown { token: Bytes },
}

impl Frame {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Request { .. } => Tag::Request,
            Frame::Response { .. } => Tag::Response,
            Frame::Ping => Tag::Ping,
            Frame::Pong => Tag::Pong,
            Frame::Cancel { .. } => Tag::Cancel,
            Frame::Shutdown { .. } => Tag::Shutdown,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(1 + CORRELATION_ID_LEN + self.body_len());
        dst.put_u8(self.tag() as u8);
        match self {
            Frame::Request { id, payload } | Frame::Response { id, payload } => {
                dst.put_slice(id.as_bytes());
                dst.put_slice(payload);
            }
            Frame::Cancel { id } => dst.put_slice(id.as_bytes()),
            Frame::Shutdown { token } => dst.put_slice(token),
            Frame::Ping | Frame::Pong => {}
        }
        dst.freeze()
    }

    /// Parse a datagram. Fails with `RpcError::UnknownTag` for a tag this version does not know
    /// and with `RpcError::MalformedFrame` for an empty frame or a truncated correlation id.
    pub fn decode(mut src: Bytes) -> RpcResult<Frame> {
        if !src.has_remaining() {
            return Err(RpcError::MalformedFrame("empty frame".into()));
        }

        let tag = Tag::try_from(src.get_u8())?;

        let frame = match tag {
            Tag::Request => Frame::Request {
                id: take_correlation_id(&mut src)?,
                payload: src,
            },
            Tag::Response => Frame::Response {
                id: take_correlation_id(&mut src)?,
                payload: src,
            },
            Tag::Ping => Frame::Ping,
            Tag::Pong => Frame::Pong,
            Tag::Cancel => Frame::Cancel {
                id: take_correlation_id(&mut src)?,
            },
            Tag::Shutdown => Frame::Shutdown { token: src },
        };

        Ok(frame)
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Request { payload, .. } | Frame::Response { payload, .. } => payload.len(),
            Frame::Shutdown { token } => token.len(),
            _ => 0,
        }
    }
}

fn take_correlation_id(src: &mut Bytes) -> RpcResult<CorrelationId> {
    if src.remaining() < CORRELATION_ID_LEN {
        return Err(RpcError::MalformedFrame(format!(
            "truncated correlation id: {} of {} bytes",
            src.remaining(),
            CORRELATION_ID_LEN
        )));
    }
    let mut id = [0u8; CORRELATION_ID_LEN];
    src.copy_to_slice(&mut id);
    Ok(CorrelationId(id))
}

type RequestTuple = (String, Vec<Value>, Kwargs);

/// The body of a `REQUEST` frame. Encoded as the 3-tuple `(method, args, kwargs)`.
#[derive(Clone, Deserialize, Serialize, PartialEq, Debug)]
#[serde(from = "RequestTuple", into = "RequestTuple")]
pub struct RequestPayload {
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl From<RequestTuple> for RequestPayload {
    fn from((method, args, kwargs): RequestTuple) -> Self {
        RequestPayload { method, args, kwargs }
    }
}

impl From<RequestPayload> for RequestTuple {
    fn from(payload: RequestPayload) -> Self {
        (payload.method, payload.args, payload.kwargs)
    }
}

/// The body of a `RESPONSE` frame.
pub type ResponsePayload = Result<Value, RemoteError>;

#[test]
fn test_request_frame_layout() {
    let id = CorrelationId::from_bytes([7u8; CORRELATION_ID_LEN]);
    let frame = Frame::Request {
        id,
        payload: Bytes::from_static(b"abc"),
    };
    let bytes = frame.encode();

    assert_eq!(1 + CORRELATION_ID_LEN + 3, bytes.len());
    assert_eq!(Tag::Request as u8, bytes[0]);
    assert_eq!(&[7u8; CORRELATION_ID_LEN][..], &bytes[1..21]);
    assert_eq!(b"abc", &bytes[21..]);

    assert_eq!(frame, Frame::decode(bytes).unwrap());
}

#[test]
fn test_cancel_frame_carries_only_the_id() {
    let id = CorrelationId::random();
    let bytes = Frame::Cancel { id }.encode();
    assert_eq!(1 + CORRELATION_ID_LEN, bytes.len());
    assert_eq!(Frame::Cancel { id }, Frame::decode(bytes).unwrap());
}

#[test]
fn test_ping_and_pong_are_one_byte() {
    assert_eq!(&[0x03][..], &Frame::Ping.encode()[..]);
    assert_eq!(&[0x04][..], &Frame::Pong.encode()[..]);
    assert_eq!(
        Frame::Ping,
        Frame::decode(Bytes::from_static(&[0x03, 0xff, 0xff])).unwrap()
    );
}

#[test]
fn test_shutdown_token() {
    let frame = Frame::Shutdown {
        token: Bytes::from_static(b"secret"),
    };
    assert_eq!(frame, Frame::decode(frame.encode()).unwrap());
    assert_eq!(
        Frame::Shutdown { token: Bytes::new() },
        Frame::decode(Bytes::from_static(&[0x06])).unwrap()
    );
}

#[test]
fn test_decode_rejects_unknown_tag() {
    assert_eq!(
        Err(RpcError::UnknownTag(0x7f)),
        Frame::decode(Bytes::from_static(&[0x7f, 1, 2, 3]))
    );
}

#[test]
fn test_decode_rejects_truncated_header() {
    assert!(matches!(
        Frame::decode(Bytes::new()),
        Err(RpcError::MalformedFrame(_))
    ));
    assert!(matches!(
        Frame::decode(Bytes::from_static(&[0x02, 1, 2, 3])),
        Err(RpcError::MalformedFrame(_))
    ));
    assert!(matches!(
        Frame::decode(Bytes::from_static(&[0x05; 20])),
        Err(RpcError::MalformedFrame(_))
    ));
}

#[test]
fn test_correlation_id_display_is_hex() {
    let id = CorrelationId::from_bytes([0xab; CORRELATION_ID_LEN]);
    assert_eq!("ab".repeat(CORRELATION_ID_LEN), id.to_string());
    assert_ne!(CorrelationId::random(), CorrelationId::random());
}

#[test]
fn test_request_payload_encodes_as_tuple() {
    let payload = RequestPayload {
        method: "math.add".into(),
        args: vec![2.into(), 3.into()],
        kwargs: Kwargs::new(),
    };
    let json = serde_json::to_value(&payload).unwrap();
    assert_eq!(serde_json::json!(["math.add", [2, 3], {}]), json);
    assert_eq!(payload, serde_json::from_value(json).unwrap());
}
