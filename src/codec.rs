use crate::err::*;
use serde::{de::DeserializeOwned, Serialize};

/// Turns request and response payloads into the opaque bytes carried after the frame header,
/// and back again.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> RpcResult<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> RpcResult<T>;
}

/// The default codec. Compact and self describing.
#[derive(Clone, Copy, Default, Debug)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn encode<T: Serialize>(&self, value: &T) -> RpcResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(value, &mut bytes)?;
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> RpcResult<T> {
        Ok(ciborium::de::from_reader(bytes)?)
    }
}

/// Human readable alternative, handy when sniffing traffic.
#[derive(Clone, Copy, Default, Debug)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> RpcResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| RpcError::UnserializablePayload(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> RpcResult<T> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::MalformedPayload(e.to_string()))
    }
}

#[cfg(test)]
use crate::protocol::{Kwargs, RequestPayload, ResponsePayload};
#[cfg(test)]
use serde_json::json;

#[cfg(test)]
fn request() -> RequestPayload {
    let mut kwargs = Kwargs::new();
    kwargs.insert("scale".into(), json!(1.5));
    RequestPayload {
        method: "math.add".into(),
        args: vec![json!(2), json!(-3), json!("x"), json!(null)],
        kwargs,
    }
}

#[cfg(test)]
fn check_request(codec: impl Codec) {
    let bytes = codec.encode(&request()).unwrap();
    let decoded: RequestPayload = codec.decode(&bytes).unwrap();
    assert_eq!(request(), decoded);
}

#[cfg(test)]
fn check_response(codec: impl Codec) {
    let ok: ResponsePayload = Ok(json!({"sum": 5, "items": [1, 2]}));
    let bytes = codec.encode(&ok).unwrap();
    assert_eq!(ok, codec.decode::<ResponsePayload>(&bytes).unwrap());

    let err: ResponsePayload = Err(RemoteError::Handler {
        kind: "ValueError".into(),
        message: "x".into(),
    });
    let bytes = codec.encode(&err).unwrap();
    assert_eq!(err, codec.decode::<ResponsePayload>(&bytes).unwrap());
}

#[test]
fn test_cbor_payloads() {
    check_request(CborCodec);
    check_response(CborCodec);
}

#[test]
fn test_json_payloads() {
    check_request(JsonCodec);
    check_response(JsonCodec);
}

#[test]
fn test_decode_garbage_is_malformed_payload() {
    assert!(matches!(
        CborCodec.decode::<RequestPayload>(&[0xff, 0x00, 0x13]),
        Err(RpcError::MalformedPayload(_))
    ));
    assert!(matches!(
        JsonCodec.decode::<RequestPayload>(b"{not json"),
        Err(RpcError::MalformedPayload(_))
    ));
}

#[test]
fn test_request_is_not_a_response() {
    let bytes = CborCodec.encode(&request()).unwrap();
    assert!(CborCodec.decode::<ResponsePayload>(&bytes).is_err());
}
