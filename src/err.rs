use thiserror::Error;

/// An error raised on the remote side while serving a request. Travels back to the caller inside
/// the `RESPONSE` frame, so it must stay serializable.
#[derive(Error, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum RemoteError {
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("{kind}: {message}")]
    Handler { kind: String, message: String },
    #[error("Handler panicked: {0}")]
    Panic(String),
    #[error("Handler unavailable: {0}")]
    Unavailable(String),
    #[error("Serialize response failed: {0}")]
    UnserializableResponse(String),
}

impl RemoteError {
    /// The exception-like kind of the error, e.g. `ValueError` for a handler error or
    /// `HandlerNotFound` when the method could not be resolved.
    pub fn kind(&self) -> &str {
        match self {
            RemoteError::HandlerNotFound(_) => "HandlerNotFound",
            RemoteError::BadRequest(_) => "BadRequest",
            RemoteError::Handler { kind, .. } => kind,
            RemoteError::Panic(_) => "Panic",
            RemoteError::Unavailable(_) => "Unavailable",
            RemoteError::UnserializableResponse(_) => "UnserializableResponse",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::HandlerNotFound(msg)
            | RemoteError::BadRequest(msg)
            | RemoteError::Panic(msg)
            | RemoteError::Unavailable(msg)
            | RemoteError::UnserializableResponse(msg) => msg,
            RemoteError::Handler { message, .. } => message,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Request failed: Timeout while awaiting response")]
    Timeout,
    #[error("Request failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Malformed frame: Unknown tag {0:#04x}")]
    UnknownTag(u8),

    #[error("Invalid method name: {0}")]
    InvalidMethodName(String),
    #[error("Register method failed: Already registered: {0}")]
    MethodAlreadyRegistered(String),

    #[error("Endpoint closed")]
    EndpointClosed,
    #[error("Channel closed by peer")]
    ChannelClosed,
    #[error("Address already bound: {0}")]
    AddressInUse(String),

    #[error("Deserialize payload failed: {0}")]
    MalformedPayload(String),
    #[error("Serialize payload failed: {0}")]
    UnserializablePayload(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IOError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for RpcError {
    fn from(error: ciborium::ser::Error<T>) -> Self {
        RpcError::UnserializablePayload(format!("CBOR serialization failed: {:?}", error))
    }
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for RpcError {
    fn from(error: ciborium::de::Error<T>) -> Self {
        RpcError::MalformedPayload(format!("CBOR deserialization failed: {:?}", error))
    }
}

impl From<std::io::Error> for RpcError {
    fn from(error: std::io::Error) -> Self {
        RpcError::IOError(error.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RpcError {
    fn from(_error: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RpcError::EndpointClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RpcError {
    fn from(_error: tokio::sync::oneshot::error::RecvError) -> Self {
        RpcError::EndpointClosed
    }
}

impl From<tokio::task::JoinError> for RpcError {
    fn from(error: tokio::task::JoinError) -> Self {
        RpcError::InternalError(error.to_string())
    }
}

impl From<serde_json::error::Error> for RpcError {
    fn from(error: serde_json::error::Error) -> Self {
        RpcError::MalformedPayload(error.to_string())
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

#[test]
fn test_remote_error_kind_and_message() {
    let err = RemoteError::Handler {
        kind: "ValueError".into(),
        message: "x".into(),
    };
    assert_eq!("ValueError", err.kind());
    assert_eq!("x", err.message());
    assert_eq!("ValueError: x", err.to_string());

    let err = RemoteError::HandlerNotFound("math.div".into());
    assert_eq!("HandlerNotFound", err.kind());
    assert_eq!("math.div", err.message());
}

#[test]
fn test_remote_error_wraps_into_rpc_error() {
    let err: RpcError = RemoteError::Panic("boom".into()).into();
    assert_eq!(RpcError::Remote(RemoteError::Panic("boom".into())), err);
    assert_eq!("Request failed: Handler panicked: boom", err.to_string());
}
