pub use crate::err::*;
pub use crate::codec::{CborCodec, Codec, JsonCodec};
pub use crate::config::EndpointConfig;
pub use crate::endpoint::{CallOptions, Endpoint, EndpointBuilder, EndpointStats};
pub use crate::protocol::{Kwargs, Value};
pub use crate::registry::{Handler, HandlerError, HandlerResult, Invocation, Registry, Resolver};
pub use crate::stopper::{EndpointStopper, Stopper};
pub use crate::transport::memory::MemoryNetwork;
pub use crate::transport::{Address, Transport};
