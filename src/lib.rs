//! # T2 RPC
//!
//! A bidirectional request/response protocol on top of an unreliable, connectionless datagram
//! transport. Every participant is an [`Endpoint`]: it can call named methods on its peers and
//! serve the calls its peers make to it, at the same time, over the same socket.
//!
//! ## Frames
//!
//! Each datagram carries one frame:
//!
//! ```text
//! byte 0       : tag  (REQUEST=1, RESPONSE=2, PING=3, PONG=4, CANCEL=5, SHUTDOWN=6)
//! bytes 1..21  : correlation id   (REQUEST, RESPONSE, CANCEL)
//! bytes 21..   : codec-encoded payload (REQUEST, RESPONSE)
//! ```
//!
//! There are no retries and no ordering guarantees. A call that gets no response within its
//! timeout fails with [`RpcError::Timeout`] and, by default, a best-effort `CANCEL` frame is sent
//! so the peer can stop working on it.
//!
//! ## Serving
//!
//! Handlers are registered in a [`Registry`] under dotted method names. Asynchronous handlers
//! run on the runtime, blocking handlers on a bounded worker pool.
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register_blocking("math.add", |inv| {
//!     Ok((inv.arg::<i64>(0)? + inv.arg::<i64>(1)?).into())
//! })?;
//! // dropped at its next `.await` if the caller cancels
//! registry.register_async("sys.sleep", |inv| async move {
//!     let seconds: f64 = inv.arg(0)?;
//!     tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
//!     HandlerResult::Ok(Value::Null)
//! })?;
//!
//! let transport = t2_rpc::transport::udp::bind("127.0.0.1:4242").await?;
//! let (_endpoint, stopper) = EndpointBuilder::new().resolver(registry).start(transport)?;
//! stopper.join().await?;
//! ```
//!
//! ## Calling
//!
//! ```ignore
//! let transport = t2_rpc::transport::udp::bind("127.0.0.1:0").await?;
//! let (endpoint, _stopper) = EndpointBuilder::new().start(transport)?;
//!
//! let server = "127.0.0.1:4242".parse()?;
//! let sum: i64 = endpoint
//!     .call_as(server, "math.add", vec![2.into(), 3.into()], Kwargs::new(), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(5, sum);
//!
//! assert!(endpoint.ping(server, Duration::from_millis(200)).await?);
//! ```
//!
//! ## In-process
//!
//! A [`MemoryNetwork`] connects endpoints within one process, which is how the test suite runs.
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let (server, _) = EndpointBuilder::new().resolver(registry).start(network.bind("server")?)?;
//! let (client, _) = EndpointBuilder::new().start(network.bind("client")?)?;
//! ```

pub mod codec;
pub mod config;
pub mod endpoint;
pub(crate) mod err;
pub(crate) mod method;
pub mod prelude;
pub(crate) mod protocol;
pub mod registry;
mod stopper;
pub mod transport;
#[cfg(debug_assertions)]
pub(crate) mod debug;

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

#[cfg(test)]
pub mod test;

pub use err::*;
pub use codec::{CborCodec, Codec, JsonCodec};
pub use config::{EndpointConfig, DEFAULT_PORT};
pub use endpoint::{CallOptions, Endpoint, EndpointBuilder, EndpointStats};
pub use method::join_method;
pub use protocol::{CorrelationId, Frame, Kwargs, RequestPayload, ResponsePayload, Tag, Value, CORRELATION_ID_LEN, TIMEOUT_KWARG};
pub use registry::{Handler, HandlerError, HandlerResult, Invocation, Registry, Resolver};
pub use stopper::{EndpointStopper, Stopper};
pub use transport::memory::{MemoryAddr, MemoryNetwork, MemoryTransport};
pub use transport::udp::UdpTransport;
pub use transport::{Address, Transport};
