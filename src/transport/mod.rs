use crate::err::*;
use bytes::Bytes;
use std::fmt::Debug;
use std::hash::Hash;

pub mod memory;
pub mod udp;

/// Identifies a peer on a transport. Owned by the transport, borrowed by the endpoint.
pub trait Address: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Address for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// A connectionless, unreliable datagram transport. Yields `(sender, datagram)` pairs and accepts
/// `(datagram, destination)` pairs. No ordering, retries or delivery guarantees.
pub trait Transport<A: Address>:
    'static
    + futures::Stream<Item = RpcResult<(A, Bytes)>>
    + futures::Sink<(Bytes, A), Error = RpcError>
    + Send
    + Unpin
{
}
