pub mod admin;
mod builder;
pub(crate) mod core;
mod pending;
mod tasks;

pub use self::builder::EndpointBuilder;

use self::core::*;
use crate::err::*;
use crate::method::parse_method;
use crate::protocol::*;
use crate::transport::Address;

use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// How a single call behaves.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CallOptions {
    /// How long to wait for the response. Zero waits forever.
    pub timeout: Duration,
    /// Whether to send a best-effort `CANCEL` to the peer on timeout. `None` uses the endpoint's
    /// `cancel_on_timeout` setting.
    pub cancel_remote: Option<bool>,
}

impl CallOptions {
    pub fn new(timeout: Duration) -> Self {
        CallOptions {
            timeout,
            cancel_remote: None,
        }
    }

    /// No timer is started. If the caller drops the call future, the pending entry is pruned
    /// the next time the endpoint handles a call, ping or stats request, and the peer gets a
    /// best-effort CANCEL as it would on a timeout.
    pub fn wait_forever() -> Self {
        CallOptions::default()
    }

    pub fn cancel_remote(mut self, cancel_remote: bool) -> Self {
        self.cancel_remote = Some(cancel_remote);
        self
    }
}

impl From<Duration> for CallOptions {
    fn from(timeout: Duration) -> Self {
        CallOptions::new(timeout)
    }
}

/// A snapshot of an endpoint's tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub pending_calls: usize,
    pub pending_pings: usize,
    pub in_flight_tasks: usize,
}

/// A handle to a running endpoint. An endpoint is both a client, issuing calls to peers, and a
/// server, answering the calls peers make to it. Handles are cheap to clone; the endpoint
/// stops once it is closed or the last handle is dropped.
#[derive(Clone)]
pub struct Endpoint<A: Address> {
    command_sender: UnboundedSender<Command<A>>,
}

impl<A: Address> Endpoint<A> {
    pub(crate) fn new(command_sender: UnboundedSender<Command<A>>) -> Self {
        Endpoint { command_sender }
    }

    pub fn builder() -> EndpointBuilder<A> {
        EndpointBuilder::new()
    }

    /// Call `method` on the peer at `address` and wait for the result.
    ///
    /// Fails with `RpcError::Timeout` if no response arrives in time, `RpcError::Remote` if the
    /// peer could not serve the request and `RpcError::EndpointClosed` if this endpoint is
    /// closed before the response arrives.
    pub async fn call(
        &self,
        address: A,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: impl Into<CallOptions>,
    ) -> RpcResult<Value> {
        parse_method(method)?;
        let options = options.into();

        let (callback, receiver) = oneshot::channel();
        let task = Command::Call(CallTask {
            address,
            request: RequestPayload {
                method: method.to_string(),
                args,
                kwargs,
            },
            timeout: options.timeout,
            cancel_remote: options.cancel_remote,
            callback,
        });

        self.command_sender.send(task)?;
        receiver.await?
    }

    /// Like `call` but deserializes the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        address: A,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: impl Into<CallOptions>,
    ) -> RpcResult<T> {
        let value = self.call(address, method, args, kwargs, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Probe the peer at `address`. Resolves `true` once it answers, `false` if it does not
    /// answer within `timeout`.
    pub async fn ping(&self, address: A, timeout: Duration) -> RpcResult<bool> {
        let (callback, receiver) = oneshot::channel();
        self.command_sender
            .send(Command::Ping(PingTask {
                address,
                timeout,
                callback,
            }))?;
        receiver.await?
    }

    /// Ask the peer at `address` to shut down. There is no acknowledgement.
    pub async fn shutdown(&self, address: A) -> RpcResult<()> {
        let (callback, receiver) = oneshot::channel();
        self.command_sender
            .send(Command::Shutdown(ShutdownTask { address, callback }))?;
        receiver.await?
    }

    pub async fn stats(&self) -> RpcResult<EndpointStats> {
        let (callback, receiver) = oneshot::channel();
        self.command_sender.send(Command::Stats(callback))?;
        Ok(receiver.await?)
    }

    /// Close the endpoint: every pending call fails with `RpcError::EndpointClosed`, every
    /// running handler is cancelled. Returns once that is done. Closing a closed endpoint is a
    /// no-op.
    pub async fn close(&self) -> RpcResult<()> {
        let (ack, receiver) = oneshot::channel();
        if self.command_sender.send(Command::Close(ack)).is_err() {
            return Ok(());
        }
        // a dropped ack means the endpoint went away by itself
        let _ = receiver.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.command_sender.is_closed()
    }
}

#[test]
fn test_call_options() {
    let options: CallOptions = Duration::from_millis(100).into();
    assert_eq!(Duration::from_millis(100), options.timeout);
    assert_eq!(None, options.cancel_remote);

    let options = CallOptions::new(Duration::from_secs(1)).cancel_remote(false);
    assert_eq!(Some(false), options.cancel_remote);

    assert!(CallOptions::wait_forever().timeout.is_zero());
}
