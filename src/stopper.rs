use futures::Future;
use tokio::task::JoinHandle;
use crate::endpoint::Endpoint;
use crate::err::RpcResult;
use crate::transport::Address;

/// Represents a way to stop a concurrent process and to wait for it to stop. Returned by some functions that spawn concurrent processes.
pub trait Stopper{
    /// Send a stop signal to the process and then wait for it to terminate
    fn stop(self) -> impl Future<Output=RpcResult<()>> + Send;
    /// Wait for the process to terminate without sending a stop signal
    fn join(self) -> impl Future<Output=RpcResult<()>> + Send;
}

/// Stops a running endpoint. Holding it keeps the endpoint alive even after every `Endpoint`
/// handle is dropped, so a pure server can simply `join` it.
pub struct EndpointStopper<A: Address>{
    endpoint: Endpoint<A>,
    join_handle: JoinHandle<RpcResult<()>>,
}

impl<A: Address> EndpointStopper<A>{
    pub(crate) fn new(endpoint: Endpoint<A>, join_handle: JoinHandle<RpcResult<()>>) -> Self{
        Self { endpoint, join_handle }
    }
}

impl<A: Address> Stopper for EndpointStopper<A>{
    async fn stop(self) -> RpcResult<()> {
        self.endpoint.close().await?;
        self.join_handle.await??;
        Ok(())
    }

    /// Returns once the endpoint is closed through some handle, shut down remotely or its
    /// transport ends.
    async fn join(self) -> RpcResult<()> {
        self.join_handle.await??;
        Ok(())
    }
}
