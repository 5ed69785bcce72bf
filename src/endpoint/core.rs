use super::admin::Authorizer;
use super::pending::{PendingRequest, PendingTable, Waiter};
use super::tasks::{spawn_task, TaskCompletion, TaskTable};
use super::EndpointStats;
use crate::codec::Codec;
use crate::config::EndpointConfig;
use crate::err::*;
use crate::protocol::*;
use crate::registry::{Invocation, Resolver};
use crate::transport::{Address, Transport};

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

pub(crate) struct CallTask<A> {
    pub(crate) address: A,
    pub(crate) request: RequestPayload,
    pub(crate) timeout: Duration,
    pub(crate) cancel_remote: Option<bool>,
    pub(crate) callback: Waiter<Value>,
}

pub(crate) struct PingTask<A> {
    pub(crate) address: A,
    pub(crate) timeout: Duration,
    pub(crate) callback: Waiter<bool>,
}

pub(crate) struct ShutdownTask<A> {
    pub(crate) address: A,
    pub(crate) callback: Waiter<()>,
}

pub(crate) enum Expiry<A> {
    Call(CorrelationId, u64),
    Ping(A, u64),
}

pub(crate) enum Command<A> {
    Call(CallTask<A>),
    Ping(PingTask<A>),
    Shutdown(ShutdownTask<A>),
    Stats(oneshot::Sender<EndpointStats>),
    Close(oneshot::Sender<()>),
    Expire(Expiry<A>),
    TaskDone {
        id: CorrelationId,
        peer: A,
        outcome: Option<ResponsePayload>,
    },
}

pub(crate) enum Exit {
    Closed,
    Shutdown,
}

/// Owns all state of one endpoint and runs as a single task. Every table is touched only from
/// here so no locking is needed.
pub(crate) struct EndpointCore<TTransport, A, C>
where
    TTransport: Transport<A>,
    A: Address,
    C: Codec,
{
    transport: TTransport,
    codec: C,
    config: EndpointConfig,
    resolver: Arc<dyn Resolver>,
    authorizer: Authorizer<A>,
    calls: PendingTable<CorrelationId, A, Value>,
    pings: PendingTable<A, A, bool>,
    tasks: TaskTable<A>,
    workers: Arc<Semaphore>,
    next_serial: u64,
    command_receiver: UnboundedReceiver<Command<A>>,
    // timers and handler tasks must not keep the endpoint alive
    command_sender: WeakUnboundedSender<Command<A>>,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl<TTransport, A, C> EndpointCore<TTransport, A, C>
where
    TTransport: Transport<A>,
    A: Address,
    C: Codec,
{
    pub(crate) fn new(
        transport: TTransport,
        codec: C,
        config: EndpointConfig,
        resolver: Arc<dyn Resolver>,
        authorizer: Authorizer<A>,
        command_sender: WeakUnboundedSender<Command<A>>,
        command_receiver: UnboundedReceiver<Command<A>>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_blocking_handlers));
        EndpointCore {
            transport,
            codec,
            config,
            resolver,
            authorizer,
            calls: PendingTable::new(),
            pings: PendingTable::new(),
            tasks: TaskTable::new(),
            workers,
            next_serial: 0,
            command_receiver,
            command_sender,
            close_acks: vec![],
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<RpcResult<()>> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) -> RpcResult<()> {
        let exit = self.main_loop().await;

        self.teardown().await;

        match exit {
            Ok(Exit::Shutdown) if self.config.exit_on_shutdown => {
                log::info!("Endpoint shut down remotely, exiting process");
                std::process::exit(0);
            }
            Ok(Exit::Shutdown) => {
                log::info!("Endpoint shut down remotely");
                Ok(())
            }
            Ok(Exit::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn main_loop(&mut self) -> RpcResult<Exit> {
        loop {
            let flow = tokio::select! {
                // datagram from a peer
                received = self.transport.next() => {
                    match received {
                        Some(Ok((peer, datagram))) => self.after_receive(peer, datagram).await,
                        Some(Err(e)) => {
                            log::warn!("Receive failed: {}", e);
                            ControlFlow::Continue(())
                        },
                        None => return Err(RpcError::ChannelClosed),
                    }
                },
                // command from a handle, a timer or a finished task
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.execute(command).await,
                        None => ControlFlow::Break(Exit::Closed),
                    }
                }
            };

            if let ControlFlow::Break(exit) = flow {
                return Ok(exit);
            }
        }
    }

    async fn execute(&mut self, command: Command<A>) -> ControlFlow<Exit> {
        match command {
            Command::Call(task) => {
                self.prune_abandoned().await;
                self.call(task).await
            }
            Command::Ping(task) => {
                self.prune_abandoned().await;
                self.ping(task).await
            }
            Command::Shutdown(task) => {
                let token = self
                    .config
                    .admin_token
                    .as_ref()
                    .map(|t| Bytes::copy_from_slice(t.as_bytes()))
                    .unwrap_or_default();
                let result = self.send(Frame::Shutdown { token }, task.address).await;
                let _ = task.callback.send(result);
            }
            Command::Stats(callback) => {
                self.prune_abandoned().await;
                let _ = callback.send(self.stats());
            }
            Command::Close(ack) => {
                self.close_acks.push(ack);
                return ControlFlow::Break(Exit::Closed);
            }
            Command::Expire(expiry) => self.expire(expiry).await,
            Command::TaskDone { id, peer, outcome } => self.task_done(id, peer, outcome).await,
        }

        ControlFlow::Continue(())
    }

    async fn send(&mut self, frame: Frame, peer: A) -> RpcResult<()> {
        #[cfg(debug_assertions)]
        log::trace!("<-- {:?} {}", &peer, crate::debug::frame_to_string(&frame));

        self.transport.send((frame.encode(), peer)).await
    }

    async fn after_receive(&mut self, peer: A, datagram: Bytes) -> ControlFlow<Exit> {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(RpcError::UnknownTag(tag)) => {
                log::debug!("Dropped frame from {:?} with unknown tag {:#04x}", peer, tag);
                return ControlFlow::Continue(());
            }
            Err(e) => {
                log::warn!("Dropped frame from {:?}: {}", peer, e);
                return ControlFlow::Continue(());
            }
        };

        #[cfg(debug_assertions)]
        log::trace!("--> {:?} {}", &peer, crate::debug::frame_to_string(&frame));

        match frame {
            Frame::Ping => self.on_ping(peer).await,
            Frame::Pong => self.on_pong(peer),
            Frame::Request { id, payload } => self.on_request(peer, id, payload).await,
            Frame::Response { id, payload } => self.on_response(peer, id, payload),
            Frame::Cancel { id } => self.on_cancel(peer, id),
            Frame::Shutdown { token } => return self.on_shutdown(peer, token),
        }

        ControlFlow::Continue(())
    }

    async fn on_ping(&mut self, peer: A) {
        if let Err(e) = self.send(Frame::Pong, peer).await {
            log::warn!("Send PONG failed: {}", e);
        }
    }

    fn on_pong(&mut self, peer: A) {
        match self.pings.take(&peer) {
            Some(pending) => pending.resolve(Ok(true)),
            None => log::debug!("Dropped unsolicited PONG from {:?}", peer),
        }
    }

    async fn on_request(&mut self, peer: A, id: CorrelationId, payload: Bytes) {
        if self.tasks.contains(&id) {
            log::debug!("Dropped duplicate REQUEST {} from {:?}", id, peer);
            return;
        }

        let request: RequestPayload = match self.codec.decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                self.respond(peer, id, Err(RemoteError::BadRequest(e.to_string())))
                    .await;
                return;
            }
        };

        let handler = match self.resolver.resolve(&request.method) {
            Some(handler) => handler,
            None => {
                self.respond(peer, id, Err(RemoteError::HandlerNotFound(request.method)))
                    .await;
                return;
            }
        };

        let RequestPayload {
            method,
            args,
            mut kwargs,
        } = request;

        if !handler.accepts_timeout() {
            kwargs.remove(TIMEOUT_KWARG);
        }

        let token = self.tasks.insert(id, peer.clone(), &method);
        let invocation = Invocation::new(method, args, kwargs, token.clone());
        spawn_task(
            TaskCompletion::new(id, peer, self.command_sender.clone()),
            handler,
            invocation,
            token,
            self.workers.clone(),
        );
    }

    async fn task_done(&mut self, id: CorrelationId, peer: A, outcome: Option<ResponsePayload>) {
        let task = self.tasks.remove(&id);

        match outcome {
            Some(response) => self.respond(peer, id, response).await,
            None => log::debug!(
                "Task {} ({}) cancelled, no response sent",
                id,
                task.map(|t| t.method).unwrap_or_default()
            ),
        }
    }

    async fn respond(&mut self, peer: A, id: CorrelationId, response: ResponsePayload) {
        let payload = match self.codec.encode(&response) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Serialize response {} failed: {}", id, e);
                let fallback: ResponsePayload =
                    Err(RemoteError::UnserializableResponse(e.to_string()));
                match self.codec.encode(&fallback) {
                    Ok(payload) => payload,
                    Err(_) => return,
                }
            }
        };

        let frame = Frame::Response {
            id,
            payload: Bytes::from(payload),
        };

        if let Err(e) = self.send(frame, peer).await {
            log::warn!("Send RESPONSE {} failed: {}", id, e);
        }
    }

    fn on_response(&mut self, peer: A, id: CorrelationId, payload: Bytes) {
        let pending = match self.calls.take(&id) {
            Some(pending) => pending,
            None => {
                log::debug!("Dropped RESPONSE {} from {:?}: nothing pending", id, peer);
                return;
            }
        };

        let result = match self.codec.decode::<ResponsePayload>(&payload) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(RpcError::Remote(remote)),
            Err(e) => Err(e),
        };

        pending.resolve(result);
    }

    fn on_cancel(&mut self, peer: A, id: CorrelationId) {
        if !self.tasks.cancel(&id, &peer) {
            log::debug!("Ignored CANCEL {} from {:?}: no such task", id, peer);
        }
    }

    fn on_shutdown(&mut self, peer: A, token: Bytes) -> ControlFlow<Exit> {
        if (self.authorizer)(&peer, &token) {
            log::info!("SHUTDOWN from {:?} authorized", peer);
            ControlFlow::Break(Exit::Shutdown)
        } else {
            log::warn!("Ignored unauthorized SHUTDOWN from {:?}", peer);
            ControlFlow::Continue(())
        }
    }

    async fn call(&mut self, task: CallTask<A>) {
        let CallTask {
            address,
            mut request,
            timeout,
            cancel_remote,
            callback,
        } = task;

        let mut id = CorrelationId::random();
        while self.calls.contains(&id) {
            id = CorrelationId::random();
        }

        if self.config.forward_timeout
            && !timeout.is_zero()
            && !request.kwargs.contains_key(TIMEOUT_KWARG)
        {
            request
                .kwargs
                .insert(TIMEOUT_KWARG.to_string(), Value::from(timeout.as_secs_f64()));
        }

        let payload = match self.codec.encode(&request) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                let _ = callback.send(Err(e));
                return;
            }
        };

        let serial = self.next_serial();
        let cancel_remote = cancel_remote.unwrap_or(self.config.cancel_on_timeout);
        let mut pending = PendingRequest::new(address.clone(), serial, cancel_remote, callback);
        if let Some(handle) = self.schedule_expiry(timeout, Expiry::Call(id, serial)) {
            pending.set_timeout_handle(handle);
        }
        if let Err(pending) = self.calls.insert(id, pending) {
            pending.resolve(Err(RpcError::InternalError(format!(
                "correlation id {} already pending",
                id
            ))));
            return;
        }

        if let Err(e) = self.send(Frame::Request { id, payload }, address).await {
            log::warn!("Send REQUEST {} failed: {}", id, e);
            if let Some(pending) = self.calls.take(&id) {
                pending.resolve(Err(e));
            }
        }
    }

    async fn ping(&mut self, task: PingTask<A>) {
        let PingTask {
            address,
            timeout,
            callback,
        } = task;

        // join the probe already in flight to this address
        let callback = match self.pings.attach(&address, callback) {
            Ok(()) => return,
            Err(callback) => callback,
        };

        let serial = self.next_serial();
        let mut pending = PendingRequest::new(address.clone(), serial, false, callback);
        if let Some(handle) = self.schedule_expiry(timeout, Expiry::Ping(address.clone(), serial)) {
            pending.set_timeout_handle(handle);
        }
        if let Err(pending) = self.pings.insert(address.clone(), pending) {
            pending.resolve(Err(RpcError::InternalError(format!(
                "ping to {:?} already pending",
                address
            ))));
            return;
        }

        if let Err(e) = self.send(Frame::Ping, address.clone()).await {
            log::warn!("Send PING to {:?} failed: {}", address, e);
            if let Some(pending) = self.pings.take(&address) {
                pending.resolve(Err(e));
            }
        }
    }

    async fn expire(&mut self, expiry: Expiry<A>) {
        match expiry {
            Expiry::Call(id, serial) => {
                let pending = match self.calls.take_expired(&id, serial) {
                    Some(pending) => pending,
                    None => return,
                };

                let peer = pending.peer.clone();
                let cancel_remote = pending.cancel_remote;
                pending.resolve(Err(RpcError::Timeout));

                log::debug!("Call {} to {:?} timed out", id, peer);

                if cancel_remote {
                    // best effort, no acknowledgement and no retry
                    if let Err(e) = self.send(Frame::Cancel { id }, peer).await {
                        log::warn!("Send CANCEL {} failed: {}", id, e);
                    }
                }
            }
            Expiry::Ping(peer, serial) => {
                if let Some(pending) = self.pings.take_expired(&peer, serial) {
                    pending.resolve(Ok(false));
                }
            }
        }
    }

    /// Forget calls and pings nobody is waiting for any more. An abandoned call is cancelled
    /// remotely as if it had timed out.
    async fn prune_abandoned(&mut self) {
        for (id, pending) in self.calls.take_abandoned() {
            log::debug!("Call {} to {:?} abandoned by its caller", id, pending.peer);
            if pending.cancel_remote {
                if let Err(e) = self.send(Frame::Cancel { id }, pending.peer.clone()).await {
                    log::warn!("Send CANCEL {} failed: {}", id, e);
                }
            }
        }
        self.pings.take_abandoned();
    }

    /// Arrange for `expiry` to come back through the command channel after `timeout`. A zero
    /// timeout means wait forever.
    fn schedule_expiry(&self, timeout: Duration, expiry: Expiry<A>) -> Option<JoinHandle<()>> {
        if timeout.is_zero() {
            return None;
        }

        let command_sender = self.command_sender.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(command_sender) = command_sender.upgrade() {
                let _ = command_sender.send(Command::Expire(expiry));
            }
        }))
    }

    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn stats(&self) -> EndpointStats {
        EndpointStats {
            pending_calls: self.calls.len(),
            pending_pings: self.pings.len(),
            in_flight_tasks: self.tasks.len(),
        }
    }

    /// Resolve everything pending, cancel every task and refuse further commands. Runs exactly
    /// once, when the main loop ends for whatever reason.
    async fn teardown(&mut self) {
        for pending in self.calls.drain() {
            pending.resolve(Err(RpcError::EndpointClosed));
        }
        for pending in self.pings.drain() {
            pending.resolve(Err(RpcError::EndpointClosed));
        }
        self.tasks.cancel_all();
        self.workers.close();

        self.command_receiver.close();
        while let Ok(command) = self.command_receiver.try_recv() {
            match command {
                Command::Call(task) => {
                    let _ = task.callback.send(Err(RpcError::EndpointClosed));
                }
                Command::Ping(task) => {
                    let _ = task.callback.send(Err(RpcError::EndpointClosed));
                }
                Command::Shutdown(task) => {
                    let _ = task.callback.send(Err(RpcError::EndpointClosed));
                }
                Command::Stats(callback) => {
                    let _ = callback.send(self.stats());
                }
                Command::Close(ack) => self.close_acks.push(ack),
                Command::Expire(_) | Command::TaskDone { .. } => {}
            }
        }

        debug_assert!(self.calls.is_empty() && self.pings.is_empty() && self.tasks.is_empty());

        if let Err(e) = self.transport.close().await {
            log::debug!("Close transport failed: {}", e);
        }

        for ack in self.close_acks.drain(..) {
            let _ = ack.send(());
        }
    }
}
