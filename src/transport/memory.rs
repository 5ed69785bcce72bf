use bytes::Bytes;
use futures::{Sink, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::err::*;

use super::Transport;

pub type MemoryAddr = String;

type Datagram = (MemoryAddr, Bytes);
type DropFilter = dyn Fn(&str, &str, &[u8]) -> bool + Send + Sync;

/// An in-process datagram network. Transports bind to string addresses; a datagram sent to an
/// address nobody is bound to is silently dropped.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    sockets: HashMap<MemoryAddr, UnboundedSender<Datagram>>,
    drop_filter: Option<Arc<DropFilter>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new transport at `addr`. Errors if the address is taken.
    pub fn bind(&self, addr: &str) -> RpcResult<MemoryTransport> {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();

        let mut inner = self.lock()?;
        if inner.sockets.contains_key(addr) {
            return Err(RpcError::AddressInUse(addr.to_string()));
        }
        inner.sockets.insert(addr.to_string(), sender);

        Ok(MemoryTransport {
            address: addr.to_string(),
            network: self.clone(),
            receiver,
        })
    }

    /// Install a filter deciding, per `(from, to, datagram)`, whether a datagram is lost.
    pub fn set_drop_filter(&self, filter: impl Fn(&str, &str, &[u8]) -> bool + Send + Sync + 'static) -> RpcResult<()> {
        self.lock()?.drop_filter = Some(Arc::new(filter));
        Ok(())
    }

    pub fn clear_drop_filter(&self) -> RpcResult<()> {
        self.lock()?.drop_filter = None;
        Ok(())
    }

    fn deliver(&self, from: &str, to: &str, datagram: Bytes) -> RpcResult<()> {
        let inner = self.lock()?;

        if let Some(filter) = &inner.drop_filter {
            if filter(from, to, &datagram) {
                log::trace!("memory network dropped datagram {} -> {}", from, to);
                return Ok(());
            }
        }

        match inner.sockets.get(to) {
            Some(sender) => {
                if sender.send((from.to_string(), datagram)).is_err() {
                    log::trace!("memory network: {} is closing, datagram dropped", to);
                }
            }
            None => log::trace!("memory network: nobody bound at {}, datagram dropped", to),
        }

        Ok(())
    }

    fn unbind(&self, addr: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sockets.remove(addr);
        }
    }

    fn lock(&self) -> RpcResult<std::sync::MutexGuard<'_, NetworkInner>> {
        self.inner
            .lock()
            .map_err(|_| RpcError::InternalError("memory network lock poisoned".into()))
    }
}

/// One socket on a `MemoryNetwork`. Unbinds its address when dropped.
pub struct MemoryTransport {
    address: MemoryAddr,
    network: MemoryNetwork,
    receiver: UnboundedReceiver<Datagram>,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> &str {
        &self.address
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(&self.address);
    }
}

impl Stream for MemoryTransport {
    type Item = RpcResult<Datagram>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx).map(|d| d.map(Ok))
    }
}

impl Sink<(Bytes, MemoryAddr)> for MemoryTransport {
    type Error = RpcError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, (datagram, to): (Bytes, MemoryAddr)) -> Result<(), Self::Error> {
        self.network.deliver(&self.address, &to, datagram)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl Transport<MemoryAddr> for MemoryTransport {}

#[cfg(test)]
use futures::{SinkExt, StreamExt};

#[tokio::test]
async fn test_send_and_receive() {
    let network = MemoryNetwork::new();
    let mut a = network.bind("a").unwrap();
    let mut b = network.bind("b").unwrap();

    a.send((Bytes::from_static(b"hello"), "b".to_string())).await.unwrap();

    let (from, datagram) = b.next().await.unwrap().unwrap();
    assert_eq!("a", &from);
    assert_eq!(&b"hello"[..], &datagram[..]);
}

#[tokio::test]
async fn test_unbound_destination_is_dropped() {
    let network = MemoryNetwork::new();
    let mut a = network.bind("a").unwrap();
    a.send((Bytes::from_static(b"lost"), "nowhere".to_string())).await.unwrap();
}

#[tokio::test]
async fn test_address_in_use_until_dropped() {
    let network = MemoryNetwork::new();
    let a = network.bind("a").unwrap();
    assert!(matches!(network.bind("a"), Err(RpcError::AddressInUse(_))));
    drop(a);
    assert_eq!("a", network.bind("a").unwrap().local_addr());
}

#[tokio::test]
async fn test_drop_filter() {
    let network = MemoryNetwork::new();
    let mut a = network.bind("a").unwrap();
    let mut b = network.bind("b").unwrap();

    network.set_drop_filter(|_, _, datagram| datagram == b"drop me").unwrap();
    a.send((Bytes::from_static(b"drop me"), "b".to_string())).await.unwrap();
    a.send((Bytes::from_static(b"keep me"), "b".to_string())).await.unwrap();

    let (_, datagram) = b.next().await.unwrap().unwrap();
    assert_eq!(&b"keep me"[..], &datagram[..]);

    network.clear_drop_filter().unwrap();
    a.send((Bytes::from_static(b"drop me"), "b".to_string())).await.unwrap();
    let (_, datagram) = b.next().await.unwrap().unwrap();
    assert_eq!(&b"drop me"[..], &datagram[..]);
}
