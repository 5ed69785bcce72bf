use bytes::Bytes;
use futures::{ready, Sink, Stream};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::codec::BytesCodec;
use tokio_util::udp::UdpFramed;

use crate::err::*;

use super::Transport;

/// Bind a UDP socket at `addr` and wrap it as a transport.
/// ```ignore
/// let transport = t2_rpc::transport::udp::bind("127.0.0.1:0").await?;
/// let local_addr = transport.local_addr()?;
/// ```
pub async fn bind(addr: impl ToSocketAddrs) -> RpcResult<UdpTransport> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    Ok(UdpTransport {
        inbound: UdpFramed::new(socket.clone(), BytesCodec::new()),
        socket,
        outbound: None,
    })
}

/// Each datagram is one frame. Receiving goes through `UdpFramed`; sending writes straight to
/// the socket and holds at most one datagram, which is discarded whether or not the send
/// succeeds, so a failed send never affects the next one.
pub struct UdpTransport {
    inbound: UdpFramed<BytesCodec, Arc<UdpSocket>>,
    socket: Arc<UdpSocket>,
    outbound: Option<(Bytes, SocketAddr)>,
}

impl UdpTransport {
    pub fn local_addr(&self) -> RpcResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn poll_send_outbound(&mut self, cx: &mut Context<'_>) -> Poll<RpcResult<()>> {
        let result = match &self.outbound {
            Some((datagram, target)) => ready!(self.socket.poll_send_to(cx, datagram, *target)),
            None => return Poll::Ready(Ok(())),
        };

        self.outbound = None;

        Poll::Ready(result.map(|_| ()).map_err(RpcError::from))
    }
}

impl Stream for UdpTransport {
    type Item = RpcResult<(SocketAddr, Bytes)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inbound)
            .poll_next(cx)
            .map(|received| {
                received.map(|r| {
                    r.map(|(datagram, from)| (from, datagram.freeze()))
                        .map_err(RpcError::from)
                })
            })
    }
}

impl Sink<(Bytes, SocketAddr)> for UdpTransport {
    type Error = RpcError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_send_outbound(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: (Bytes, SocketAddr)) -> Result<(), Self::Error> {
        self.get_mut().outbound = Some(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_send_outbound(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_send_outbound(cx)
    }
}

impl Transport<SocketAddr> for UdpTransport {}

#[tokio::test]
async fn test_udp_datagrams() {
    use futures::{SinkExt, StreamExt};

    let mut a = bind("127.0.0.1:0").await.unwrap();
    let mut b = bind("127.0.0.1:0").await.unwrap();
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();

    a.send((Bytes::from_static(&[0x03]), b_addr)).await.unwrap();

    let (from, datagram) = b.next().await.unwrap().unwrap();
    assert_eq!(a_addr, from);
    assert_eq!(&[0x03][..], &datagram[..]);
}

#[tokio::test]
async fn test_failed_send_does_not_block_later_sends() {
    use futures::{SinkExt, StreamExt};

    let mut a = bind("127.0.0.1:0").await.unwrap();
    let mut b = bind("127.0.0.1:0").await.unwrap();
    let b_addr = b.local_addr().unwrap();

    // an IPv4 socket cannot send to an IPv6 address
    let unreachable: SocketAddr = "[::1]:9".parse().unwrap();
    assert!(a.send((Bytes::from_static(&[0x03]), unreachable)).await.is_err());

    a.send((Bytes::from_static(&[0x04]), b_addr)).await.unwrap();
    a.send((Bytes::from_static(&[0x05]), b_addr)).await.unwrap();

    let (_, first) = b.next().await.unwrap().unwrap();
    let (_, second) = b.next().await.unwrap().unwrap();
    assert_eq!(&[0x04][..], &first[..]);
    assert_eq!(&[0x05][..], &second[..]);
}
