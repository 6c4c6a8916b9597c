use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use coap_lite::Packet;
use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::transport::{BoxedFramedBinding, FramedBinding, Transport, TransportError};
use crate::types::DEFAULT_PORT;

/// Plain CoAP-over-UDP transport as defined in RFC 7252.  Likely what you
/// want unless you are bridging to something exotic.
pub struct UdpTransport<A: ToSocketAddrs> {
    addresses: A,
}

impl<A: ToSocketAddrs> UdpTransport<A> {
    pub fn new(addresses: A) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl<A: ToSocketAddrs + Send + Sync> Transport for UdpTransport<A> {
    type Endpoint = SocketAddr;

    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError> {
        let socket = UdpSocket::bind(self.addresses).await?;
        let framed_socket = UdpFramed::new(socket, Codec);
        Ok(Box::pin(UdpBinding { framed_socket }))
    }
}

#[pin_project]
struct UdpBinding {
    #[pin]
    framed_socket: UdpFramed<Codec>,
}

impl FramedBinding<SocketAddr> for UdpBinding {
    fn resolve_uri(&self, uri: &str) -> Result<SocketAddr, TransportError> {
        parse_server_uri(uri)
    }
}

impl Stream for UdpBinding {
    type Item = Result<(Packet, SocketAddr), (TransportError, Option<SocketAddr>)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .framed_socket
            .poll_next(cx)
            .map(|next| next.map(|result| result.map_err(|e| (e, None))))
    }
}

impl Sink<(Packet, SocketAddr)> for UdpBinding {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: (Packet, SocketAddr)) -> Result<(), Self::Error> {
        self.project().framed_socket.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().framed_socket.poll_close(cx)
    }
}

/// One datagram, one packet.
struct Codec;

impl Decoder for Codec {
    type Item = Packet;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = Packet::from_bytes(buf).map(Some).map_err(TransportError::from);
        buf.clear();
        result
    }
}

impl Encoder<Packet> for Codec {
    type Error = TransportError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), TransportError> {
        buf.extend_from_slice(&packet.to_bytes()?[..]);
        Ok(())
    }
}

/// Accepts `coap://<address>[:port]` or a bare address literal, defaulting to
/// the CoAP port.  Host names are refused: resolution is out of scope.
fn parse_server_uri(uri: &str) -> Result<SocketAddr, TransportError> {
    let authority = uri
        .strip_prefix("coap://")
        .unwrap_or(uri)
        .split('/')
        .next()
        .unwrap_or_default();
    if let Ok(addr) = authority.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = authority.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    Err(TransportError::BadUri(uri.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_uri() {
        assert_eq!(
            parse_server_uri("coap://127.0.0.1:5684").unwrap(),
            "127.0.0.1:5684".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_server_uri("coap://127.0.0.1").unwrap(),
            "127.0.0.1:5683".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_server_uri("coap://[::1]:9999").unwrap(),
            "[::1]:9999".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_server_uri("10.0.0.7:5683").unwrap(),
            "10.0.0.7:5683".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_server_uri_refuses_host_names() {
        assert!(parse_server_uri("coap://example.com").is_err());
        assert!(parse_server_uri("coaps://127.0.0.1").is_err());
        assert!(parse_server_uri("").is_err());
    }
}
