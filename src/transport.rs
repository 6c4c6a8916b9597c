use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;

use async_trait::async_trait;
use coap_lite::error::MessageError;
use coap_lite::Packet;
use futures::{Sink, Stream};
use thiserror::Error;

/// Generalization of the underlying CoAP transport.  The core consumes a
/// continuous stream of `(Packet, Endpoint)` pairs and writes the same shape
/// back; anything that can frame CoAP packets this way (plain UDP being the
/// one shipped, see [`crate::udp::UdpTransport`]) can carry an endpoint.
#[async_trait]
pub trait Transport {
    type Endpoint: Debug + Send + Clone + Eq + Hash;

    /// Perform the binding, that is, begin accepting new data from this
    /// transport even if nothing is consuming it yet.  Packet-oriented
    /// transports simply start delivering framed items from any source.
    async fn bind(self) -> Result<BoxedFramedBinding<Self::Endpoint>, TransportError>;
}

pub type BoxedFramedBinding<Endpoint> = Pin<Box<dyn FramedBinding<Endpoint>>>;

/// A bound transport exposed as both a stream and a sink of framed packets,
/// the common shape async socket libraries converge on.
pub trait FramedBinding<Endpoint>:
    Send
    + Stream<Item = Result<FramedItem<Endpoint>, FramedReadError<Endpoint>>>
    + Sink<FramedItem<Endpoint>, Error = TransportError>
{
    /// Turns a server URI from the client's Security object into a peer
    /// address.  Name resolution is deliberately out of scope, so transports
    /// are expected to accept literals only.
    fn resolve_uri(&self, uri: &str) -> Result<Endpoint, TransportError>;
}

/// Parsed CoAP packet coming from (or going to) a remote peer.  The endpoint
/// travels with each packet so that packet-oriented protocols avoid the leaky
/// abstraction of a "connection".
pub type FramedItem<Endpoint> = (Packet, Endpoint);

/// Error when receiving from a remote peer.  The endpoint is optional as
/// there may be a generic read error unrelated to any peer, for example if
/// the underlying bound socket is closed.
pub type FramedReadError<Endpoint> = (TransportError, Option<Endpoint>);

/// Transport-level failures: being unable to bind, malformed input from a
/// peer, unusable server URIs.  Most of these are non-fatal and the endpoint
/// can happily keep serving other peers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet was malformed")]
    MalformedPacket(#[from] MessageError),

    #[error("unusable server URI '{0}'")]
    BadUri(String),

    #[error("unspecified: {0}")]
    Unspecified(String),
}

/// Fatal error preventing an endpoint's event loop from starting or
/// continuing.  Typically the result of programmer error or misconfiguration;
/// per-peer failures are logged and absorbed instead.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport failure not related to any individual peer that would
    /// prevent all future packet exchanges.  Must abort the loop.
    #[error("fatal transport error: {0}")]
    Transport(#[from] TransportError),
}
