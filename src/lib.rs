//! Core of an LWM2M protocol endpoint over CoAP/UDP: the client-side
//! registration, observation and object-dispatch engine, the server-side
//! registration directory and management-interface issuer, and the TLV codec
//! they share.
//!
//! Build a client with [`ClientConfig`] + [`Lwm2mClient::bind`], a server
//! with [`Lwm2mServer::bind`], and drive both through their `run()` event
//! loops; the cloneable handles expose the user-facing APIs.

pub use client::{
    Capabilities, ClientConfig, CreatePayload, Lwm2mClient, Lwm2mClientHandle, ObjectDescriptor,
    ObjectHandler, Operation,
};
pub use error::Lwm2mError;
pub use path::Lwm2mPath;
pub use resource::{DataType, Resource, ResourceKind, Value};
pub use server::{
    ClientInfo, ClientObject, Lwm2mServer, Lwm2mServerHandle, MonitorId, ObserverId,
};
pub use tlv::{Tlv, TlvKind};
pub use transport::{FatalError, Transport, TransportError};
pub use types::{BindingMode, ContentType, RegistrationEvent, DEFAULT_PORT};
pub use udp::UdpTransport;

pub mod client;
pub mod error;
mod link;
pub mod path;
pub mod resource;
pub mod server;
pub mod tlv;
pub mod transport;
pub mod types;
pub mod udp;
