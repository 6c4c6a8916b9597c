use std::collections::HashMap;
use std::fmt;
use std::str;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet};

use crate::error::Lwm2mError;

/// Default UDP port for an LWM2M server, as assigned to CoAP.
pub const DEFAULT_PORT: u16 = 5683;

/// Root path of the registration interface.
pub(crate) const REGISTRATION_PATH: &str = "rd";

/// Protocol version advertised in the register query.
pub(crate) const LWM2M_VERSION: &str = "1.0";

/// OMA-registered ids for the two mandatory objects the client reads at
/// startup to discover its servers.
pub mod oma {
    pub const SECURITY_OBJECT: u16 = 0;
    pub const SECURITY_SERVER_URI: u16 = 0;
    pub const SECURITY_SHORT_SERVER_ID: u16 = 10;

    pub const SERVER_OBJECT: u16 = 1;
    pub const SERVER_SHORT_SERVER_ID: u16 = 0;
    pub const SERVER_LIFETIME: u16 = 1;
    pub const SERVER_BINDING: u16 = 7;
}

/// LWM2M payload content formats.
///
/// The wire values emitted are the original OMA-assigned family (1541..1544);
/// the later IANA-registered aliases (0, 42, 11542, 11543) are accepted on
/// input and normalized.  JSON is recognized only so that it can be refused
/// with 4.15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Text,
    Tlv,
    Json,
    Opaque,
}

impl ContentType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 | 1541 => Some(Self::Text),
            42 | 1544 => Some(Self::Opaque),
            1542 | 11542 => Some(Self::Tlv),
            1543 | 11543 => Some(Self::Json),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Self::Text => 1541,
            Self::Tlv => 1542,
            Self::Json => 1543,
            Self::Opaque => 1544,
        }
    }
}

/// Client reachability pattern declared at registration.  Only `U` is
/// operative in this profile; the others are accepted on the wire and kept in
/// the client info but do not alter behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    U,
    UQ,
    S,
    SQ,
    US,
    UQS,
    Unknown,
}

impl BindingMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "U" => Self::U,
            "UQ" => Self::UQ,
            "S" => Self::S,
            "SQ" => Self::SQ,
            "US" => Self::US,
            "UQS" => Self::UQS,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U => "U",
            Self::UQ => "UQ",
            Self::S => "S",
            Self::SQ => "SQ",
            Self::US => "US",
            Self::UQS => "UQS",
            Self::Unknown => "?",
        }
    }
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle change of a client as seen by the server directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A client registered with the server.
    Register,
    /// A registered client refreshed or changed its registration.
    Update,
    /// A client explicitly deregistered.
    Unregister,
    /// The server discarded a client that went silent past its lifetime.
    Timeout,
}

/// Reads the Content-Format option as a raw CoAP uint.  A present but empty
/// option value means 0 (text/plain).
pub(crate) fn content_format_of(packet: &Packet) -> Option<u32> {
    packet
        .get_option(CoapOption::ContentFormat)
        .and_then(|values| values.front())
        .map(|raw| raw.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

pub(crate) fn set_content_format(packet: &mut Packet, content_type: ContentType) {
    let value = content_type.to_wire();
    packet.clear_option(CoapOption::ContentFormat);
    packet.add_option(CoapOption::ContentFormat, value.to_be_bytes().to_vec());
}

pub(crate) fn set_uri_path<'a>(packet: &mut Packet, segments: impl IntoIterator<Item = &'a str>) {
    for segment in segments {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
}

pub(crate) fn add_uri_query(packet: &mut Packet, key: &str, value: &str) {
    packet.add_option(CoapOption::UriQuery, format!("{key}={value}").into_bytes());
}

pub(crate) fn location_path_of(packet: &Packet) -> Vec<String> {
    packet
        .get_option(CoapOption::LocationPath)
        .map(|values| {
            values
                .iter()
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Collects the Uri-Query options into a key/value map.  Registration queries
/// are always of the `key=value` shape; anything else is a bad request.
pub(crate) fn request_queries(packet: &Packet) -> Result<HashMap<String, String>, Lwm2mError> {
    let mut queries = HashMap::new();
    if let Some(values) = packet.get_option(CoapOption::UriQuery) {
        for raw in values {
            let text = str::from_utf8(raw)
                .map_err(|e| Lwm2mError::bad_request(format!("query is not UTF-8: {e}")))?;
            let (key, value) = text
                .split_once('=')
                .ok_or_else(|| Lwm2mError::bad_request("missing '=' in query"))?;
            queries.insert(key.to_string(), value.to_string());
        }
    }
    Ok(queries)
}

/// Reply expected for a Confirmable Empty message, a common way in CoAP to
/// trigger a cheap "ping" to make sure the peer is alive.
pub(crate) fn new_pong_message(packet: &Packet) -> Packet {
    let mut pong = Packet::new();
    pong.header.set_type(MessageType::Reset);
    pong.header.message_id = packet.header.message_id;
    pong.header.code = MessageClass::Empty;
    pong
}
