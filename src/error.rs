use coap_lite::error::HandlingError;
use coap_lite::ResponseType;
use thiserror::Error;

/// Protocol-level error for LWM2M operations.  Every variant carries a fixed
/// mapping to a CoAP response code so that handler code can use Rust's `?`
/// operator naturally without violating the protocol by failing to respond.
#[derive(Debug, Clone, Error)]
pub enum Lwm2mError {
    /// Malformed path, query or payload (CoAP 4.00).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Reserved; no access control in this profile (CoAP 4.01).
    #[error("unauthorized")]
    Unauthorized,

    /// Unknown object, instance or resource (CoAP 4.04).
    #[error("not found")]
    NotFound,

    /// The target object descriptor does not support the operation (CoAP 4.05).
    #[error("method not allowed")]
    MethodNotAllowed,

    /// JSON or an unrecognized Content-Format was requested (CoAP 4.15).
    #[error("unsupported content format")]
    UnsupportedContentFormat,

    /// The payload could not be parsed as TLV (CoAP 4.00).
    #[error("malformed TLV: {0}")]
    MalformedTlv(&'static str),

    /// Unexpected failure inside a callback or this crate (CoAP 5.00).
    #[error("internal error: {0}")]
    Internal(String),

    /// A binding mode other than "U" was requested (CoAP 5.01).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The target client vanished from the directory (CoAP 5.03).
    #[error("cancelled: target client is gone")]
    Cancelled,
}

impl Lwm2mError {
    pub fn bad_request(msg: impl ToString) -> Self {
        Self::BadRequest(msg.to_string())
    }

    pub fn internal(msg: impl ToString) -> Self {
        Self::Internal(msg.to_string())
    }

    /// The CoAP response code this error surfaces as on the wire.
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::BadRequest(_) | Self::MalformedTlv(_) => ResponseType::BadRequest,
            Self::Unauthorized => ResponseType::Unauthorized,
            Self::NotFound => ResponseType::NotFound,
            Self::MethodNotAllowed => ResponseType::MethodNotAllowed,
            Self::UnsupportedContentFormat => ResponseType::UnsupportedContentFormat,
            Self::Internal(_) => ResponseType::InternalServerError,
            Self::NotImplemented(_) => ResponseType::NotImplemented,
            Self::Cancelled => ResponseType::ServiceUnavailable,
        }
    }

    pub(crate) fn into_handling_error(self) -> HandlingError {
        HandlingError {
            code: Some(self.response_type()),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_mapping() {
        let cases = [
            (Lwm2mError::bad_request("x"), ResponseType::BadRequest),
            (Lwm2mError::MalformedTlv("x"), ResponseType::BadRequest),
            (Lwm2mError::Unauthorized, ResponseType::Unauthorized),
            (Lwm2mError::NotFound, ResponseType::NotFound),
            (Lwm2mError::MethodNotAllowed, ResponseType::MethodNotAllowed),
            (
                Lwm2mError::UnsupportedContentFormat,
                ResponseType::UnsupportedContentFormat,
            ),
            (
                Lwm2mError::internal("x"),
                ResponseType::InternalServerError,
            ),
            (
                Lwm2mError::NotImplemented("UQ".into()),
                ResponseType::NotImplemented,
            ),
            (Lwm2mError::Cancelled, ResponseType::ServiceUnavailable),
        ];
        for (err, code) in cases {
            assert_eq!(err.response_type(), code);
        }
    }
}
