//! In-memory representation of a resource value.
//!
//! The C-style variadic initializer of the source protocol is re-expressed as
//! tagged-value constructors: [`Resource::single`] and [`Resource::multiple`].
//! String and opaque payloads are copied into [`Bytes`] storage owned by the
//! resource, so the caller's buffer need not outlive it.

use bytes::Bytes;

use crate::error::Lwm2mError;

/// Data type of a resource value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
    Opaque,
    Time,
    ObjLink,
    /// Unspecified; never produced by the constructors and not encodable.
    None,
}

/// One typed scalar held by a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    Int(i64),
    Float(f64),
    Bool(bool),
    Opaque(Bytes),
    Time(i64),
    ObjLink(u16, u16),
}

impl Value {
    /// Copies `text` into owned storage.
    pub fn string(text: impl AsRef<str>) -> Self {
        Self::String(Bytes::copy_from_slice(text.as_ref().as_bytes()))
    }

    /// Copies `bytes` into owned storage.
    pub fn opaque(bytes: impl AsRef<[u8]>) -> Self {
        Self::Opaque(Bytes::copy_from_slice(bytes.as_ref()))
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::String(_) => DataType::String,
            Self::Int(_) => DataType::Int,
            Self::Float(_) => DataType::Float,
            Self::Bool(_) => DataType::Bool,
            Self::Opaque(_) => DataType::Opaque,
            Self::Time(_) => DataType::Time,
            Self::ObjLink(_, _) => DataType::ObjLink,
        }
    }
}

/// Whether a resource holds one scalar or an array of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Single,
    Multiple,
}

/// A resource and its current value(s).
///
/// A `Single` resource holds exactly one scalar.  A `Multiple` resource holds
/// N scalars whose implicit sub-ids are their positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    id: u16,
    kind: ResourceKind,
    data_type: DataType,
    values: Vec<Value>,
}

impl Resource {
    pub fn single(id: u16, value: Value) -> Self {
        Self {
            id,
            kind: ResourceKind::Single,
            data_type: value.data_type(),
            values: vec![value],
        }
    }

    /// Builds a `Multiple` resource.  All values must share one data type and
    /// at least one value must be present.
    pub fn multiple(id: u16, values: Vec<Value>) -> Result<Self, Lwm2mError> {
        let data_type = values
            .first()
            .map(Value::data_type)
            .ok_or_else(|| Lwm2mError::bad_request("multiple resource with no values"))?;
        if values.iter().any(|v| v.data_type() != data_type) {
            return Err(Lwm2mError::bad_request(
                "multiple resource with mixed data types",
            ));
        }
        Ok(Self {
            id,
            kind: ResourceKind::Multiple,
            data_type,
            values,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The scalar of a `Single` resource, or the first of a `Multiple`.
    pub fn value(&self) -> &Value {
        &self.values[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_takes_type_from_value() {
        let res = Resource::single(5, Value::Int(-12));
        assert_eq!(res.id(), 5);
        assert_eq!(res.kind(), ResourceKind::Single);
        assert_eq!(res.data_type(), DataType::Int);
        assert_eq!(res.values().len(), 1);
    }

    #[test]
    fn test_multiple_rejects_empty() {
        assert!(Resource::multiple(5, vec![]).is_err());
    }

    #[test]
    fn test_multiple_rejects_mixed_types() {
        let values = vec![Value::Int(1), Value::Bool(true)];
        assert!(Resource::multiple(5, values).is_err());
    }

    #[test]
    fn test_string_storage_is_owned() {
        let text = String::from("ab");
        let value = Value::string(&text);
        drop(text);
        assert_eq!(value, Value::String(Bytes::from_static(b"ab")));
    }
}
