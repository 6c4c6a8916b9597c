//! The LWM2M TLV binary format.
//!
//! Each record is `type byte | id | length | value`.  The type byte packs the
//! record kind (bits 7-6), an id-is-16-bit flag (bit 5) and the width of the
//! length field (bits 4-3; zero width puts the length in bits 2-0).  Ids and
//! lengths are big-endian.  Container records nest further TLV streams.
//!
//! Decoding is zero-copy: records borrow their content from the input buffer
//! and are reinterpreted on demand through the typed views ([`Tlv::as_int`]
//! and friends), since the format itself does not carry the data type.

use crate::error::Lwm2mError;
use crate::resource::{Resource, ResourceKind, Value};

const ID_16BIT: u8 = 0x20;
const LENGTH_WIDTH_MASK: u8 = 0x18;
const INLINE_LENGTH_MASK: u8 = 0x07;

/// The four record kinds, matching the high two bits of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvKind {
    ObjectInstance,
    ResourceInstance,
    MultipleResources,
    ResourceWithValue,
}

impl TlvKind {
    fn from_type_byte(type_byte: u8) -> Self {
        match type_byte & 0xC0 {
            0x00 => Self::ObjectInstance,
            0x40 => Self::ResourceInstance,
            0x80 => Self::MultipleResources,
            _ => Self::ResourceWithValue,
        }
    }

    fn type_bits(self) -> u8 {
        match self {
            Self::ObjectInstance => 0x00,
            Self::ResourceInstance => 0x40,
            Self::MultipleResources => 0x80,
            Self::ResourceWithValue => 0xC0,
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, Self::ObjectInstance | Self::MultipleResources)
    }
}

/// One decoded record, borrowing its content from the input payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub kind: TlvKind,
    pub id: u16,
    pub content: &'a [u8],
}

/// Decodes a complete TLV stream.  Any malformed byte fails the whole parse
/// with no partial output.
pub fn parse(buf: &[u8]) -> Result<Vec<Tlv<'_>>, Lwm2mError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (record, used) = parse_record(&buf[offset..])?;
        records.push(record);
        offset += used;
    }
    Ok(records)
}

fn parse_record(buf: &[u8]) -> Result<(Tlv<'_>, usize), Lwm2mError> {
    let type_byte = *buf.first().ok_or(Lwm2mError::MalformedTlv("empty record"))?;
    let kind = TlvKind::from_type_byte(type_byte);

    let id_width = if type_byte & ID_16BIT != 0 { 2 } else { 1 };
    if buf.len() < 1 + id_width {
        return Err(Lwm2mError::MalformedTlv("truncated id"));
    }
    let id = if id_width == 2 {
        u16::from_be_bytes([buf[1], buf[2]])
    } else {
        u16::from(buf[1])
    };
    let mut offset = 1 + id_width;

    let length_width = usize::from((type_byte & LENGTH_WIDTH_MASK) >> 3);
    let length = if length_width == 0 {
        usize::from(type_byte & INLINE_LENGTH_MASK)
    } else {
        let raw = buf
            .get(offset..offset + length_width)
            .ok_or(Lwm2mError::MalformedTlv("truncated length"))?;
        offset += length_width;
        raw.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
    };

    let content = buf
        .get(offset..offset + length)
        .ok_or(Lwm2mError::MalformedTlv("truncated value"))?;
    Ok((Tlv { kind, id, content }, offset + length))
}

impl<'a> Tlv<'a> {
    /// Raw content bytes, valid for string and opaque values of any length.
    pub fn bytes(&self) -> &'a [u8] {
        self.content
    }

    /// Re-parses a container's content as a nested TLV stream.
    pub fn children(&self) -> Result<Vec<Tlv<'a>>, Lwm2mError> {
        if !self.kind.is_container() {
            return Err(Lwm2mError::MalformedTlv("not a container record"));
        }
        parse(self.content)
    }

    /// Big-endian two's complement of width 1, 2, 4 or 8.
    pub fn as_int(&self) -> Result<i64, Lwm2mError> {
        match *self.content {
            [a] => Ok(i64::from(a as i8)),
            [a, b] => Ok(i64::from(i16::from_be_bytes([a, b]))),
            [a, b, c, d] => Ok(i64::from(i32::from_be_bytes([a, b, c, d]))),
            [a, b, c, d, e, f, g, h] => Ok(i64::from_be_bytes([a, b, c, d, e, f, g, h])),
            _ => Err(Lwm2mError::MalformedTlv("invalid integer width")),
        }
    }

    /// Unix timestamp; same wire shape as an integer.
    pub fn as_time(&self) -> Result<i64, Lwm2mError> {
        self.as_int()
    }

    /// IEEE-754 big-endian of width 4 or 8.
    pub fn as_float(&self) -> Result<f64, Lwm2mError> {
        match *self.content {
            [a, b, c, d] => Ok(f64::from(f32::from_be_bytes([a, b, c, d]))),
            [a, b, c, d, e, f, g, h] => Ok(f64::from_be_bytes([a, b, c, d, e, f, g, h])),
            _ => Err(Lwm2mError::MalformedTlv("invalid float width")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Lwm2mError> {
        match *self.content {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(Lwm2mError::MalformedTlv("invalid boolean")),
        }
    }

    /// Two big-endian u16s: (object id, instance id).
    pub fn as_obj_link(&self) -> Result<(u16, u16), Lwm2mError> {
        match *self.content {
            [a, b, c, d] => Ok((u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d]))),
            _ => Err(Lwm2mError::MalformedTlv("invalid object link width")),
        }
    }
}

/// Encodes one resource: a `ResourceWithValue` record for a single resource,
/// or a `MultipleResources` container whose children are `ResourceInstance`
/// records with sub-ids equal to their positions.
pub fn encode_resource(resource: &Resource, out: &mut Vec<u8>) -> Result<(), Lwm2mError> {
    match resource.kind() {
        ResourceKind::Single => {
            let mut value = Vec::new();
            encode_value(resource.value(), &mut value);
            encode_record(TlvKind::ResourceWithValue, resource.id(), &value, out)
        }
        ResourceKind::Multiple => {
            let mut children = Vec::new();
            for (sub_id, item) in resource.values().iter().enumerate() {
                let mut value = Vec::new();
                encode_value(item, &mut value);
                encode_record(TlvKind::ResourceInstance, sub_id as u16, &value, &mut children)?;
            }
            encode_record(TlvKind::MultipleResources, resource.id(), &children, out)
        }
    }
}

/// Encodes a flat stream of resource records, the payload shape of
/// instance-level reads and writes.
pub fn encode_resources(resources: &[Resource], out: &mut Vec<u8>) -> Result<(), Lwm2mError> {
    for resource in resources {
        encode_resource(resource, out)?;
    }
    Ok(())
}

/// Wraps an instance's resources in an `ObjectInstance` container, the
/// payload shape of object-level reads.
pub fn encode_instance(
    instance_id: u16,
    resources: &[Resource],
    out: &mut Vec<u8>,
) -> Result<(), Lwm2mError> {
    let mut content = Vec::new();
    encode_resources(resources, &mut content)?;
    encode_record(TlvKind::ObjectInstance, instance_id, &content, out)
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::String(bytes) | Value::Opaque(bytes) => out.extend_from_slice(bytes),
        Value::Int(v) | Value::Time(v) => encode_int(*v, out),
        Value::Float(v) => {
            // Narrow to f32 only when the narrowing is lossless.
            if f64::from(*v as f32) == *v {
                out.extend_from_slice(&(*v as f32).to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::ObjLink(object_id, instance_id) => {
            out.extend_from_slice(&object_id.to_be_bytes());
            out.extend_from_slice(&instance_id.to_be_bytes());
        }
    }
}

fn encode_int(v: i64, out: &mut Vec<u8>) {
    if let Ok(v) = i8::try_from(v) {
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = i16::try_from(v) {
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = i32::try_from(v) {
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.extend_from_slice(&v.to_be_bytes());
    }
}

fn encode_record(
    kind: TlvKind,
    id: u16,
    content: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), Lwm2mError> {
    let mut type_byte = kind.type_bits();
    if id > 0xFF {
        type_byte |= ID_16BIT;
    }
    let length = content.len();
    match length {
        0..=7 => type_byte |= length as u8,
        8..=0xFF => type_byte |= 0x08,
        0x100..=0xFFFF => type_byte |= 0x10,
        0x1_0000..=0xFF_FFFF => type_byte |= 0x18,
        _ => return Err(Lwm2mError::MalformedTlv("value exceeds 24-bit length")),
    }
    out.push(type_byte);
    if id > 0xFF {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }
    match length {
        0..=7 => {}
        8..=0xFF => out.push(length as u8),
        0x100..=0xFFFF => out.extend_from_slice(&(length as u16).to_be_bytes()),
        _ => out.extend_from_slice(&(length as u32).to_be_bytes()[1..]),
    }
    out.extend_from_slice(content);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DataType, Resource, Value};

    fn encoded(resource: &Resource) -> Vec<u8> {
        let mut out = Vec::new();
        encode_resource(resource, &mut out).unwrap();
        out
    }

    #[test]
    fn test_single_int_resource_wire_shape() {
        let out = encoded(&Resource::single(1, Value::Int(-12)));
        assert_eq!(out, [0xC1, 0x01, 0xF4]);

        let records = parse(&out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, TlvKind::ResourceWithValue);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].content, [0xF4]);
        assert_eq!(records[0].as_int().unwrap(), -12);
    }

    #[test]
    fn test_multiple_string_resource_wire_shape() {
        let resource =
            Resource::multiple(5, vec![Value::string("ab"), Value::string("cd")]).unwrap();
        let out = encoded(&resource);

        let records = parse(&out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, TlvKind::MultipleResources);
        assert_eq!(records[0].id, 5);

        let children = records[0].children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].kind, TlvKind::ResourceInstance);
        assert_eq!(children[0].id, 0);
        assert_eq!(children[0].bytes(), b"ab");
        assert_eq!(children[1].id, 1);
        assert_eq!(children[1].bytes(), b"cd");
    }

    #[test]
    fn test_round_trip_all_kinds_and_widths() {
        let kinds = [
            TlvKind::ObjectInstance,
            TlvKind::ResourceInstance,
            TlvKind::MultipleResources,
            TlvKind::ResourceWithValue,
        ];
        // One content size per legal length-field width.
        let sizes = [0usize, 7, 8, 255, 256, 0x1_0000];
        for kind in kinds {
            for id in [0u16, 0xFF, 0x100, 0xFFFF] {
                for size in sizes {
                    let content = vec![0xAB; size];
                    let mut out = Vec::new();
                    encode_record(kind, id, &content, &mut out).unwrap();
                    let records = parse(&out).unwrap();
                    assert_eq!(records.len(), 1);
                    assert_eq!(records[0].kind, kind);
                    assert_eq!(records[0].id, id);
                    assert_eq!(records[0].content, &content[..]);
                }
            }
        }
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let resource = Resource::multiple(
            300,
            vec![Value::opaque([1u8; 120]), Value::opaque([2u8; 200])],
        )
        .unwrap();
        let out = encoded(&resource);
        for cut in 0..out.len() {
            assert!(parse(&out[..cut]).is_err() || cut == 0, "prefix {cut} accepted");
        }
        assert!(parse(&out).is_ok());
    }

    #[test]
    fn test_no_partial_output_on_trailing_garbage() {
        let mut out = encoded(&Resource::single(1, Value::Int(3)));
        out.extend_from_slice(&[0xC8, 0x02]); // header claiming bytes that are not there
        assert!(parse(&out).is_err());
    }

    #[test]
    fn test_int_width_selection_and_round_trip() {
        for (v, width) in [
            (0i64, 1usize),
            (127, 1),
            (-128, 1),
            (128, 2),
            (-32768, 2),
            (32768, 4),
            (i64::from(i32::MAX), 4),
            (i64::from(i32::MAX) + 1, 8),
            (i64::MIN, 8),
            (i64::MAX, 8),
        ] {
            let out = encoded(&Resource::single(9, Value::Int(v)));
            let records = parse(&out).unwrap();
            assert_eq!(records[0].content.len(), width, "value {v}");
            assert_eq!(records[0].as_int().unwrap(), v);
        }
    }

    #[test]
    fn test_int_rejects_odd_widths() {
        let tlv = Tlv {
            kind: TlvKind::ResourceWithValue,
            id: 0,
            content: &[1, 2, 3],
        };
        assert!(tlv.as_int().is_err());
        assert!(tlv.as_time().is_err());
    }

    #[test]
    fn test_float_widths() {
        let out = encoded(&Resource::single(2, Value::Float(1.5)));
        let records = parse(&out).unwrap();
        assert_eq!(records[0].content.len(), 4);
        assert_eq!(records[0].as_float().unwrap(), 1.5);

        let precise = 0.1f64;
        let out = encoded(&Resource::single(2, Value::Float(precise)));
        let records = parse(&out).unwrap();
        assert_eq!(records[0].content.len(), 8);
        assert_eq!(records[0].as_float().unwrap(), precise);

        let tlv = Tlv {
            kind: TlvKind::ResourceWithValue,
            id: 0,
            content: &[0, 1],
        };
        assert!(tlv.as_float().is_err());
    }

    #[test]
    fn test_bool_and_obj_link_views() {
        let out = encoded(&Resource::single(3, Value::Bool(true)));
        assert_eq!(parse(&out).unwrap()[0].as_bool().unwrap(), true);

        let out = encoded(&Resource::single(3, Value::Bool(false)));
        assert_eq!(parse(&out).unwrap()[0].as_bool().unwrap(), false);

        let bad = Tlv {
            kind: TlvKind::ResourceWithValue,
            id: 0,
            content: &[2],
        };
        assert!(bad.as_bool().is_err());

        let out = encoded(&Resource::single(4, Value::ObjLink(0x0102, 0x0304)));
        let records = parse(&out).unwrap();
        assert_eq!(records[0].content, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(records[0].as_obj_link().unwrap(), (0x0102, 0x0304));
    }

    #[test]
    fn test_time_round_trip() {
        let out = encoded(&Resource::single(13, Value::Time(1_456_000_000)));
        assert_eq!(parse(&out).unwrap()[0].as_time().unwrap(), 1_456_000_000);
    }

    #[test]
    fn test_empty_string_is_legal() {
        let out = encoded(&Resource::single(6, Value::string("")));
        let records = parse(&out).unwrap();
        assert_eq!(records[0].bytes(), b"");
    }

    #[test]
    fn test_instance_container_nests() {
        let resources = [
            Resource::single(0, Value::string("dev")),
            Resource::single(1, Value::Int(42)),
        ];
        let mut out = Vec::new();
        encode_instance(0, &resources, &mut out).unwrap();

        let records = parse(&out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, TlvKind::ObjectInstance);
        assert_eq!(records[0].id, 0);
        let children = records[0].children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].bytes(), b"dev");
        assert_eq!(children[1].as_int().unwrap(), 42);
    }

    #[test]
    fn test_children_refused_on_leaf() {
        let out = encoded(&Resource::single(1, Value::Int(1)));
        let records = parse(&out).unwrap();
        assert!(records[0].children().is_err());
    }

    #[test]
    fn test_initializer_round_trips_through_codec() {
        let resource = Resource::multiple(
            7,
            vec![Value::ObjLink(1, 0), Value::ObjLink(3, 0)],
        )
        .unwrap();
        assert_eq!(resource.data_type(), DataType::ObjLink);
        let out = encoded(&resource);
        let children = parse(&out).unwrap()[0].children().unwrap();
        assert_eq!(children[0].as_obj_link().unwrap(), (1, 0));
        assert_eq!(children[1].as_obj_link().unwrap(), (3, 0));
    }
}
