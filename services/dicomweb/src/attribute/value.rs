use super::{AttributeSet, Tag};
use crate::codec::Codec;
use bytes::Bytes;

/// Decoded value of a single attribute.
///
/// A closed set of shapes: every consumer matches exhaustively rather than
/// dispatching on the VR.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    /// Text values, already split on `\` for multi-valued VRs and stripped of
    /// padding.
    Strings(Vec<String>),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Tags(Vec<Tag>),
    Sequence(Vec<AttributeSet>),
    Binary(Bytes),
    /// Encapsulated pixel data: the basic offset table and each fragment.
    Encapsulated(Fragments),
    /// Reference to a payload moved out to bulk storage.
    Bulk(BulkRef),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragments {
    pub offset_table: Vec<u32>,
    pub fragments: Vec<Bytes>,
}

impl Fragments {
    /// Byte length of all fragment payloads.
    pub fn payload_len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }
}

/// Where a bulk payload went and how to read it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRef {
    /// Storage key of the blob, or of the frames directory for pixel data.
    pub uri: String,
    pub codec: Codec,
    pub content_type: String,
    /// Uncompressed byte length (sum over frames for pixel data).
    pub length: u64,
    /// Frame count, set only for pixel data.
    pub frames: Option<u32>,
}

impl Value {
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Empty => true,
            Value::Strings(v) => v.is_empty(),
            Value::Ints(v) => v.is_empty(),
            Value::Floats(v) => v.is_empty(),
            Value::Tags(v) => v.is_empty(),
            Value::Sequence(v) => v.is_empty(),
            Value::Binary(b) => b.is_empty(),
            Value::Encapsulated(f) => f.fragments.is_empty(),
            Value::Bulk(_) => false,
        }
    }

    pub fn first_str(&self) -> Option<&str> {
        match self {
            Value::Strings(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    /// First value as an integer; integer strings (`IS`) are parsed.
    pub fn first_int(&self) -> Option<i64> {
        match self {
            Value::Ints(v) => v.first().copied(),
            Value::Strings(v) => v.first().and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    /// Encoded payload length of a binary-shaped value.
    pub fn binary_len(&self) -> Option<usize> {
        match self {
            Value::Binary(b) => Some(b.len()),
            Value::Encapsulated(f) => Some(f.payload_len()),
            _ => None,
        }
    }
}
