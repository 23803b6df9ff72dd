//! Attribute model.
//!
//! Typed data elements, ordered attribute sets, the Part 10 reader and the
//! DICOM JSON encoding of an attribute set.

pub mod dictionary;
pub mod json;
pub mod reader;
mod tag;
mod transfer_syntax;
mod value;
mod vr;

pub use reader::{read_part10, ParsedInstance};
pub use tag::{tags, ParseTagError, Tag, TagPath};
pub use transfer_syntax::TransferSyntax;
pub use value::{BulkRef, Fragments, Value};
pub use vr::{Vr, VrCategory};

use std::collections::BTreeMap;
use thiserror::Error;

/// Input that cannot be decoded into a consistent attribute set.
#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("malformed attribute {tag:?} ({vr}): {reason}")]
    Malformed { tag: Tag, vr: String, reason: String },

    #[error("malformed stream at offset {offset}: {reason}")]
    Stream { offset: usize, reason: String },

    #[error("missing required attribute {0:?}")]
    Missing(Tag),

    #[error("invalid identifier {tag:?}: {value:?}")]
    InvalidIdentifier { tag: Tag, value: String },

    #[error("unsupported transfer syntax {0}")]
    UnsupportedTransferSyntax(String),
}

/// One data element.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub tag: Tag,
    pub vr: Vr,
    pub value: Value,
}

impl Attribute {
    pub fn new(tag: Tag, vr: Vr, value: Value) -> Self {
        Self { tag, vr, value }
    }
}

/// Attributes keyed and iterated in ascending tag order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeSet {
    elements: BTreeMap<Tag, Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any attribute with the same tag.
    pub fn insert(&mut self, attribute: Attribute) -> Option<Attribute> {
        self.elements.insert(attribute.tag, attribute)
    }

    pub fn get(&self, tag: Tag) -> Option<&Attribute> {
        self.elements.get(&tag)
    }

    pub fn get_mut(&mut self, tag: Tag) -> Option<&mut Attribute> {
        self.elements.get_mut(&tag)
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Attribute> {
        self.elements.remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.elements.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Attribute> {
        self.elements.values_mut()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn string(&self, tag: Tag) -> Option<&str> {
        self.get(tag).and_then(|a| a.value.first_str())
    }

    pub fn int(&self, tag: Tag) -> Option<i64> {
        self.get(tag).and_then(|a| a.value.first_int())
    }

    /// The study/series/instance identifiers every stored instance needs.
    pub fn identifiers(&self) -> Result<InstanceIds, AttributeError> {
        Ok(InstanceIds {
            study: self.required_uid(tags::STUDY_INSTANCE_UID)?,
            series: self.required_uid(tags::SERIES_INSTANCE_UID)?,
            instance: self.required_uid(tags::SOP_INSTANCE_UID)?,
        })
    }

    fn required_uid(&self, tag: Tag) -> Result<String, AttributeError> {
        let value = self
            .string(tag)
            .filter(|s| !s.is_empty())
            .ok_or(AttributeError::Missing(tag))?;
        if !is_valid_uid(value) {
            return Err(AttributeError::InvalidIdentifier {
                tag,
                value: value.to_string(),
            });
        }
        Ok(value.to_string())
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut set = AttributeSet::new();
        for attribute in iter {
            set.insert(attribute);
        }
        set
    }
}

/// Identifiers of one instance and its parents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIds {
    pub study: String,
    pub series: String,
    pub instance: String,
}

impl InstanceIds {
    pub fn new(
        study: impl Into<String>,
        series: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            study: study.into(),
            series: series.into(),
            instance: instance.into(),
        }
    }
}

/// Identifiers become path components, so they are restricted to a
/// character set that cannot escape or alias a directory: UID digits and
/// dots, plus the letters, `-` and `_` that real-world generators emit.
/// Fails with `invalid` for the first malformed UID in `uids`.
pub fn check_uids<E>(uids: &[&str], invalid: impl FnOnce(String) -> E) -> Result<(), E> {
    match uids.iter().find(|uid| !is_valid_uid(uid)) {
        Some(uid) => Err(invalid(uid.to_string())),
        None => Ok(()),
    }
}

pub fn is_valid_uid(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && !value.starts_with('.')
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
}
