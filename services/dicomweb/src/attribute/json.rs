//! DICOM JSON model encoding of attribute sets.
//!
//! Keys are the uppercase hex tag, so the default (sorted) `serde_json` map
//! emits attributes in tag order and every encoding is byte-stable.

use super::{Attribute, AttributeSet, BulkRef, Tag, Value, Vr};
use crate::codec::Codec;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonError {
    #[error("invalid DICOM JSON at {key}: {reason}")]
    Invalid { key: String, reason: String },
}

fn invalid(key: impl Into<String>, reason: impl Into<String>) -> JsonError {
    JsonError::Invalid {
        key: key.into(),
        reason: reason.into(),
    }
}

/// Encode an attribute set as a DICOM JSON object.
pub fn to_json(set: &AttributeSet) -> JsonValue {
    let mut object = Map::new();
    for attribute in set.iter() {
        object.insert(attribute.tag.to_string(), attribute_to_json(attribute));
    }
    JsonValue::Object(object)
}

pub fn attribute_to_json(attribute: &Attribute) -> JsonValue {
    let mut element = Map::new();
    element.insert("vr".into(), JsonValue::from(attribute.vr.as_str()));

    match &attribute.value {
        Value::Empty => {}
        Value::Strings(values) => {
            let values = values
                .iter()
                .map(|s| string_to_json(attribute.vr, s))
                .collect();
            element.insert("Value".into(), JsonValue::Array(values));
        }
        Value::Ints(values) => {
            element.insert("Value".into(), json!(values));
        }
        Value::Floats(values) => {
            let values = values.iter().map(|f| float_to_json(*f)).collect();
            element.insert("Value".into(), JsonValue::Array(values));
        }
        Value::Tags(values) => {
            let values = values.iter().map(|t| JsonValue::from(t.to_string())).collect();
            element.insert("Value".into(), JsonValue::Array(values));
        }
        Value::Sequence(items) => {
            element.insert("Value".into(), items.iter().map(to_json).collect());
        }
        Value::Binary(bytes) => {
            element.insert("InlineBinary".into(), JsonValue::from(STANDARD.encode(bytes)));
        }
        Value::Encapsulated(fragments) => {
            let joined: Vec<u8> = fragments.fragments.iter().flat_map(|f| f.iter().copied()).collect();
            element.insert("InlineBinary".into(), JsonValue::from(STANDARD.encode(joined)));
        }
        Value::Bulk(bulk) => bulk_ref_into(bulk, &mut element),
    }

    JsonValue::Object(element)
}

fn string_to_json(vr: Vr, s: &str) -> JsonValue {
    if s.is_empty() {
        return JsonValue::Null;
    }
    match vr {
        Vr::PN => json!({ "Alphabetic": s }),
        Vr::IS => s.parse::<i64>().map(JsonValue::from).unwrap_or_else(|_| s.into()),
        Vr::DS => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or_else(|| s.into()),
        _ => JsonValue::from(s),
    }
}

fn float_to_json(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn bulk_ref_into(bulk: &BulkRef, element: &mut Map<String, JsonValue>) {
    element.insert("BulkDataURI".into(), JsonValue::from(bulk.uri.as_str()));
    element.insert("codec".into(), JsonValue::from(bulk.codec.as_str()));
    element.insert("contentType".into(), JsonValue::from(bulk.content_type.as_str()));
    element.insert("length".into(), JsonValue::from(bulk.length));
    if let Some(frames) = bulk.frames {
        element.insert("frames".into(), JsonValue::from(frames));
    }
}

/// Read the bulk locator members of one JSON element, if it has any.
pub fn bulk_ref_from_json(element: &JsonValue) -> Option<BulkRef> {
    let uri = element.get("BulkDataURI")?.as_str()?;
    let codec: Codec = element.get("codec")?.as_str()?.parse().ok()?;
    Some(BulkRef {
        uri: uri.to_string(),
        codec,
        content_type: element
            .get("contentType")
            .and_then(JsonValue::as_str)
            .unwrap_or("application/octet-stream")
            .to_string(),
        length: element.get("length").and_then(JsonValue::as_u64).unwrap_or(0),
        frames: element
            .get("frames")
            .and_then(JsonValue::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
    })
}

/// Decode a DICOM JSON object back into an attribute set.
pub fn from_json(doc: &JsonValue) -> Result<AttributeSet, JsonError> {
    let object = doc
        .as_object()
        .ok_or_else(|| invalid("$", "expected an object"))?;

    let mut set = AttributeSet::new();
    for (key, element) in object {
        let tag: Tag = key.parse().map_err(|_| invalid(key, "key is not a tag"))?;
        let vr: Vr = element
            .get("vr")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid(key, "missing vr"))?
            .parse()
            .map_err(|vr| invalid(key, format!("unknown vr {}", vr)))?;
        let value = value_from_json(key, vr, element)?;
        set.insert(Attribute::new(tag, vr, value));
    }
    Ok(set)
}

fn value_from_json(key: &str, vr: Vr, element: &JsonValue) -> Result<Value, JsonError> {
    if let Some(bulk) = bulk_ref_from_json(element) {
        return Ok(Value::Bulk(bulk));
    }
    if let Some(inline) = element.get("InlineBinary") {
        let encoded = inline
            .as_str()
            .ok_or_else(|| invalid(key, "InlineBinary is not a string"))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| invalid(key, e.to_string()))?;
        return Ok(Value::Binary(Bytes::from(bytes)));
    }

    let values = match element.get("Value") {
        None => return Ok(Value::Empty),
        Some(JsonValue::Array(values)) => values,
        Some(_) => return Err(invalid(key, "Value is not an array")),
    };
    if values.is_empty() {
        return Ok(Value::Empty);
    }

    let value = match vr {
        Vr::SQ => Value::Sequence(values.iter().map(from_json).collect::<Result<_, _>>()?),
        Vr::AT => Value::Tags(
            values
                .iter()
                .map(|v| v.as_str().and_then(|s| s.parse().ok()))
                .collect::<Option<_>>()
                .ok_or_else(|| invalid(key, "AT values must be hex tags"))?,
        ),
        Vr::US | Vr::SS | Vr::UL | Vr::SL | Vr::SV | Vr::UV => Value::Ints(
            values
                .iter()
                .map(JsonValue::as_i64)
                .collect::<Option<_>>()
                .ok_or_else(|| invalid(key, "expected integers"))?,
        ),
        Vr::FL | Vr::FD => Value::Floats(
            values
                .iter()
                .map(|v| if v.is_null() { Some(f64::NAN) } else { v.as_f64() })
                .collect::<Option<_>>()
                .ok_or_else(|| invalid(key, "expected numbers"))?,
        ),
        _ => Value::Strings(values.iter().map(json_to_string).collect()),
    };
    Ok(value)
}

/// Text rendering of one JSON value: person names use their alphabetic
/// group, numbers their JSON form, null the empty string.
pub fn json_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Object(o) => o
            .get("Alphabetic")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        other => other.to_string(),
    }
}

/// All values of `tag` in a DICOM JSON object, rendered as text.
pub fn element_strings(doc: &JsonValue, tag: Tag) -> Vec<String> {
    doc.get(tag.to_string())
        .and_then(|e| e.get("Value"))
        .and_then(JsonValue::as_array)
        .map(|values| values.iter().map(json_to_string).collect())
        .unwrap_or_default()
}

/// First value of `tag` in a DICOM JSON object, rendered as text.
pub fn element_string(doc: &JsonValue, tag: Tag) -> Option<String> {
    element_strings(doc, tag).into_iter().next().filter(|s| !s.is_empty())
}
