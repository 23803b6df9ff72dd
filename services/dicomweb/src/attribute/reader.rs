//! DICOM Part 10 reader.
//!
//! Walks the file meta group and the dataset into an [`AttributeSet`],
//! validating every value length against its VR. Binary values are sliced
//! out of the input `Bytes` without copying.

use super::{
    dictionary, tags, Attribute, AttributeError, AttributeSet, Fragments, Tag, TransferSyntax,
    Value, Vr, VrCategory,
};
use bytes::{Buf, Bytes};
use tracing::trace;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const MAX_DEPTH: usize = 32;
const TRAILING_PADDING: Tag = Tag(0xFFFC, 0xFFFC);

/// A decoded instance: file meta group, dataset and its transfer syntax.
#[derive(Debug, Clone)]
pub struct ParsedInstance {
    pub meta: AttributeSet,
    pub dataset: AttributeSet,
    pub transfer_syntax: TransferSyntax,
}

/// Decode a Part 10 stream.
///
/// A stream without the preamble and `DICM` marker is read as a bare
/// implicit VR little endian dataset.
pub fn read_part10(data: Bytes) -> Result<ParsedInstance, AttributeError> {
    let has_preamble =
        data.len() >= PREAMBLE_LEN + MAGIC.len() && &data[PREAMBLE_LEN..PREAMBLE_LEN + 4] == MAGIC;

    if !has_preamble {
        let mut cursor = Cursor::new(data, 0, false);
        let dataset = cursor.read_dataset(End::Eof, 0)?;
        return Ok(ParsedInstance {
            meta: AttributeSet::new(),
            dataset,
            transfer_syntax: TransferSyntax::implicit_little_endian(),
        });
    }

    let mut cursor = Cursor::new(data, PREAMBLE_LEN + MAGIC.len(), true);
    let meta = cursor.read_meta()?;
    let uid = meta
        .string(tags::TRANSFER_SYNTAX_UID)
        .filter(|s| !s.is_empty())
        .ok_or(AttributeError::Missing(tags::TRANSFER_SYNTAX_UID))?;
    let transfer_syntax = TransferSyntax::new(uid);
    if !transfer_syntax.is_supported() {
        return Err(AttributeError::UnsupportedTransferSyntax(uid.to_string()));
    }

    cursor.explicit = transfer_syntax.is_explicit_vr();
    let dataset = cursor.read_dataset(End::Eof, 0)?;

    trace!(
        transfer_syntax = %transfer_syntax.uid(),
        attributes = dataset.len(),
        "Decoded Part 10 stream"
    );

    Ok(ParsedInstance {
        meta,
        dataset,
        transfer_syntax,
    })
}

#[derive(Debug, Clone, Copy)]
enum End {
    Eof,
    Offset(usize),
    ItemDelimiter,
}

#[derive(Debug)]
struct Header {
    tag: Tag,
    vr: Vr,
    length: u32,
}

struct Cursor {
    data: Bytes,
    pos: usize,
    explicit: bool,
}

impl Cursor {
    fn new(data: Bytes, pos: usize, explicit: bool) -> Self {
        Self {
            data,
            pos,
            explicit,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn stream_error(&self, reason: impl Into<String>) -> AttributeError {
        AttributeError::Stream {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn take(&mut self, len: usize) -> Result<Bytes, AttributeError> {
        if len > self.remaining() {
            return Err(self.stream_error(format!(
                "need {} bytes, {} remain",
                len,
                self.remaining()
            )));
        }
        let bytes = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(bytes)
    }

    fn read_u16(&mut self) -> Result<u16, AttributeError> {
        Ok(self.take(2)?.get_u16_le())
    }

    fn read_u32(&mut self) -> Result<u32, AttributeError> {
        Ok(self.take(4)?.get_u32_le())
    }

    fn peek_group(&self) -> Option<u16> {
        (self.remaining() >= 2).then(|| u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]))
    }

    /// End offset of a defined-length value starting at the cursor.
    fn bounded_end(&self, length: u32) -> Result<usize, AttributeError> {
        let length = length as usize;
        if length > self.remaining() {
            return Err(self.stream_error(format!(
                "length {} exceeds the {} bytes remaining",
                length,
                self.remaining()
            )));
        }
        Ok(self.pos + length)
    }

    fn read_meta(&mut self) -> Result<AttributeSet, AttributeError> {
        let mut meta = AttributeSet::new();
        while self.peek_group() == Some(0x0002) {
            let header = self.read_header()?;
            let attribute = self.read_value(header, 0)?;
            if !attribute.tag.is_group_length() {
                let (tag, vr) = (attribute.tag, attribute.vr);
                if meta.insert(attribute).is_some() {
                    return Err(malformed(tag, vr, "duplicate data element"));
                }
            }
        }
        Ok(meta)
    }

    fn read_header(&mut self) -> Result<Header, AttributeError> {
        let group = self.read_u16()?;
        let element = self.read_u16()?;
        let tag = Tag(group, element);

        // Item and delimitation tags never carry a VR.
        if group == 0xFFFE {
            let length = self.read_u32()?;
            return Ok(Header {
                tag,
                vr: Vr::UN,
                length,
            });
        }

        if self.explicit {
            let code = self.take(2)?;
            let vr = Vr::from_bytes([code[0], code[1]]).ok_or_else(|| {
                self.stream_error(format!(
                    "unknown VR {:?} for {:?}",
                    String::from_utf8_lossy(&code),
                    tag
                ))
            })?;
            let length = if vr.has_long_header() {
                self.take(2)?;
                self.read_u32()?
            } else {
                u32::from(self.read_u16()?)
            };
            Ok(Header { tag, vr, length })
        } else {
            let length = self.read_u32()?;
            let vr = dictionary::vr_of(tag).unwrap_or(if length == UNDEFINED_LENGTH {
                Vr::SQ
            } else {
                Vr::UN
            });
            Ok(Header { tag, vr, length })
        }
    }

    fn read_dataset(&mut self, end: End, depth: usize) -> Result<AttributeSet, AttributeError> {
        if depth > MAX_DEPTH {
            return Err(self.stream_error("sequence nesting too deep"));
        }
        let mut set = AttributeSet::new();
        loop {
            match end {
                End::Eof if self.remaining() == 0 => break,
                End::Offset(offset) if self.pos == offset => break,
                End::Offset(offset) if self.pos > offset => {
                    return Err(self.stream_error("element overruns its item"));
                }
                End::ItemDelimiter if self.remaining() == 0 => {
                    return Err(self.stream_error("unterminated item"));
                }
                _ => {}
            }

            let header = self.read_header()?;
            if header.tag == tags::ITEM_DELIMITATION {
                if matches!(end, End::ItemDelimiter) {
                    break;
                }
                return Err(self.stream_error("unexpected item delimiter"));
            }
            if header.tag.group() == 0xFFFE {
                return Err(self.stream_error(format!("unexpected {:?} in dataset", header.tag)));
            }

            let attribute = self.read_value(header, depth)?;
            if !attribute.tag.is_group_length() && attribute.tag != TRAILING_PADDING {
                let (tag, vr) = (attribute.tag, attribute.vr);
                if set.insert(attribute).is_some() {
                    return Err(malformed(tag, vr, "duplicate data element"));
                }
            }
        }
        Ok(set)
    }

    fn read_value(&mut self, header: Header, depth: usize) -> Result<Attribute, AttributeError> {
        let Header { tag, vr, length } = header;

        if length == UNDEFINED_LENGTH {
            return match vr {
                Vr::SQ => {
                    let items = self.read_items(None, depth)?;
                    Ok(Attribute::new(tag, Vr::SQ, Value::Sequence(items)))
                }
                // An explicit UN of undefined length is an implicit VR sequence.
                Vr::UN => {
                    let explicit = std::mem::replace(&mut self.explicit, false);
                    let items = self.read_items(None, depth);
                    self.explicit = explicit;
                    Ok(Attribute::new(tag, Vr::SQ, Value::Sequence(items?)))
                }
                Vr::OB | Vr::OW if tag == tags::PIXEL_DATA => {
                    let fragments = self.read_fragments()?;
                    Ok(Attribute::new(tag, vr, Value::Encapsulated(fragments)))
                }
                _ => Err(AttributeError::Malformed {
                    tag,
                    vr: vr.to_string(),
                    reason: "undefined length is not allowed for this VR".to_string(),
                }),
            };
        }

        if vr == Vr::SQ {
            let end = self.bounded_end(length)?;
            let items = self.read_items(Some(end), depth)?;
            return Ok(Attribute::new(tag, vr, Value::Sequence(items)));
        }

        let end = self.bounded_end(length).map_err(|_| AttributeError::Malformed {
            tag,
            vr: vr.to_string(),
            reason: format!(
                "declared length {} exceeds the {} bytes remaining",
                length,
                self.remaining()
            ),
        })?;
        let raw = self.take(end - self.pos)?;
        let value = decode_value(tag, vr, raw)?;
        Ok(Attribute::new(tag, vr, value))
    }

    fn read_items(
        &mut self,
        end: Option<usize>,
        depth: usize,
    ) -> Result<Vec<AttributeSet>, AttributeError> {
        let mut items = Vec::new();
        loop {
            if let Some(end) = end {
                if self.pos == end {
                    break;
                }
                if self.pos > end {
                    return Err(self.stream_error("item overruns its sequence"));
                }
            }

            let header = self.read_header()?;
            match header.tag {
                tags::ITEM if header.length == UNDEFINED_LENGTH => {
                    items.push(self.read_dataset(End::ItemDelimiter, depth + 1)?);
                }
                tags::ITEM => {
                    let item_end = self.bounded_end(header.length)?;
                    items.push(self.read_dataset(End::Offset(item_end), depth + 1)?);
                }
                tags::SEQUENCE_DELIMITATION if end.is_none() => break,
                other => {
                    return Err(self.stream_error(format!("unexpected {:?} in sequence", other)));
                }
            }
        }
        Ok(items)
    }

    fn read_fragments(&mut self) -> Result<Fragments, AttributeError> {
        let header = self.read_header()?;
        if header.tag != tags::ITEM || header.length == UNDEFINED_LENGTH {
            return Err(self.stream_error("encapsulated pixel data must start with an offset table item"));
        }
        if header.length % 4 != 0 {
            return Err(AttributeError::Malformed {
                tag: tags::PIXEL_DATA,
                vr: Vr::OB.to_string(),
                reason: format!("basic offset table length {} is not a multiple of 4", header.length),
            });
        }

        let mut table = self.take(header.length as usize)?;
        let mut offset_table = Vec::with_capacity(table.len() / 4);
        while table.has_remaining() {
            offset_table.push(table.get_u32_le());
        }

        let mut fragments = Vec::new();
        loop {
            let header = self.read_header()?;
            match header.tag {
                tags::ITEM if header.length != UNDEFINED_LENGTH => {
                    fragments.push(self.take(header.length as usize)?);
                }
                tags::SEQUENCE_DELIMITATION => break,
                other => {
                    return Err(self.stream_error(format!("unexpected {:?} among fragments", other)));
                }
            }
        }

        Ok(Fragments {
            offset_table,
            fragments,
        })
    }
}

fn malformed(tag: Tag, vr: Vr, reason: impl Into<String>) -> AttributeError {
    AttributeError::Malformed {
        tag,
        vr: vr.to_string(),
        reason: reason.into(),
    }
}

/// Decode a defined-length primitive value.
fn decode_value(tag: Tag, vr: Vr, raw: Bytes) -> Result<Value, AttributeError> {
    if raw.is_empty() {
        return Ok(Value::Empty);
    }
    let unit = vr.unit_size();
    if raw.len() % unit != 0 {
        return Err(malformed(
            tag,
            vr,
            format!("length {} is not a multiple of {}", raw.len(), unit),
        ));
    }

    let mut buf = raw.clone();
    let value = match vr.category() {
        VrCategory::Binary => Value::Binary(raw),
        VrCategory::Integer => {
            let mut values = Vec::with_capacity(raw.len() / unit);
            while buf.has_remaining() {
                let v = match vr {
                    Vr::US => i64::from(buf.get_u16_le()),
                    Vr::SS => i64::from(buf.get_i16_le()),
                    Vr::UL => i64::from(buf.get_u32_le()),
                    Vr::SL => i64::from(buf.get_i32_le()),
                    Vr::SV => buf.get_i64_le(),
                    _ => i64::try_from(buf.get_u64_le())
                        .map_err(|_| malformed(tag, vr, "value exceeds the signed 64-bit range"))?,
                };
                values.push(v);
            }
            Value::Ints(values)
        }
        VrCategory::Float => {
            let mut values = Vec::with_capacity(raw.len() / unit);
            while buf.has_remaining() {
                values.push(if vr == Vr::FL {
                    f64::from(buf.get_f32_le())
                } else {
                    buf.get_f64_le()
                });
            }
            Value::Floats(values)
        }
        VrCategory::AttributeTag => {
            let mut values = Vec::with_capacity(raw.len() / 4);
            while buf.has_remaining() {
                let group = buf.get_u16_le();
                let element = buf.get_u16_le();
                values.push(Tag(group, element));
            }
            Value::Tags(values)
        }
        VrCategory::Text => decode_text(tag, vr, &raw)?,
        VrCategory::Sequence => {
            return Err(malformed(tag, vr, "sequence reached the primitive decoder"));
        }
    };
    Ok(value)
}

fn decode_text(tag: Tag, vr: Vr, raw: &[u8]) -> Result<Value, AttributeError> {
    // Default repertoire is ASCII; anything that is not UTF-8 is read as Latin-1.
    let text = match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    };

    let pad = |c: char| c == ' ' || c == '\0';
    let values: Vec<String> = if vr.is_single_valued_text() {
        vec![text.trim_end_matches(pad).to_string()]
    } else {
        text.split('\\')
            .map(|s| s.trim_end_matches(pad).trim_start_matches(' ').to_string())
            .collect()
    };

    if values.iter().all(String::is_empty) {
        return Ok(Value::Empty);
    }

    for v in values.iter().filter(|v| !v.is_empty()) {
        let valid = match vr {
            Vr::IS => v.parse::<i64>().is_ok(),
            Vr::DS => v.parse::<f64>().map(f64::is_finite).unwrap_or(false),
            _ => true,
        };
        if !valid {
            return Err(malformed(tag, vr, format!("{:?} is not a valid {}", v, vr)));
        }
    }

    Ok(Value::Strings(values))
}
