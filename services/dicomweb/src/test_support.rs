//! Test fixtures: a small Part 10 writer and a fault-injecting store.

use crate::attribute::{tags, Tag, Vr};
use crate::store::{MemoryStore, ObjectStore, ObjectStoreError, ObjectVersion, StoredObject};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const EXPLICIT_LE: &str = "1.2.840.10008.1.2.1";
const IMPLICIT_LE: &str = "1.2.840.10008.1.2";
const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

#[derive(Debug, Clone)]
enum Payload {
    Bytes(Vec<u8>),
    Sequence { items: Vec<InstanceBuilder>, defined: bool },
    Fragments { fragments: Vec<Vec<u8>>, offset_table: bool },
}

/// Builds Part 10 streams (or bare items) element by element.
#[derive(Debug, Clone, Default)]
pub struct InstanceBuilder {
    elements: BTreeMap<Tag, (Vr, Payload)>,
    transfer_syntax: Option<String>,
    implicit: bool,
}

impl InstanceBuilder {
    pub fn new(study: &str, series: &str, instance: &str) -> Self {
        Self::default()
            .text(tags::SOP_CLASS_UID, Vr::UI, SECONDARY_CAPTURE)
            .text(tags::SOP_INSTANCE_UID, Vr::UI, instance)
            .text(tags::STUDY_INSTANCE_UID, Vr::UI, study)
            .text(tags::SERIES_INSTANCE_UID, Vr::UI, series)
    }

    /// A sequence item.
    pub fn item() -> Self {
        Self::default()
    }

    pub fn implicit(mut self) -> Self {
        self.implicit = true;
        self.transfer_syntax = Some(IMPLICIT_LE.to_string());
        self
    }

    pub fn transfer_syntax(mut self, uid: &str) -> Self {
        self.transfer_syntax = Some(uid.to_string());
        self
    }

    pub fn text(self, tag: Tag, vr: Vr, value: &str) -> Self {
        let pad = if vr == Vr::UI { 0u8 } else { b' ' };
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 == 1 {
            bytes.push(pad);
        }
        self.raw_element(tag, vr, bytes)
    }

    pub fn us(self, tag: Tag, value: u16) -> Self {
        self.raw_element(tag, Vr::US, value.to_le_bytes().to_vec())
    }

    pub fn binary(self, tag: Tag, vr: Vr, value: Vec<u8>) -> Self {
        self.raw_element(tag, vr, value)
    }

    /// An element whose bytes are written exactly as given.
    pub fn raw_element(mut self, tag: Tag, vr: Vr, value: Vec<u8>) -> Self {
        self.elements.insert(tag, (vr, Payload::Bytes(value)));
        self
    }

    pub fn sequence(mut self, tag: Tag, items: Vec<InstanceBuilder>) -> Self {
        self.elements
            .insert(tag, (Vr::SQ, Payload::Sequence { items, defined: true }));
        self
    }

    pub fn undefined_sequence(mut self, tag: Tag, items: Vec<InstanceBuilder>) -> Self {
        self.elements
            .insert(tag, (Vr::SQ, Payload::Sequence { items, defined: false }));
        self
    }

    /// Native pixel data of `frames` monochrome frames with a recognisable
    /// byte pattern.
    pub fn native_pixels(self, rows: u16, columns: u16, bits: u16, frames: u32) -> Self {
        let len = rows as usize * columns as usize * (bits as usize / 8) * frames as usize;
        let pixels: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        self.us(tags::SAMPLES_PER_PIXEL, 1)
            .text(tags::PHOTOMETRIC_INTERPRETATION, Vr::CS, "MONOCHROME2")
            .text(tags::NUMBER_OF_FRAMES, Vr::IS, &frames.to_string())
            .us(tags::ROWS, rows)
            .us(tags::COLUMNS, columns)
            .us(tags::BITS_ALLOCATED, bits)
            .us(tags::BITS_STORED, bits)
            .us(tags::HIGH_BIT, bits - 1)
            .us(tags::PIXEL_REPRESENTATION, 0)
            .raw_element(tags::PIXEL_DATA, if bits > 8 { Vr::OW } else { Vr::OB }, pixels)
    }

    /// Encapsulated pixel data, one fragment per entry; with
    /// `offset_table` the Basic Offset Table points at every fragment.
    pub fn encapsulated_pixels(mut self, fragments: Vec<Vec<u8>>, offset_table: bool) -> Self {
        self.elements.insert(
            tags::PIXEL_DATA,
            (
                Vr::OB,
                Payload::Fragments {
                    fragments,
                    offset_table,
                },
            ),
        );
        self
    }

    /// Preamble, file meta group and dataset.
    pub fn build(&self) -> Bytes {
        let transfer_syntax = self.transfer_syntax.as_deref().unwrap_or(EXPLICIT_LE);
        let sop_class = self.text_of(tags::SOP_CLASS_UID).unwrap_or_default();
        let sop_instance = self.text_of(tags::SOP_INSTANCE_UID).unwrap_or_default();

        let meta = InstanceBuilder::item()
            .binary(Tag(0x0002, 0x0001), Vr::OB, vec![0, 1])
            .text(Tag(0x0002, 0x0002), Vr::UI, &sop_class)
            .text(Tag(0x0002, 0x0003), Vr::UI, &sop_instance)
            .text(tags::TRANSFER_SYNTAX_UID, Vr::UI, transfer_syntax);
        let mut meta_bytes = BytesMut::new();
        meta.encode_into(&mut meta_bytes, true);

        let mut out = BytesMut::new();
        out.put_bytes(0, 128);
        out.put_slice(b"DICM");
        write_header(&mut out, Tag(0x0002, 0x0000), Vr::UL, 4, true);
        out.put_u32_le(meta_bytes.len() as u32);
        out.put_slice(&meta_bytes);
        self.encode_into(&mut out, !self.implicit);
        out.freeze()
    }

    fn text_of(&self, tag: Tag) -> Option<String> {
        match self.elements.get(&tag) {
            Some((_, Payload::Bytes(bytes))) => Some(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches(['\0', ' '])
                    .to_string(),
            ),
            _ => None,
        }
    }

    fn encode_into(&self, out: &mut BytesMut, explicit: bool) {
        for (tag, (vr, payload)) in &self.elements {
            match payload {
                Payload::Bytes(bytes) => {
                    write_header(out, *tag, *vr, bytes.len() as u32, explicit);
                    out.put_slice(bytes);
                }
                Payload::Sequence { items, defined } => {
                    let mut body = BytesMut::new();
                    for item in items {
                        let mut item_body = BytesMut::new();
                        item.encode_into(&mut item_body, explicit);
                        body.put_u16_le(0xFFFE);
                        body.put_u16_le(0xE000);
                        if *defined {
                            body.put_u32_le(item_body.len() as u32);
                            body.put_slice(&item_body);
                        } else {
                            body.put_u32_le(0xFFFF_FFFF);
                            body.put_slice(&item_body);
                            body.put_u16_le(0xFFFE);
                            body.put_u16_le(0xE00D);
                            body.put_u32_le(0);
                        }
                    }
                    if *defined {
                        write_header(out, *tag, Vr::SQ, body.len() as u32, explicit);
                        out.put_slice(&body);
                    } else {
                        write_header(out, *tag, Vr::SQ, 0xFFFF_FFFF, explicit);
                        out.put_slice(&body);
                        out.put_u16_le(0xFFFE);
                        out.put_u16_le(0xE0DD);
                        out.put_u32_le(0);
                    }
                }
                Payload::Fragments {
                    fragments,
                    offset_table,
                } => {
                    write_header(out, *tag, *vr, 0xFFFF_FFFF, explicit);
                    let mut table = BytesMut::new();
                    if *offset_table {
                        let mut offset = 0u32;
                        for fragment in fragments {
                            table.put_u32_le(offset);
                            offset += 8 + fragment.len() as u32;
                        }
                    }
                    write_item(out, &table);
                    for fragment in fragments {
                        write_item(out, fragment);
                    }
                    out.put_u16_le(0xFFFE);
                    out.put_u16_le(0xE0DD);
                    out.put_u32_le(0);
                }
            }
        }
    }
}

fn write_item(out: &mut BytesMut, body: &[u8]) {
    out.put_u16_le(0xFFFE);
    out.put_u16_le(0xE000);
    out.put_u32_le(body.len() as u32);
    out.put_slice(body);
}

fn write_header(out: &mut BytesMut, tag: Tag, vr: Vr, length: u32, explicit: bool) {
    out.put_u16_le(tag.group());
    out.put_u16_le(tag.element());
    if !explicit {
        out.put_u32_le(length);
        return;
    }
    out.put_slice(vr.as_str().as_bytes());
    if vr.has_long_header() {
        out.put_u16_le(0);
        out.put_u32_le(length);
    } else {
        out.put_u16_le(length as u16);
    }
}

/// Wraps a [`MemoryStore`], failing a set number of upcoming calls.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    conflicts: AtomicU32,
    put_failures: AtomicU32,
    put_if_failures: Mutex<Option<(String, u32)>>,
    pub put_if_calls: AtomicU32,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(0),
            put_failures: AtomicU32::new(0),
            put_if_failures: Mutex::new(None),
            put_if_calls: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// The next `n` compare-and-swap writes report a conflict.
    pub fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` plain puts fail with an I/O error.
    pub fn fail_next_puts(&self, n: u32) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` compare-and-swap writes to `key` fail with an I/O error.
    pub fn fail_next_put_ifs_on(&self, key: &str, n: u32) {
        *self.put_if_failures.lock() = Some((key.to_string(), n));
    }

    fn take_put_if_failure(&self, key: &str) -> bool {
        match self.put_if_failures.lock().as_mut() {
            Some((target, remaining)) if target == key && *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, ObjectStoreError> {
        if Self::take(&self.put_failures) {
            return Err(injected(key));
        }
        self.inner.put(key, bytes).await
    }

    async fn put_if(
        &self,
        key: &str,
        bytes: Bytes,
        expected: Option<&ObjectVersion>,
    ) -> Result<ObjectVersion, ObjectStoreError> {
        self.put_if_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_put_if_failure(key) {
            return Err(injected(key));
        }
        if Self::take(&self.conflicts) {
            return Err(ObjectStoreError::Conflict {
                key: key.to_string(),
            });
        }
        self.inner.put_if(key, bytes, expected).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.inner.delete(key).await
    }
}

fn injected(key: &str) -> ObjectStoreError {
    ObjectStoreError::Io {
        key: key.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
    }
}
