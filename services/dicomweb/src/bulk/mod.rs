//! Bulk data splitter.
//!
//! Moves large binary values and every pixel data frame out of an attribute
//! set into individually addressable, compressed bulk items, leaving a
//! [`BulkRef`] locator in place of each value.

pub mod frames;

use crate::attribute::{
    tags, AttributeSet, BulkRef, Fragments, InstanceIds, TagPath, TransferSyntax, Value, VrCategory,
};
use crate::codec::{Codec, CodecError};
use crate::layout::{self, BulkLocator};
use bytes::Bytes;
use frames::{encapsulated_frames, extended_offsets, frame_count, native_frames, FrameGeometry};
use thiserror::Error;
use tracing::debug;

pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("cannot determine frame boundaries: {0}")]
    FrameBoundary(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One extracted payload, already encoded with its locator's codec.
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub locator: BulkLocator,
    pub data: Bytes,
    pub content_type: String,
    /// Decoded length.
    pub length: u64,
}

impl BulkItem {
    pub fn key(&self) -> String {
        self.locator.key()
    }
}

/// An attribute set with its bulk values moved out.
#[derive(Debug, Clone)]
pub struct SplitInstance {
    pub inline: AttributeSet,
    /// In tag order; frames in frame order.
    pub items: Vec<BulkItem>,
    pub frames: u32,
}

#[derive(Debug, Clone)]
pub struct BulkSplitter {
    threshold: usize,
}

impl BulkSplitter {
    /// Binary values strictly longer than `threshold` bytes become bulk.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn split(
        &self,
        ids: &InstanceIds,
        mut dataset: AttributeSet,
        transfer_syntax: &TransferSyntax,
    ) -> Result<SplitInstance, SplitError> {
        let pixel = if dataset.contains(tags::PIXEL_DATA) {
            Some(PixelContext::new(&dataset, transfer_syntax)?)
        } else {
            None
        };
        // Offsets into the original encoding mean nothing once frames are stored apart.
        dataset.remove(tags::EXTENDED_OFFSET_TABLE);
        dataset.remove(tags::EXTENDED_OFFSET_TABLE_LENGTHS);

        let mut walk = Walk {
            threshold: self.threshold,
            ids,
            pixel,
            items: Vec::new(),
            frames: 0,
        };
        walk.set(&mut dataset, None)?;

        debug!(
            instance_uid = %ids.instance,
            items = walk.items.len(),
            frames = walk.frames,
            "Split bulk data"
        );

        Ok(SplitInstance {
            inline: dataset,
            items: walk.items,
            frames: walk.frames,
        })
    }
}

struct PixelContext {
    geometry: Option<FrameGeometry>,
    frames: u32,
    extended: Option<Vec<u64>>,
    content_type: &'static str,
}

impl PixelContext {
    fn new(set: &AttributeSet, transfer_syntax: &TransferSyntax) -> Result<Self, SplitError> {
        let encapsulated = matches!(
            set.get(tags::PIXEL_DATA).map(|a| &a.value),
            Some(Value::Encapsulated(_))
        );
        Ok(Self {
            geometry: match set.get(tags::PIXEL_DATA).map(|a| &a.value) {
                Some(Value::Binary(_)) => Some(FrameGeometry::from_attributes(set)?),
                _ => None,
            },
            frames: frame_count(set)?,
            extended: extended_offsets(set),
            content_type: if encapsulated {
                transfer_syntax.frame_content_type()
            } else {
                OCTET_STREAM
            },
        })
    }
}

struct Walk<'a> {
    threshold: usize,
    ids: &'a InstanceIds,
    pixel: Option<PixelContext>,
    items: Vec<BulkItem>,
    frames: u32,
}

impl Walk<'_> {
    fn set(&mut self, set: &mut AttributeSet, parent: Option<(&TagPath, usize)>) -> Result<(), SplitError> {
        for attribute in set.iter_mut() {
            let path = match parent {
                None => TagPath::new(attribute.tag),
                Some((sequence, item)) => sequence.child(item, attribute.tag),
            };

            if let Value::Sequence(items) = &mut attribute.value {
                for (index, item) in items.iter_mut().enumerate() {
                    self.set(item, Some((&path, index)))?;
                }
                continue;
            }

            let replacement = match &attribute.value {
                Value::Binary(_) | Value::Encapsulated(_)
                    if parent.is_none() && attribute.tag == tags::PIXEL_DATA =>
                {
                    Some(self.frames(&attribute.value)?)
                }
                Value::Binary(data)
                    if attribute.vr.category() == VrCategory::Binary && data.len() > self.threshold =>
                {
                    Some(self.attribute(path, data)?)
                }
                // Encapsulated pixel data nested in an item (icon images).
                Value::Encapsulated(fragments) if fragments.payload_len() > self.threshold => {
                    Some(self.attribute(path, &join(fragments))?)
                }
                _ => None,
            };

            if let Some(bulk) = replacement {
                attribute.value = Value::Bulk(bulk);
            }
        }
        Ok(())
    }

    fn attribute(&mut self, path: TagPath, data: &Bytes) -> Result<BulkRef, SplitError> {
        let locator = BulkLocator::Attribute {
            study: self.ids.study.clone(),
            instance: self.ids.instance.clone(),
            path,
            codec: Codec::Zstd,
        };
        let bulk = BulkRef {
            uri: locator.key(),
            codec: Codec::Zstd,
            content_type: OCTET_STREAM.to_string(),
            length: data.len() as u64,
            frames: None,
        };
        self.items.push(BulkItem {
            data: Codec::Zstd.compress(data)?,
            locator,
            content_type: OCTET_STREAM.to_string(),
            length: data.len() as u64,
        });
        Ok(bulk)
    }

    fn frames(&mut self, value: &Value) -> Result<BulkRef, SplitError> {
        let pixel = self
            .pixel
            .as_ref()
            .ok_or_else(|| SplitError::FrameBoundary("pixel data context missing".into()))?;

        let (frames, codec) = match (value, &pixel.geometry) {
            (Value::Binary(data), Some(geometry)) => (native_frames(data, geometry)?, Codec::Lz4),
            (Value::Encapsulated(fragments), _) => (
                encapsulated_frames(fragments, pixel.frames, pixel.extended.as_deref())?,
                Codec::Identity,
            ),
            _ => return Err(SplitError::FrameBoundary("unsupported pixel data value".into())),
        };
        let content_type = pixel.content_type.to_string();

        let mut length = 0u64;
        for (index, frame) in frames.iter().enumerate() {
            let locator = BulkLocator::Frame {
                ids: self.ids.clone(),
                number: index as u32 + 1,
                codec,
            };
            length += frame.len() as u64;
            self.items.push(BulkItem {
                data: match codec {
                    // Already compressed by the transfer syntax.
                    Codec::Identity => frame.clone(),
                    _ => codec.compress(frame)?,
                },
                locator,
                content_type: content_type.clone(),
                length: frame.len() as u64,
            });
        }
        self.frames = frames.len() as u32;

        Ok(BulkRef {
            uri: layout::frames_dir(self.ids),
            codec,
            content_type,
            length,
            frames: Some(self.frames),
        })
    }
}

fn join(fragments: &Fragments) -> Bytes {
    fragments
        .fragments
        .iter()
        .flat_map(|f| f.iter().copied())
        .collect::<Vec<u8>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{read_part10, Tag, Vr};
    use crate::test_support::InstanceBuilder;

    fn ids() -> InstanceIds {
        InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.5")
    }

    fn split(builder: InstanceBuilder, threshold: usize) -> SplitInstance {
        let parsed = read_part10(builder.build()).unwrap();
        BulkSplitter::new(threshold)
            .split(&ids(), parsed.dataset, &parsed.transfer_syntax)
            .unwrap()
    }

    #[test]
    fn test_four_frames_and_large_un_attribute() {
        let un = vec![0xAB; 50 * 1024];
        let result = split(
            InstanceBuilder::new("1.2.3", "1.2.3.4", "1.2.3.4.5")
                .binary(Tag(0x0009, 0x1001), Vr::UN, un.clone())
                .native_pixels(8, 8, 16, 4),
            1024,
        );

        assert_eq!(result.frames, 4);
        assert_eq!(result.items.len(), 5);
        let frames: Vec<_> = result.items.iter().filter(|i| i.locator.data_type() == "frame").collect();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.locator.codec() == Codec::Lz4 && f.length == 128));

        let un_item = &result.items[0];
        assert_eq!(un_item.key(), "studies/1.2.3/bulkdata/1.2.3.4.5/00091001.zst");
        assert_eq!(Codec::Zstd.decompress(&un_item.data).unwrap().as_ref(), un.as_slice());

        match &result.inline.get(tags::PIXEL_DATA).unwrap().value {
            Value::Bulk(bulk) => {
                assert_eq!(bulk.frames, Some(4));
                assert_eq!(bulk.length, 512);
                assert_eq!(bulk.uri, "studies/1.2.3/series/1.2.3.4/instances/1.2.3.4.5/frames");
            }
            other => panic!("expected bulk reference, got {:?}", other),
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let result = split(
            InstanceBuilder::new("1.2.3", "1.2.3.4", "1.2.3.4.5")
                .binary(Tag(0x0009, 0x1001), Vr::OB, vec![1; 1024])
                .binary(Tag(0x0009, 0x1002), Vr::OB, vec![1; 1026]),
            1024,
        );

        assert!(matches!(result.inline.get(Tag(0x0009, 0x1001)).unwrap().value, Value::Binary(_)));
        assert!(matches!(result.inline.get(Tag(0x0009, 0x1002)).unwrap().value, Value::Bulk(_)));
    }

    #[test]
    fn test_nested_bulk_uses_tag_path() {
        let item = InstanceBuilder::item().binary(Tag(0x0042, 0x0011), Vr::OB, vec![7; 4096]);
        let result = split(
            InstanceBuilder::new("1.2.3", "1.2.3.4", "1.2.3.4.5")
                .sequence(Tag(0x0040, 0x0275), vec![InstanceBuilder::item(), item]),
            1024,
        );

        assert_eq!(result.items.len(), 1);
        assert_eq!(
            result.items[0].key(),
            "studies/1.2.3/bulkdata/1.2.3.4.5/00400275.1.00420011.zst"
        );
    }

    #[test]
    fn test_encapsulated_frames_stored_as_is() {
        let result = split(
            InstanceBuilder::new("1.2.3", "1.2.3.4", "1.2.3.4.5")
                .transfer_syntax("1.2.840.10008.1.2.4.50")
                .us(tags::ROWS, 8)
                .us(tags::COLUMNS, 8)
                .text(tags::NUMBER_OF_FRAMES, Vr::IS, "2")
                .encapsulated_pixels(vec![vec![0xFF, 0xD8, 1, 0xFF, 0xD9, 0], vec![0xFF, 0xD8, 2, 0xFF, 0xD9, 0]], true),
            1024,
        );

        assert_eq!(result.frames, 2);
        assert_eq!(result.items[1].data.as_ref(), &[0xFF, 0xD8, 2, 0xFF, 0xD9, 0]);
        assert_eq!(result.items[1].content_type, "image/jpeg");
        assert_eq!(result.items[1].locator.codec(), Codec::Identity);
    }

    #[test]
    fn test_undeterminable_frames_fail() {
        let parsed = read_part10(
            InstanceBuilder::new("1.2.3", "1.2.3.4", "1.2.3.4.5")
                .transfer_syntax("1.2.840.10008.1.2.4.50")
                .text(tags::NUMBER_OF_FRAMES, Vr::IS, "3")
                .encapsulated_pixels(vec![vec![1, 2], vec![3, 4]], false)
                .build(),
        )
        .unwrap();

        assert!(matches!(
            BulkSplitter::new(1024).split(&ids(), parsed.dataset, &parsed.transfer_syntax),
            Err(SplitError::FrameBoundary(_))
        ));
    }
}
