//! Pixel data frame boundaries.

use super::SplitError;
use crate::attribute::{tags, AttributeSet, Fragments, Value};
use bytes::{Buf, Bytes, BytesMut};

/// Size of an item header preceding every fragment.
const ITEM_HEADER_LEN: u64 = 8;

fn boundary(reason: impl Into<String>) -> SplitError {
    SplitError::FrameBoundary(reason.into())
}

/// Number of Frames, defaulting to 1 when absent.
pub fn frame_count(set: &AttributeSet) -> Result<u32, SplitError> {
    match set.int(tags::NUMBER_OF_FRAMES) {
        None => Ok(1),
        Some(n) if n >= 1 => u32::try_from(n).map_err(|_| boundary(format!("Number of Frames {} out of range", n))),
        Some(n) => Err(boundary(format!("Number of Frames is {}", n))),
    }
}

/// Image geometry that sizes one native frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub rows: u64,
    pub columns: u64,
    pub samples_per_pixel: u64,
    pub bits_allocated: u64,
    pub frames: u32,
}

impl FrameGeometry {
    pub fn from_attributes(set: &AttributeSet) -> Result<Self, SplitError> {
        let required = |tag, name: &str| -> Result<u64, SplitError> {
            match set.int(tag) {
                Some(v) if v > 0 => Ok(v as u64),
                Some(v) => Err(boundary(format!("{} is {}", name, v))),
                None => Err(boundary(format!("{} is missing", name))),
            }
        };

        Ok(Self {
            rows: required(tags::ROWS, "Rows")?,
            columns: required(tags::COLUMNS, "Columns")?,
            samples_per_pixel: match set.int(tags::SAMPLES_PER_PIXEL) {
                None => 1,
                Some(_) => required(tags::SAMPLES_PER_PIXEL, "Samples per Pixel")?,
            },
            bits_allocated: required(tags::BITS_ALLOCATED, "Bits Allocated")?,
            frames: frame_count(set)?,
        })
    }

    fn frame_bits(&self) -> Result<u64, SplitError> {
        self.rows
            .checked_mul(self.columns)
            .and_then(|n| n.checked_mul(self.samples_per_pixel))
            .and_then(|n| n.checked_mul(self.bits_allocated))
            .ok_or_else(|| {
                boundary(format!(
                    "frame of {}x{}x{} at {} bits is too large",
                    self.rows, self.columns, self.samples_per_pixel, self.bits_allocated
                ))
            })
    }
}

/// Slice native pixel data into frames without copying.
pub fn native_frames(pixels: &Bytes, geometry: &FrameGeometry) -> Result<Vec<Bytes>, SplitError> {
    let bits = geometry.frame_bits()?;
    // Multi-frame bit-packed data only splits on byte boundaries.
    if geometry.frames > 1 && bits % 8 != 0 {
        return Err(boundary(format!(
            "frame of {} bits is not byte aligned",
            bits
        )));
    }
    let frame_len = bits.div_ceil(8);
    let needed = frame_len
        .checked_mul(u64::from(geometry.frames))
        .ok_or_else(|| boundary(format!("{} frames of {} bytes overflow", geometry.frames, frame_len)))?;
    if (pixels.len() as u64) < needed {
        return Err(boundary(format!(
            "pixel data holds {} bytes, {} frames of {} bytes need {}",
            pixels.len(),
            geometry.frames,
            frame_len,
            needed
        )));
    }

    // needed <= pixels.len(), so every slice below is in bounds.
    let frame_len = frame_len as usize;
    Ok((0..geometry.frames as usize)
        .map(|i| pixels.slice(i * frame_len..(i + 1) * frame_len))
        .collect())
}

/// Extended Offset Table values, if the dataset carries one.
pub fn extended_offsets(set: &AttributeSet) -> Option<Vec<u64>> {
    match &set.get(tags::EXTENDED_OFFSET_TABLE)?.value {
        Value::Binary(raw) if raw.len() % 8 == 0 && !raw.is_empty() => {
            let mut buf = raw.clone();
            let mut offsets = Vec::with_capacity(raw.len() / 8);
            while buf.has_remaining() {
                offsets.push(buf.get_u64_le());
            }
            Some(offsets)
        }
        _ => None,
    }
}

/// Group encapsulated fragments into frames.
///
/// Tries, in order: the Basic Offset Table, the Extended Offset Table, one
/// fragment per frame, and all fragments as a single frame.
pub fn encapsulated_frames(
    fragments: &Fragments,
    frames: u32,
    extended: Option<&[u64]>,
) -> Result<Vec<Bytes>, SplitError> {
    if fragments.fragments.is_empty() {
        return Err(boundary("encapsulated pixel data has no fragments"));
    }

    if !fragments.offset_table.is_empty() {
        let offsets: Vec<u64> = fragments.offset_table.iter().map(|&o| u64::from(o)).collect();
        return frames_from_offsets(fragments, &offsets, frames);
    }
    if let Some(offsets) = extended {
        return frames_from_offsets(fragments, offsets, frames);
    }
    if fragments.fragments.len() == frames as usize {
        return Ok(fragments.fragments.clone());
    }
    if frames == 1 {
        return Ok(vec![join(&fragments.fragments)]);
    }

    Err(boundary(format!(
        "{} fragments for {} frames and no offset table",
        fragments.fragments.len(),
        frames
    )))
}

/// Offsets address the item header of each frame's first fragment,
/// measured from the first fragment after the offset table.
fn frames_from_offsets(
    fragments: &Fragments,
    offsets: &[u64],
    frames: u32,
) -> Result<Vec<Bytes>, SplitError> {
    if offsets.len() != frames as usize {
        return Err(boundary(format!(
            "offset table has {} entries for {} frames",
            offsets.len(),
            frames
        )));
    }

    let mut starts = Vec::with_capacity(fragments.fragments.len());
    let mut position = 0u64;
    for fragment in &fragments.fragments {
        starts.push(position);
        position += ITEM_HEADER_LEN + fragment.len() as u64;
    }

    let mut first_fragments = Vec::with_capacity(offsets.len());
    for (i, offset) in offsets.iter().enumerate() {
        let index = starts
            .binary_search(offset)
            .map_err(|_| boundary(format!("offset {} of frame {} is not a fragment boundary", offset, i + 1)))?;
        if i == 0 && index != 0 {
            return Err(boundary("first frame does not start at the first fragment"));
        }
        if first_fragments.last().is_some_and(|&previous| previous >= index) {
            return Err(boundary("offset table is not increasing"));
        }
        first_fragments.push(index);
    }

    let mut result = Vec::with_capacity(first_fragments.len());
    for (i, &start) in first_fragments.iter().enumerate() {
        let end = first_fragments.get(i + 1).copied().unwrap_or(fragments.fragments.len());
        result.push(join(&fragments.fragments[start..end]));
    }
    Ok(result)
}

fn join(parts: &[Bytes]) -> Bytes {
    match parts {
        [single] => single.clone(),
        _ => {
            let mut joined = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
            for part in parts {
                joined.extend_from_slice(part);
            }
            joined.freeze()
        }
    }
}
