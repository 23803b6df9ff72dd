use std::fmt;
use std::str::FromStr;

/// A DICOM data element tag, `(group, element)`.
///
/// Ordering is numeric on `(group, element)`, which is also the order the
/// hexadecimal JSON keys sort in, so tag order survives serialization.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16, pub u16);

impl Tag {
    pub const fn new(group: u16, element: u16) -> Self {
        Self(group, element)
    }

    pub const fn group(&self) -> u16 {
        self.0
    }

    pub const fn element(&self) -> u16 {
        self.1
    }

    /// Group length elements `(gggg,0000)` are retired and dropped on read.
    pub const fn is_group_length(&self) -> bool {
        self.1 == 0x0000
    }

    pub const fn is_private(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Private creator elements `(gggg,0010-00FF)` in an odd group.
    pub const fn is_private_creator(&self) -> bool {
        self.is_private() && self.1 >= 0x0010 && self.1 <= 0x00FF
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}{:04X}", self.0, self.1)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tag: {0:?}")]
pub struct ParseTagError(pub String);

impl FromStr for Tag {
    type Err = ParseTagError;

    /// Parses the 8-digit hexadecimal form used as DICOM JSON keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseTagError(s.to_string()));
        }
        let group = u16::from_str_radix(&s[..4], 16).map_err(|_| ParseTagError(s.to_string()))?;
        let element = u16::from_str_radix(&s[4..], 16).map_err(|_| ParseTagError(s.to_string()))?;
        Ok(Tag(group, element))
    }
}

/// Address of an attribute inside nested sequences.
///
/// Rendered as `TTTTTTTT` for a top-level attribute and
/// `SSSSSSSS.i.TTTTTTTT` for an attribute inside item `i` of sequence `S`.
/// The rendering is used verbatim in storage paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagPath {
    steps: Vec<(Tag, usize)>,
    leaf: Tag,
}

impl TagPath {
    pub fn new(leaf: Tag) -> Self {
        Self {
            steps: Vec::new(),
            leaf,
        }
    }

    /// Path of `leaf` inside item `item` of the sequence at `self`.
    pub fn child(&self, item: usize, leaf: Tag) -> Self {
        let mut steps = self.steps.clone();
        steps.push((self.leaf, item));
        Self { steps, leaf }
    }

    pub fn leaf(&self) -> Tag {
        self.leaf
    }

    pub fn depth(&self) -> usize {
        self.steps.len()
    }
}

impl fmt::Display for TagPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (tag, item) in &self.steps {
            write!(f, "{}.{}.", tag, item)?;
        }
        write!(f, "{}", self.leaf)
    }
}

impl FromStr for TagPath {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() % 2 == 0 {
            return Err(ParseTagError(s.to_string()));
        }
        let mut steps = Vec::with_capacity(parts.len() / 2);
        for pair in parts[..parts.len() - 1].chunks(2) {
            let tag: Tag = pair[0].parse()?;
            // Reject leading zeros so that every path has exactly one rendering.
            if pair[1].len() > 1 && pair[1].starts_with('0') {
                return Err(ParseTagError(s.to_string()));
            }
            let item: usize = pair[1].parse().map_err(|_| ParseTagError(s.to_string()))?;
            steps.push((tag, item));
        }
        let leaf: Tag = parts[parts.len() - 1].parse()?;
        Ok(Self { steps, leaf })
    }
}

/// Tags the engine reads or writes by name.
pub mod tags {
    use super::Tag;

    pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);

    pub const SPECIFIC_CHARACTER_SET: Tag = Tag(0x0008, 0x0005);
    pub const SOP_CLASS_UID: Tag = Tag(0x0008, 0x0016);
    pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
    pub const STUDY_DATE: Tag = Tag(0x0008, 0x0020);
    pub const SERIES_DATE: Tag = Tag(0x0008, 0x0021);
    pub const STUDY_TIME: Tag = Tag(0x0008, 0x0030);
    pub const SERIES_TIME: Tag = Tag(0x0008, 0x0031);
    pub const ACCESSION_NUMBER: Tag = Tag(0x0008, 0x0050);
    pub const MODALITY: Tag = Tag(0x0008, 0x0060);
    pub const MODALITIES_IN_STUDY: Tag = Tag(0x0008, 0x0061);
    pub const REFERRING_PHYSICIAN_NAME: Tag = Tag(0x0008, 0x0090);
    pub const STUDY_DESCRIPTION: Tag = Tag(0x0008, 0x1030);
    pub const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
    pub const AVAILABLE_TRANSFER_SYNTAX_UID: Tag = Tag(0x0008, 0x3002);

    pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
    pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
    pub const ISSUER_OF_PATIENT_ID: Tag = Tag(0x0010, 0x0021);
    pub const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
    pub const PATIENT_SEX: Tag = Tag(0x0010, 0x0040);

    pub const BODY_PART_EXAMINED: Tag = Tag(0x0018, 0x0015);

    pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
    pub const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
    pub const STUDY_ID: Tag = Tag(0x0020, 0x0010);
    pub const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
    pub const INSTANCE_NUMBER: Tag = Tag(0x0020, 0x0013);
    pub const NUMBER_OF_STUDY_RELATED_SERIES: Tag = Tag(0x0020, 0x1206);
    pub const NUMBER_OF_STUDY_RELATED_INSTANCES: Tag = Tag(0x0020, 0x1208);
    pub const NUMBER_OF_SERIES_RELATED_INSTANCES: Tag = Tag(0x0020, 0x1209);

    pub const SAMPLES_PER_PIXEL: Tag = Tag(0x0028, 0x0002);
    pub const PHOTOMETRIC_INTERPRETATION: Tag = Tag(0x0028, 0x0004);
    pub const NUMBER_OF_FRAMES: Tag = Tag(0x0028, 0x0008);
    pub const ROWS: Tag = Tag(0x0028, 0x0010);
    pub const COLUMNS: Tag = Tag(0x0028, 0x0011);
    pub const BITS_ALLOCATED: Tag = Tag(0x0028, 0x0100);
    pub const BITS_STORED: Tag = Tag(0x0028, 0x0101);
    pub const HIGH_BIT: Tag = Tag(0x0028, 0x0102);
    pub const PIXEL_REPRESENTATION: Tag = Tag(0x0028, 0x0103);

    pub const PERFORMED_PROCEDURE_STEP_START_DATE: Tag = Tag(0x0040, 0x0244);

    pub const EXTENDED_OFFSET_TABLE: Tag = Tag(0x7FE0, 0x0001);
    pub const EXTENDED_OFFSET_TABLE_LENGTHS: Tag = Tag(0x7FE0, 0x0002);
    pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

    pub const ITEM: Tag = Tag(0xFFFE, 0xE000);
    pub const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
    pub const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);
}
