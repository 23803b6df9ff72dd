//! Blob codecs.
//!
//! Every bulk item and aggregate document is stored through one of these
//! codecs. The codec identity travels with the blob (locator member and
//! object name extension), so a reader never has to guess.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// zstd level for bulk items and documents.
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown codec: {0}")]
    Unknown(String),

    #[error("{codec} compression failed: {reason}")]
    Encode { codec: Codec, reason: String },

    #[error("{codec} decompression failed: {reason}")]
    Decode { codec: Codec, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Codec {
    /// Stored as-is (payload already compressed by its transfer syntax).
    Identity,
    /// LZ4 block with prepended size; cheap to decode on the frame path.
    Lz4,
    /// zstd frame; better ratio for descriptive and non-pixel payloads.
    Zstd,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Identity => "identity",
            Codec::Lz4 => "lz4",
            Codec::Zstd => "zstd",
        }
    }

    /// Suffix appended to object names written with this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Identity => "",
            Codec::Lz4 => ".lz4",
            Codec::Zstd => ".zst",
        }
    }

    /// Split an object name into its stem and the codec its extension names.
    pub fn from_file_name(name: &str) -> (&str, Codec) {
        if let Some(stem) = name.strip_suffix(Codec::Lz4.extension()) {
            (stem, Codec::Lz4)
        } else if let Some(stem) = name.strip_suffix(Codec::Zstd.extension()) {
            (stem, Codec::Zstd)
        } else {
            (name, Codec::Identity)
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        match self {
            Codec::Identity => Ok(Bytes::copy_from_slice(data)),
            Codec::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(data))),
            Codec::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
                .map(Bytes::from)
                .map_err(|e| CodecError::Encode {
                    codec: *self,
                    reason: e.to_string(),
                }),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        match self {
            Codec::Identity => Ok(Bytes::copy_from_slice(data)),
            Codec::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map(Bytes::from)
                .map_err(|e| CodecError::Decode {
                    codec: *self,
                    reason: e.to_string(),
                }),
            Codec::Zstd => zstd::decode_all(data)
                .map(Bytes::from)
                .map_err(|e| CodecError::Decode {
                    codec: *self,
                    reason: e.to_string(),
                }),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Codec::Identity),
            "lz4" => Ok(Codec::Lz4),
            "zstd" => Ok(Codec::Zstd),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codecs_restore_payload() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for codec in [Codec::Identity, Codec::Lz4, Codec::Zstd] {
            let stored = codec.compress(&payload).unwrap();
            assert_eq!(codec.decompress(&stored).unwrap().as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_compression_is_deterministic() {
        let payload = vec![7u8; 10_000];
        assert_eq!(
            Codec::Zstd.compress(&payload).unwrap(),
            Codec::Zstd.compress(&payload).unwrap()
        );
    }

    #[test]
    fn test_file_name_extension() {
        assert_eq!(Codec::from_file_name("3.lz4"), ("3", Codec::Lz4));
        assert_eq!(Codec::from_file_name("00091001.zst"), ("00091001", Codec::Zstd));
        assert_eq!(Codec::from_file_name("1"), ("1", Codec::Identity));
        assert!("gzip".parse::<Codec>().is_err());
    }

    #[test]
    fn test_corrupt_input_is_reported() {
        assert!(matches!(
            Codec::Zstd.decompress(b"not zstd"),
            Err(CodecError::Decode { codec: Codec::Zstd, .. })
        ));
    }
}
