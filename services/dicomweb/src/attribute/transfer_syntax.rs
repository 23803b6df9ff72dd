/// Implicit VR Little Endian, the default when a stream has no file meta.
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// How a dataset is encoded, derived from its Transfer Syntax UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSyntax {
    uid: String,
}

impl TransferSyntax {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }

    pub fn implicit_little_endian() -> Self {
        Self::new(IMPLICIT_VR_LITTLE_ENDIAN)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_explicit_vr(&self) -> bool {
        self.uid != IMPLICIT_VR_LITTLE_ENDIAN
    }

    /// Encodings the reader cannot walk without an extra decoding layer.
    pub fn is_supported(&self) -> bool {
        self.uid != EXPLICIT_VR_BIG_ENDIAN && self.uid != DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
    }

    /// Native syntaxes store pixel data uncompressed in a single value.
    pub fn is_encapsulated(&self) -> bool {
        !matches!(
            self.uid.as_str(),
            IMPLICIT_VR_LITTLE_ENDIAN
                | EXPLICIT_VR_LITTLE_ENDIAN
                | DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
                | EXPLICIT_VR_BIG_ENDIAN
        )
    }

    /// Media type of a single frame in this syntax.
    pub fn frame_content_type(&self) -> &'static str {
        match self.uid.as_str() {
            "1.2.840.10008.1.2.4.50" | "1.2.840.10008.1.2.4.51" | "1.2.840.10008.1.2.4.57"
            | "1.2.840.10008.1.2.4.70" => "image/jpeg",
            "1.2.840.10008.1.2.4.80" | "1.2.840.10008.1.2.4.81" => "image/jls",
            "1.2.840.10008.1.2.4.90" | "1.2.840.10008.1.2.4.91" => "image/jp2",
            "1.2.840.10008.1.2.4.201" | "1.2.840.10008.1.2.4.202" | "1.2.840.10008.1.2.4.203" => {
                "image/jphc"
            }
            "1.2.840.10008.1.2.5" => "image/x-dicom-rle",
            _ => "application/octet-stream",
        }
    }
}
