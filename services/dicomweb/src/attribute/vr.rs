use std::fmt;
use std::str::FromStr;

/// Value representation of a data element.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vr {
    AE,
    AS,
    AT,
    CS,
    DA,
    DS,
    DT,
    FD,
    FL,
    IS,
    LO,
    LT,
    OB,
    OD,
    OF,
    OL,
    OV,
    OW,
    PN,
    SH,
    SL,
    SQ,
    SS,
    ST,
    SV,
    TM,
    UC,
    UI,
    UL,
    UN,
    UR,
    US,
    UT,
    UV,
}

/// The closed set of value shapes a VR decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrCategory {
    Text,
    Integer,
    Float,
    AttributeTag,
    Sequence,
    Binary,
}

impl Vr {
    const ALL: [Vr; 34] = [
        Vr::AE,
        Vr::AS,
        Vr::AT,
        Vr::CS,
        Vr::DA,
        Vr::DS,
        Vr::DT,
        Vr::FD,
        Vr::FL,
        Vr::IS,
        Vr::LO,
        Vr::LT,
        Vr::OB,
        Vr::OD,
        Vr::OF,
        Vr::OL,
        Vr::OV,
        Vr::OW,
        Vr::PN,
        Vr::SH,
        Vr::SL,
        Vr::SQ,
        Vr::SS,
        Vr::ST,
        Vr::SV,
        Vr::TM,
        Vr::UC,
        Vr::UI,
        Vr::UL,
        Vr::UN,
        Vr::UR,
        Vr::US,
        Vr::UT,
        Vr::UV,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vr::AE => "AE",
            Vr::AS => "AS",
            Vr::AT => "AT",
            Vr::CS => "CS",
            Vr::DA => "DA",
            Vr::DS => "DS",
            Vr::DT => "DT",
            Vr::FD => "FD",
            Vr::FL => "FL",
            Vr::IS => "IS",
            Vr::LO => "LO",
            Vr::LT => "LT",
            Vr::OB => "OB",
            Vr::OD => "OD",
            Vr::OF => "OF",
            Vr::OL => "OL",
            Vr::OV => "OV",
            Vr::OW => "OW",
            Vr::PN => "PN",
            Vr::SH => "SH",
            Vr::SL => "SL",
            Vr::SQ => "SQ",
            Vr::SS => "SS",
            Vr::ST => "ST",
            Vr::SV => "SV",
            Vr::TM => "TM",
            Vr::UC => "UC",
            Vr::UI => "UI",
            Vr::UL => "UL",
            Vr::UN => "UN",
            Vr::UR => "UR",
            Vr::US => "US",
            Vr::UT => "UT",
            Vr::UV => "UV",
        }
    }

    pub fn from_bytes(code: [u8; 2]) -> Option<Vr> {
        Vr::ALL
            .iter()
            .copied()
            .find(|vr| vr.as_str().as_bytes() == code)
    }

    pub fn category(&self) -> VrCategory {
        match self {
            Vr::SQ => VrCategory::Sequence,
            Vr::AT => VrCategory::AttributeTag,
            Vr::FD | Vr::FL => VrCategory::Float,
            Vr::SL | Vr::SS | Vr::SV | Vr::UL | Vr::US | Vr::UV => VrCategory::Integer,
            Vr::OB | Vr::OD | Vr::OF | Vr::OL | Vr::OV | Vr::OW | Vr::UN => VrCategory::Binary,
            _ => VrCategory::Text,
        }
    }

    /// Explicit VR encodings use a 2-byte reserved field and a 4-byte length
    /// for these representations.
    pub fn has_long_header(&self) -> bool {
        matches!(
            self,
            Vr::OB
                | Vr::OD
                | Vr::OF
                | Vr::OL
                | Vr::OV
                | Vr::OW
                | Vr::SQ
                | Vr::UC
                | Vr::UN
                | Vr::UR
                | Vr::UT
                | Vr::SV
                | Vr::UV
        )
    }

    /// Size of one value for fixed-width representations; the encoded
    /// length must be a multiple of it.
    pub fn unit_size(&self) -> usize {
        match self {
            Vr::US | Vr::SS | Vr::OW => 2,
            Vr::UL | Vr::SL | Vr::FL | Vr::AT | Vr::OF | Vr::OL => 4,
            Vr::UV | Vr::SV | Vr::FD | Vr::OD | Vr::OV => 8,
            _ => 1,
        }
    }

    /// Text representations that carry a single value and keep backslashes.
    pub fn is_single_valued_text(&self) -> bool {
        matches!(self, Vr::LT | Vr::ST | Vr::UT | Vr::UR)
    }
}

impl fmt::Display for Vr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return Err(s.to_string());
        }
        Vr::from_bytes([bytes[0], bytes[1]]).ok_or_else(|| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vr_codes_round_trip() {
        for vr in Vr::ALL {
            assert_eq!(vr.as_str().parse::<Vr>().unwrap(), vr);
        }
        assert!(Vr::from_bytes(*b"XX").is_none());
    }

    #[test]
    fn test_vr_categories() {
        assert_eq!(Vr::UN.category(), VrCategory::Binary);
        assert_eq!(Vr::US.category(), VrCategory::Integer);
        assert_eq!(Vr::DS.category(), VrCategory::Text);
        assert_eq!(Vr::SQ.category(), VrCategory::Sequence);
        assert!(Vr::OB.has_long_header());
        assert!(!Vr::US.has_long_header());
    }
}
