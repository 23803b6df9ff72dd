//! QIDO-style filtering over rendered aggregate documents.
//!
//! Matching works on a small, fixed set of indexable attributes per level;
//! anything else is rejected up front rather than silently ignored, since
//! no index exists to answer it.

use crate::attribute::dictionary::{resolve, vr_of};
use crate::attribute::json::element_strings;
use crate::attribute::{tags, Tag, Vr};
use crate::config::QueryConfig;
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("unknown attribute {0:?}")]
    UnknownAttribute(String),

    #[error("{tag} is not searchable at {level} level")]
    NotIndexable { tag: Tag, level: QueryLevel },

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("unsupported query parameter {0:?}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLevel {
    Study,
    Series,
    Instance,
}

impl QueryLevel {
    /// Attributes a query at this level may filter on.
    pub fn indexable_tags(&self) -> &'static [Tag] {
        match self {
            QueryLevel::Study => &[
                tags::STUDY_DATE,
                tags::STUDY_TIME,
                tags::ACCESSION_NUMBER,
                tags::MODALITIES_IN_STUDY,
                tags::REFERRING_PHYSICIAN_NAME,
                tags::STUDY_DESCRIPTION,
                tags::PATIENT_NAME,
                tags::PATIENT_ID,
                tags::PATIENT_BIRTH_DATE,
                tags::PATIENT_SEX,
                tags::STUDY_INSTANCE_UID,
                tags::STUDY_ID,
            ],
            QueryLevel::Series => &[
                tags::MODALITY,
                tags::SERIES_INSTANCE_UID,
                tags::SERIES_NUMBER,
                tags::SERIES_DATE,
                tags::SERIES_TIME,
                tags::SERIES_DESCRIPTION,
                tags::BODY_PART_EXAMINED,
                tags::PERFORMED_PROCEDURE_STEP_START_DATE,
            ],
            QueryLevel::Instance => &[
                tags::SOP_CLASS_UID,
                tags::SOP_INSTANCE_UID,
                tags::INSTANCE_NUMBER,
                tags::MODALITY,
            ],
        }
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLevel::Study => f.write_str("study"),
            QueryLevel::Series => f.write_str("series"),
            QueryLevel::Instance => f.write_str("instance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    /// Empty value: every object matches.
    Universal,
    Exact(String),
    /// `*` matches any run of characters, `?` exactly one.
    Wildcard(String),
    UidList(Vec<String>),
    DateRange(Option<NaiveDate>, Option<NaiveDate>),
    TimeRange(Option<NaiveTime>, Option<NaiveTime>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeFilter {
    pub tag: Tag,
    pub vr: Vr,
    pub matcher: Matcher,
}

impl AttributeFilter {
    fn parse(name: &str, tag: Tag, vr: Vr, value: &str) -> Result<Self, QueryError> {
        let invalid = |reason: &str| QueryError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let matcher = if value.is_empty() {
            Matcher::Universal
        } else if vr == Vr::UI {
            Matcher::UidList(value.split('\\').map(str::to_string).collect())
        } else if vr == Vr::DA && value.contains('-') {
            let (from, to) = parse_range(value, parse_date).ok_or_else(|| invalid("expected YYYYMMDD"))?;
            Matcher::DateRange(from, to)
        } else if vr == Vr::TM && value.contains('-') {
            let (from, to) = parse_range(value, parse_time).ok_or_else(|| invalid("expected HH[MM[SS[.F]]]"))?;
            Matcher::TimeRange(from, to)
        } else if value.contains(['*', '?']) {
            Matcher::Wildcard(value.to_string())
        } else {
            Matcher::Exact(value.to_string())
        };

        Ok(Self { tag, vr, matcher })
    }

    /// Whether any value of the attribute in `object` satisfies the filter.
    pub fn matches(&self, object: &JsonValue) -> bool {
        if self.matcher == Matcher::Universal {
            return true;
        }
        // Person names compare case-insensitively.
        let fold = |s: &str| {
            if self.vr == Vr::PN {
                s.to_lowercase()
            } else {
                s.to_string()
            }
        };

        element_strings(object, self.tag).iter().any(|value| match &self.matcher {
            Matcher::Universal => true,
            Matcher::Exact(expected) => fold(value) == fold(expected),
            Matcher::Wildcard(pattern) => wildcard_match(&fold(pattern), &fold(value)),
            Matcher::UidList(uids) => uids.iter().any(|uid| uid == value),
            Matcher::DateRange(from, to) => {
                parse_date(value).is_some_and(|d| in_range(&d, from.as_ref(), to.as_ref()))
            }
            Matcher::TimeRange(from, to) => {
                parse_time(value).is_some_and(|t| in_range(&t, from.as_ref(), to.as_ref()))
            }
        })
    }
}

/// `from-to` where either bound may be omitted.
fn parse_range<T>(value: &str, parse: fn(&str) -> Option<T>) -> Option<(Option<T>, Option<T>)> {
    let (from, to) = value.split_once('-')?;
    let bound = |s: &str| if s.is_empty() { Some(None) } else { parse(s).map(Some) };
    Some((bound(from)?, bound(to)?))
}

fn in_range<T: Ord>(value: &T, from: Option<&T>, to: Option<&T>) -> bool {
    from.map_or(true, |f| value >= f) && to.map_or(true, |t| value <= t)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y%m%d").ok()
}

/// `HH`, `HHMM`, `HHMMSS` or `HHMMSS.FFFFFF`; omitted components are zero.
fn parse_time(value: &str) -> Option<NaiveTime> {
    let (main, fraction) = match value.split_once('.') {
        Some((main, fraction)) => (main, fraction),
        None => (value, ""),
    };
    if !main.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| main.get(range).map_or(Some(0), |s| s.parse::<u32>().ok());
    let (hour, minute, second) = match main.len() {
        2 | 4 | 6 => (field(0..2)?, field(2..4)?, field(4..6)?),
        _ => return None,
    };
    let nanos = if fraction.is_empty() {
        0
    } else {
        let digits: String = fraction.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse().ok()?
    };
    NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// A parsed query: attribute filters (all must match) plus paging.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub level: QueryLevel,
    pub filters: Vec<AttributeFilter>,
    pub offset: usize,
    pub limit: usize,
}

impl QueryFilter {
    /// Everything at `level`, first page.
    pub fn all(level: QueryLevel, config: &QueryConfig) -> Self {
        Self {
            level,
            filters: Vec::new(),
            offset: 0,
            limit: config.default_limit,
        }
    }

    /// Build from query string pairs. Attribute names are keywords or
    /// 8-digit hex tags.
    pub fn from_params<K, V>(
        level: QueryLevel,
        params: impl IntoIterator<Item = (K, V)>,
        config: &QueryConfig,
    ) -> Result<Self, QueryError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Self::all(level, config);

        for (name, value) in params {
            let (name, value) = (name.as_ref(), value.as_ref());
            match name {
                "limit" => {
                    query.limit = parse_count(name, value)?.min(config.max_limit);
                }
                "offset" => {
                    query.offset = parse_count(name, value)?;
                }
                // Responses always carry every promoted attribute.
                "includefield" => {}
                "fuzzymatching" if value == "false" => {}
                "fuzzymatching" => return Err(QueryError::Unsupported(format!("{}={}", name, value))),
                _ => {
                    let tag = resolve(name).ok_or_else(|| QueryError::UnknownAttribute(name.to_string()))?;
                    if !level.indexable_tags().contains(&tag) {
                        return Err(QueryError::NotIndexable { tag, level });
                    }
                    let vr = vr_of(tag).unwrap_or(Vr::LO);
                    query.filters.push(AttributeFilter::parse(name, tag, vr, value)?);
                }
            }
        }

        Ok(query)
    }

    pub fn matches(&self, object: &JsonValue) -> bool {
        self.filters.iter().all(|f| f.matches(object))
    }

    /// Filter then apply offset and limit, keeping order.
    pub fn apply(&self, objects: impl IntoIterator<Item = JsonValue>) -> Vec<JsonValue> {
        objects
            .into_iter()
            .filter(|o| self.matches(o))
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, QueryError> {
    value.parse().map_err(|_| QueryError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}
