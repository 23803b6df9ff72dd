//! Storage path scheme.
//!
//! Every object key is a pure function of identifiers:
//!
//! ```text
//! studies/{study}/index.json.zst
//! studies/{study}/thumbnail
//! studies/{study}/bulkdata/{instance}/{tag-path}{ext}
//! studies/{study}/series/{series}/index.json.zst
//! studies/{study}/series/{series}/thumbnail
//! studies/{study}/series/{series}/instances/{instance}/metadata.json.zst
//! studies/{study}/series/{series}/instances/{instance}/thumbnail
//! studies/{study}/series/{series}/instances/{instance}/frames/{n}{ext}
//! ```
//!
//! Identifiers are restricted to the UID character set (see
//! [`is_valid_uid`]), which contains no `/` and cannot start with `.`, so
//! distinct identifier tuples never map to the same key.

use crate::attribute::{is_valid_uid, InstanceIds, TagPath};
use crate::codec::Codec;

pub const STUDIES: &str = "studies";
pub const INDEX: &str = "index.json.zst";
pub const METADATA: &str = "metadata.json.zst";
pub const THUMBNAIL: &str = "thumbnail";

pub fn studies_root() -> String {
    STUDIES.to_string()
}

pub fn study_dir(study: &str) -> String {
    format!("{}/{}", STUDIES, study)
}

pub fn study_index(study: &str) -> String {
    format!("{}/{}", study_dir(study), INDEX)
}

pub fn series_root(study: &str) -> String {
    format!("{}/series", study_dir(study))
}

pub fn series_dir(study: &str, series: &str) -> String {
    format!("{}/{}", series_root(study), series)
}

pub fn series_index(study: &str, series: &str) -> String {
    format!("{}/{}", series_dir(study, series), INDEX)
}

pub fn instances_root(study: &str, series: &str) -> String {
    format!("{}/instances", series_dir(study, series))
}

pub fn instance_dir(ids: &InstanceIds) -> String {
    format!("{}/{}", instances_root(&ids.study, &ids.series), ids.instance)
}

pub fn instance_metadata(ids: &InstanceIds) -> String {
    format!("{}/{}", instance_dir(ids), METADATA)
}

pub fn frames_dir(ids: &InstanceIds) -> String {
    format!("{}/frames", instance_dir(ids))
}

/// Frame `number` is 1-based.
pub fn frame(ids: &InstanceIds, number: u32, codec: Codec) -> String {
    format!("{}/{}{}", frames_dir(ids), number, codec.extension())
}

pub fn bulk_root(study: &str) -> String {
    format!("{}/bulkdata", study_dir(study))
}

pub fn bulk_instance_dir(study: &str, instance: &str) -> String {
    format!("{}/{}", bulk_root(study), instance)
}

pub fn bulk_item(study: &str, instance: &str, path: &TagPath, codec: Codec) -> String {
    format!(
        "{}/{}{}",
        bulk_instance_dir(study, instance),
        path,
        codec.extension()
    )
}

/// A study, series or instance, as addressed by the read layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Study(String),
    Series(String, String),
    Instance(InstanceIds),
}

impl Resource {
    pub fn study(&self) -> &str {
        match self {
            Resource::Study(study) | Resource::Series(study, _) => study,
            Resource::Instance(ids) => &ids.study,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Resource::Study(study) => is_valid_uid(study),
            Resource::Series(study, series) => is_valid_uid(study) && is_valid_uid(series),
            Resource::Instance(ids) => {
                is_valid_uid(&ids.study) && is_valid_uid(&ids.series) && is_valid_uid(&ids.instance)
            }
        }
    }

    pub fn thumbnail(&self) -> String {
        let dir = match self {
            Resource::Study(study) => study_dir(study),
            Resource::Series(study, series) => series_dir(study, series),
            Resource::Instance(ids) => instance_dir(ids),
        };
        format!("{}/{}", dir, THUMBNAIL)
    }
}

/// Address of one bulk data item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BulkLocator {
    /// A large non-pixel attribute, addressed by its tag path.
    Attribute {
        study: String,
        instance: String,
        path: TagPath,
        codec: Codec,
    },
    /// One pixel data frame (1-based).
    Frame {
        ids: InstanceIds,
        number: u32,
        codec: Codec,
    },
}

impl BulkLocator {
    pub fn data_type(&self) -> &'static str {
        match self {
            BulkLocator::Attribute { .. } => "attribute",
            BulkLocator::Frame { .. } => "frame",
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            BulkLocator::Attribute { codec, .. } | BulkLocator::Frame { codec, .. } => *codec,
        }
    }

    pub fn study(&self) -> &str {
        match self {
            BulkLocator::Attribute { study, .. } => study,
            BulkLocator::Frame { ids, .. } => &ids.study,
        }
    }

    pub fn instance(&self) -> &str {
        match self {
            BulkLocator::Attribute { instance, .. } => instance,
            BulkLocator::Frame { ids, .. } => &ids.instance,
        }
    }

    pub fn key(&self) -> String {
        match self {
            BulkLocator::Attribute {
                study,
                instance,
                path,
                codec,
            } => bulk_item(study, instance, path, *codec),
            BulkLocator::Frame { ids, number, codec } => frame(ids, *number, *codec),
        }
    }

    /// Recover a locator from its storage key.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        let locator = match parts.as_slice() {
            [STUDIES, study, "bulkdata", instance, file] => {
                let (stem, codec) = Codec::from_file_name(file);
                BulkLocator::Attribute {
                    study: study.to_string(),
                    instance: instance.to_string(),
                    path: stem.parse().ok()?,
                    codec,
                }
            }
            [STUDIES, study, "series", series, "instances", instance, "frames", file] => {
                let (stem, codec) = Codec::from_file_name(file);
                if stem.starts_with('0') {
                    return None;
                }
                BulkLocator::Frame {
                    ids: InstanceIds::new(*study, *series, *instance),
                    number: stem.parse().ok()?,
                    codec,
                }
            }
            _ => return None,
        };

        let valid = match &locator {
            BulkLocator::Attribute {
                study, instance, ..
            } => is_valid_uid(study) && is_valid_uid(instance),
            BulkLocator::Frame { ids, .. } => Resource::Instance(ids.clone()).is_valid(),
        };
        valid.then_some(locator)
    }
}
