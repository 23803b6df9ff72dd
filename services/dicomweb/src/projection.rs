//! Metadata projection.
//!
//! Instance documents are the DICOM JSON of an instance's inline attributes.
//! Series and study aggregates are folded from instance documents with
//! joins that are commutative, associative and idempotent, so replaying any
//! set of instance documents in any order yields the same aggregate.
//!
//! Each promoted tag is tracked as a small lattice: no instances seen,
//! uniform (the same element, or absence, on every instance) or mixed. Only
//! uniform present values are emitted at aggregate level.

use crate::attribute::json::{element_strings, to_json};
use crate::attribute::{tags, AttributeSet, InstanceIds, Tag, TransferSyntax};
use crate::codec::{Codec, CodecError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const PROJECTION_VERSION: u32 = 1;

/// Which tags are promoted to which level.
#[derive(Debug)]
pub struct ProjectionSchema {
    pub version: u32,
    /// Promoted to study level when uniform across the whole study.
    pub study_tags: &'static [Tag],
    /// Promoted to series level when uniform across the series.
    pub series_tags: &'static [Tag],
    /// Copied into each instance's summary inside its series aggregate.
    pub instance_tags: &'static [Tag],
}

pub static SCHEMA: ProjectionSchema = ProjectionSchema {
    version: PROJECTION_VERSION,
    study_tags: &[
        tags::STUDY_DATE,
        tags::STUDY_TIME,
        tags::ACCESSION_NUMBER,
        tags::REFERRING_PHYSICIAN_NAME,
        tags::STUDY_DESCRIPTION,
        tags::PATIENT_NAME,
        tags::PATIENT_ID,
        tags::ISSUER_OF_PATIENT_ID,
        tags::PATIENT_BIRTH_DATE,
        tags::PATIENT_SEX,
        tags::STUDY_INSTANCE_UID,
        tags::STUDY_ID,
    ],
    series_tags: &[
        tags::SERIES_DATE,
        tags::SERIES_TIME,
        tags::MODALITY,
        tags::SERIES_DESCRIPTION,
        tags::BODY_PART_EXAMINED,
        tags::SERIES_INSTANCE_UID,
        tags::SERIES_NUMBER,
        tags::PERFORMED_PROCEDURE_STEP_START_DATE,
    ],
    instance_tags: &[
        tags::SOP_CLASS_UID,
        tags::SOP_INSTANCE_UID,
        tags::MODALITY,
        tags::AVAILABLE_TRANSFER_SYNTAX_UID,
        tags::INSTANCE_NUMBER,
        tags::SAMPLES_PER_PIXEL,
        tags::PHOTOMETRIC_INTERPRETATION,
        tags::NUMBER_OF_FRAMES,
        tags::ROWS,
        tags::COLUMNS,
        tags::BITS_ALLOCATED,
    ],
};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("document schema version {found} is not supported (expected {supported})")]
    SchemaVersion { found: u32, supported: u32 },
}

/// Serialize and compress a document. Identical values give identical bytes.
pub fn encode_document<T: Serialize>(document: &T) -> Result<Bytes, DocumentError> {
    let json = serde_json::to_vec(document)?;
    Ok(Codec::Zstd.compress(&json)?)
}

pub fn decode_document<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DocumentError> {
    let json = Codec::Zstd.decompress(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

/// The instance document: inline attributes plus the transfer syntax the
/// instance was received in.
pub fn instance_document(inline: &AttributeSet, transfer_syntax: &TransferSyntax) -> JsonValue {
    let mut doc = to_json(inline);
    if let JsonValue::Object(object) = &mut doc {
        object.insert(
            tags::AVAILABLE_TRANSFER_SYNTAX_UID.to_string(),
            json!({ "vr": "UI", "Value": [transfer_syntax.uid()] }),
        );
    }
    doc
}

/// The subset of `doc` named by `tags`.
fn select(doc: &JsonValue, tags: &[Tag]) -> Map<String, JsonValue> {
    tags.iter()
        .filter_map(|tag| {
            let key = tag.to_string();
            doc.get(&key).map(|element| (key, element.clone()))
        })
        .collect()
}

pub fn instance_summary(doc: &JsonValue) -> JsonValue {
    JsonValue::Object(select(doc, SCHEMA.instance_tags))
}

/// Lattice state of promoted tags over a non-empty set of instances.
///
/// A tag in `attributes` has that element on every instance; a tag in
/// `mixed` differs between instances; a tag in neither is absent from all.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromotedTags {
    pub attributes: BTreeMap<String, JsonValue>,
    pub mixed: BTreeSet<String>,
}

impl PromotedTags {
    fn from_document(doc: &JsonValue, tags: &[Tag]) -> Self {
        Self {
            attributes: select(doc, tags).into_iter().collect(),
            mixed: BTreeSet::new(),
        }
    }

    fn restrict(&self, tags: &[Tag]) -> Self {
        let keys: BTreeSet<String> = tags.iter().map(Tag::to_string).collect();
        Self {
            attributes: self
                .attributes
                .iter()
                .filter(|(k, _)| keys.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            mixed: self.mixed.intersection(&keys).cloned().collect(),
        }
    }

    fn join(&self, other: &Self) -> Self {
        let mut mixed: BTreeSet<String> = self.mixed.union(&other.mixed).cloned().collect();
        let mut attributes = BTreeMap::new();
        let keys: BTreeSet<&String> = self.attributes.keys().chain(other.attributes.keys()).collect();
        for key in keys {
            if mixed.contains(key) {
                continue;
            }
            match (self.attributes.get(key), other.attributes.get(key)) {
                (Some(a), Some(b)) if a == b => {
                    attributes.insert(key.clone(), a.clone());
                }
                _ => {
                    mixed.insert(key.clone());
                }
            }
        }
        Self { attributes, mixed }
    }
}

/// Join where an empty side (no instances) is the identity.
fn join_states(a: &PromotedTags, a_empty: bool, b: &PromotedTags, b_empty: bool) -> PromotedTags {
    match (a_empty, b_empty) {
        (true, _) => b.clone(),
        (_, true) => a.clone(),
        _ => a.join(b),
    }
}

/// Larger of two values by serialized form, a total order on JSON.
fn max_json(a: &JsonValue, b: &JsonValue) -> JsonValue {
    if a.to_string() >= b.to_string() {
        a.clone()
    } else {
        b.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesAggregate {
    pub schema_version: u32,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    /// Study- and series-level promoted tags.
    #[serde(flatten)]
    pub promoted: PromotedTags,
    /// Instance summaries keyed by SOP Instance UID.
    pub instances: BTreeMap<String, JsonValue>,
}

impl SeriesAggregate {
    pub fn empty(study: &str, series: &str) -> Self {
        Self {
            schema_version: PROJECTION_VERSION,
            study_instance_uid: study.to_string(),
            series_instance_uid: series.to_string(),
            promoted: PromotedTags::default(),
            instances: BTreeMap::new(),
        }
    }

    pub fn from_instance(ids: &InstanceIds, doc: &JsonValue) -> Self {
        let promoted_tags: Vec<Tag> = SCHEMA
            .study_tags
            .iter()
            .chain(SCHEMA.series_tags)
            .copied()
            .collect();
        let mut aggregate = Self::empty(&ids.study, &ids.series);
        aggregate.promoted = PromotedTags::from_document(doc, &promoted_tags);
        aggregate
            .instances
            .insert(ids.instance.clone(), instance_summary(doc));
        aggregate
    }

    pub fn join(&self, other: &Self) -> Self {
        let mut instances = self.instances.clone();
        for (uid, summary) in &other.instances {
            let merged = match instances.get(uid) {
                Some(existing) => max_json(existing, summary),
                None => summary.clone(),
            };
            instances.insert(uid.clone(), merged);
        }

        Self {
            schema_version: self.schema_version.max(other.schema_version),
            study_instance_uid: self.study_instance_uid.clone(),
            series_instance_uid: self.series_instance_uid.clone(),
            promoted: join_states(
                &self.promoted,
                self.instances.is_empty(),
                &other.promoted,
                other.instances.is_empty(),
            ),
            instances,
        }
    }

    pub fn with_instance(&self, ids: &InstanceIds, doc: &JsonValue) -> Self {
        self.join(&Self::from_instance(ids, doc))
    }

    pub fn contains(&self, instance: &str) -> bool {
        self.instances.contains_key(instance)
    }

    /// This series' entry in its study aggregate.
    pub fn summary(&self) -> SeriesSummary {
        let series_level = self.promoted.restrict(SCHEMA.series_tags);
        let modalities = self
            .instances
            .values()
            .flat_map(|summary| element_strings(summary, tags::MODALITY))
            .filter(|m| !m.is_empty())
            .collect();
        SeriesSummary {
            instance_count: self.instances.len(),
            modalities,
            attributes: series_level.attributes,
        }
    }

    /// QIDO series-level object.
    pub fn render(&self) -> JsonValue {
        let mut object: Map<String, JsonValue> = self
            .promoted
            .restrict(SCHEMA.series_tags)
            .attributes
            .into_iter()
            .collect();
        insert_uid(&mut object, tags::STUDY_INSTANCE_UID, &self.study_instance_uid);
        insert_uid(&mut object, tags::SERIES_INSTANCE_UID, &self.series_instance_uid);
        insert_count(&mut object, tags::NUMBER_OF_SERIES_RELATED_INSTANCES, self.instances.len());
        JsonValue::Object(object)
    }

    /// QIDO instance-level objects, in SOP Instance UID order.
    pub fn render_instances(&self) -> Vec<JsonValue> {
        self.instances
            .values()
            .map(|summary| {
                let mut object = summary.as_object().cloned().unwrap_or_default();
                insert_uid(&mut object, tags::STUDY_INSTANCE_UID, &self.study_instance_uid);
                insert_uid(&mut object, tags::SERIES_INSTANCE_UID, &self.series_instance_uid);
                JsonValue::Object(object)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSummary {
    pub instance_count: usize,
    pub modalities: BTreeSet<String>,
    /// Uniform series-level attributes as DICOM JSON elements.
    pub attributes: BTreeMap<String, JsonValue>,
}

impl SeriesSummary {
    /// Summaries only grow as instances arrive; ties break on content.
    fn max(&self, other: &Self) -> Self {
        let key = |s: &Self| (s.instance_count, serde_json::to_string(s).unwrap_or_default());
        if key(self) >= key(other) {
            self.clone()
        } else {
            other.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyAggregate {
    pub schema_version: u32,
    pub study_instance_uid: String,
    /// Study-level promoted tags, joined across series.
    #[serde(flatten)]
    pub promoted: PromotedTags,
    pub series: BTreeMap<String, SeriesSummary>,
}

impl StudyAggregate {
    pub fn empty(study: &str) -> Self {
        Self {
            schema_version: PROJECTION_VERSION,
            study_instance_uid: study.to_string(),
            promoted: PromotedTags::default(),
            series: BTreeMap::new(),
        }
    }

    pub fn from_series(series: &SeriesAggregate) -> Self {
        let mut study = Self::empty(&series.study_instance_uid);
        if series.instances.is_empty() {
            return study;
        }
        study.promoted = series.promoted.restrict(SCHEMA.study_tags);
        study
            .series
            .insert(series.series_instance_uid.clone(), series.summary());
        study
    }

    pub fn join(&self, other: &Self) -> Self {
        let mut series = self.series.clone();
        for (uid, summary) in &other.series {
            let merged = match series.get(uid) {
                Some(existing) => existing.max(summary),
                None => summary.clone(),
            };
            series.insert(uid.clone(), merged);
        }

        Self {
            schema_version: self.schema_version.max(other.schema_version),
            study_instance_uid: self.study_instance_uid.clone(),
            promoted: join_states(
                &self.promoted,
                self.series.is_empty(),
                &other.promoted,
                other.series.is_empty(),
            ),
            series,
        }
    }

    pub fn with_series(&self, series: &SeriesAggregate) -> Self {
        self.join(&Self::from_series(series))
    }

    pub fn instance_count(&self) -> usize {
        self.series.values().map(|s| s.instance_count).sum()
    }

    /// QIDO study-level object with the derived count and modality fields.
    pub fn render(&self) -> JsonValue {
        let mut object: Map<String, JsonValue> = self.promoted.attributes.clone().into_iter().collect();
        insert_uid(&mut object, tags::STUDY_INSTANCE_UID, &self.study_instance_uid);

        let modalities: BTreeSet<&String> = self.series.values().flat_map(|s| &s.modalities).collect();
        if !modalities.is_empty() {
            object.insert(
                tags::MODALITIES_IN_STUDY.to_string(),
                json!({ "vr": "CS", "Value": modalities }),
            );
        }
        insert_count(&mut object, tags::NUMBER_OF_STUDY_RELATED_SERIES, self.series.len());
        insert_count(&mut object, tags::NUMBER_OF_STUDY_RELATED_INSTANCES, self.instance_count());
        JsonValue::Object(object)
    }
}

fn insert_uid(object: &mut Map<String, JsonValue>, tag: Tag, uid: &str) {
    object.insert(tag.to_string(), json!({ "vr": "UI", "Value": [uid] }));
}

fn insert_count(object: &mut Map<String, JsonValue>, tag: Tag, count: usize) {
    object.insert(tag.to_string(), json!({ "vr": "IS", "Value": [count] }));
}

/// Check a stored document's schema version.
pub fn check_version(found: u32) -> Result<(), DocumentError> {
    if found == PROJECTION_VERSION {
        Ok(())
    } else {
        Err(DocumentError::SchemaVersion {
            found,
            supported: PROJECTION_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(instance: &str, modality: &str, description: Option<&str>) -> (InstanceIds, JsonValue) {
        let mut doc = json!({
            "00080016": { "vr": "UI", "Value": ["1.2.840.10008.5.1.4.1.1.2"] },
            "00080018": { "vr": "UI", "Value": [instance] },
            "00080020": { "vr": "DA", "Value": ["20240115"] },
            "00080060": { "vr": "CS", "Value": [modality] },
            "00100010": { "vr": "PN", "Value": [{ "Alphabetic": "Doe^Jane" }] },
            "0020000D": { "vr": "UI", "Value": ["1.2.3"] },
            "0020000E": { "vr": "UI", "Value": ["1.2.3.4"] },
            "00200013": { "vr": "IS", "Value": [1] },
        });
        if let Some(description) = description {
            doc["0008103E"] = json!({ "vr": "LO", "Value": [description] });
        }
        (InstanceIds::new("1.2.3", "1.2.3.4", instance), doc)
    }

    fn series_of(docs: &[(InstanceIds, JsonValue)]) -> SeriesAggregate {
        docs.iter().fold(SeriesAggregate::empty("1.2.3", "1.2.3.4"), |agg, (ids, doc)| {
            agg.with_instance(ids, doc)
        })
    }

    #[test]
    fn test_uniform_tags_are_promoted() {
        let series = series_of(&[doc("1", "CT", Some("Axial")), doc("2", "CT", Some("Axial"))]);
        assert_eq!(series.instances.len(), 2);
        assert!(series.promoted.attributes.contains_key("00080060"));
        assert!(series.promoted.attributes.contains_key("0008103E"));
        assert!(series.promoted.mixed.is_empty());
    }

    #[test]
    fn test_differing_or_missing_tags_become_mixed() {
        let series = series_of(&[
            doc("1", "CT", Some("Axial")),
            doc("2", "MR", None),
        ]);
        assert!(!series.promoted.attributes.contains_key("00080060"));
        assert!(series.promoted.mixed.contains("00080060"));
        assert!(series.promoted.mixed.contains("0008103E"));
        // Still uniform across both.
        assert!(series.promoted.attributes.contains_key("00100010"));

        let rendered = series.render();
        assert!(rendered.get("00080060").is_none());
        assert_eq!(rendered["00201209"]["Value"][0], 2);
    }

    #[test]
    fn test_study_aggregate_derived_fields() {
        let ct = series_of(&[doc("1", "CT", None), doc("2", "CT", None)]);
        let mut mr = series_of(&[doc("3", "MR", None)]);
        mr.series_instance_uid = "1.2.3.5".into();

        let study = StudyAggregate::empty("1.2.3").with_series(&ct).with_series(&mr);
        let rendered = study.render();
        assert_eq!(rendered["00080061"]["Value"], json!(["CT", "MR"]));
        assert_eq!(rendered["00201206"]["Value"][0], 2);
        assert_eq!(rendered["00201208"]["Value"][0], 3);
        assert_eq!(rendered["00080020"]["Value"][0], "20240115");
    }

    #[test]
    fn test_study_keeps_latest_series_summary() {
        let one = series_of(&[doc("1", "CT", None)]);
        let two = series_of(&[doc("1", "CT", None), doc("2", "CT", None)]);

        let a = StudyAggregate::empty("1.2.3").with_series(&two).with_series(&one);
        let b = StudyAggregate::empty("1.2.3").with_series(&one).with_series(&two);
        assert_eq!(a, b);
        assert_eq!(a.instance_count(), 2);
    }

    #[test]
    fn test_instance_document_is_deterministic() {
        let (_, d) = doc("1", "CT", None);
        let set = crate::attribute::json::from_json(&d).unwrap();
        let ts = TransferSyntax::new("1.2.840.10008.1.2.1");
        let first = encode_document(&instance_document(&set, &ts)).unwrap();
        let second = encode_document(&instance_document(&set, &ts)).unwrap();
        assert_eq!(first, second);

        let decoded: JsonValue = decode_document(&first).unwrap();
        assert_eq!(decoded["00083002"]["Value"][0], "1.2.840.10008.1.2.1");
    }

    #[test]
    fn test_aggregate_documents_round_trip() {
        let series = series_of(&[doc("1", "CT", Some("Axial")), doc("2", "MR", None)]);
        let decoded: SeriesAggregate = decode_document(&encode_document(&series).unwrap()).unwrap();
        assert_eq!(decoded, series);
        assert!(check_version(decoded.schema_version).is_ok());
        assert!(check_version(2).is_err());
    }

    fn arbitrary_doc() -> impl Strategy<Value = (InstanceIds, JsonValue)> {
        (0u8..6, prop::sample::select(vec!["CT", "MR"]), prop::option::of(Just("Axial")))
            .prop_map(|(n, modality, description)| doc(&n.to_string(), modality, description))
    }

    proptest! {
        #[test]
        fn prop_series_join_ignores_order(docs in prop::collection::vec(arbitrary_doc(), 1..8)) {
            let forward = series_of(&docs);
            let mut reversed_docs = docs.clone();
            reversed_docs.reverse();
            let reversed = series_of(&reversed_docs);
            prop_assert_eq!(&forward, &reversed);

            // Idempotent and associative under regrouping.
            prop_assert_eq!(forward.join(&forward), forward.clone());
            let (left, right) = docs.split_at(docs.len() / 2);
            prop_assert_eq!(series_of(left).join(&series_of(right)), forward.clone());

            prop_assert_eq!(
                encode_document(&forward).unwrap(),
                encode_document(&reversed).unwrap()
            );
        }
    }
}
