//! Read side: query, metadata, frame, bulk data and thumbnail retrieval.
//!
//! Everything here is a read of objects the ingest side wrote at
//! deterministic paths; no state is kept between calls.

use crate::attribute::json::{bulk_ref_from_json, element_string};
use crate::attribute::{check_uids, is_valid_uid, tags, BulkRef, InstanceIds};
use crate::bulk::OCTET_STREAM;
use crate::codec::CodecError;
use crate::layout::{self, BulkLocator, Resource};
use crate::merge::Aggregate;
use crate::projection::{check_version, decode_document, DocumentError, SeriesAggregate, StudyAggregate};
use crate::query::{QueryError, QueryFilter};
use crate::store::{ObjectStore, ObjectStoreError};
use crate::thumbnail::{FrameImage, RenderError, ThumbnailRenderer, THUMBNAIL_CONTENT_TYPE};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Concurrent object reads while scanning a level.
const SCAN_CONCURRENCY: usize = 16;

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Storage(ObjectStoreError),

    #[error("stored document {key} is unreadable: {source}")]
    Document {
        key: String,
        #[source]
        source: DocumentError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl RetrieveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RetrieveError::NotFound(_))
    }
}

impl From<ObjectStoreError> for RetrieveError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound { key } => RetrieveError::NotFound(key),
            ObjectStoreError::InvalidKey { key } => RetrieveError::InvalidIdentifier(key),
            other => RetrieveError::Storage(other),
        }
    }
}

/// Decoded bytes with the content type they were stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataDocument {
    Study(StudyAggregate),
    Series(SeriesAggregate),
    Instance(JsonValue),
}

impl MetadataDocument {
    pub fn to_json(&self) -> JsonValue {
        let value = match self {
            MetadataDocument::Study(study) => serde_json::to_value(study),
            MetadataDocument::Series(series) => serde_json::to_value(series),
            MetadataDocument::Instance(doc) => return doc.clone(),
        };
        value.unwrap_or(JsonValue::Null)
    }
}

/// One bulk attribute item stored for a study.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkListing {
    pub uri: String,
    pub sop_instance_uid: String,
    pub tag_path: String,
    pub codec: String,
}

pub struct ReadService {
    store: Arc<dyn ObjectStore>,
    renderer: Arc<dyn ThumbnailRenderer>,
}

fn check_resource(resource: &Resource) -> Result<(), RetrieveError> {
    if resource.is_valid() {
        Ok(())
    } else {
        Err(RetrieveError::InvalidIdentifier(format!("{:?}", resource)))
    }
}

impl ReadService {
    pub fn new(store: Arc<dyn ObjectStore>, renderer: Arc<dyn ThumbnailRenderer>) -> Self {
        Self { store, renderer }
    }

    async fn read_document<T: DeserializeOwned>(&self, key: &str) -> Result<T, RetrieveError> {
        let object = self.store.get(key).await?;
        decode_document(&object.bytes).map_err(|source| RetrieveError::Document {
            key: key.to_string(),
            source,
        })
    }

    async fn read_aggregate<T: Aggregate>(&self, key: &str) -> Result<T, RetrieveError> {
        let document: T = self.read_document(key).await?;
        check_version(document.schema_version()).map_err(|source| RetrieveError::Document {
            key: key.to_string(),
            source,
        })?;
        Ok(document)
    }

    /// Aggregates under each listed child, skipping ones not yet committed.
    async fn scan<T: Aggregate>(
        &self,
        children: Vec<String>,
        key_of: impl Fn(&str) -> String,
    ) -> Result<Vec<T>, RetrieveError> {
        let keys: Vec<String> = children.iter().filter(|c| is_valid_uid(c)).map(|c| key_of(c)).collect();
        let found: Vec<Option<T>> = stream::iter(keys)
            .map(|key| async move {
                match self.read_aggregate::<T>(&key).await {
                    Ok(document) => Ok(Some(document)),
                    Err(RetrieveError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .buffered(SCAN_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(found.into_iter().flatten().collect())
    }

    #[instrument(skip(self, filter))]
    pub async fn list_studies(&self, filter: &QueryFilter) -> Result<Vec<JsonValue>, RetrieveError> {
        let studies = self.store.list(&layout::studies_root()).await?;
        let aggregates: Vec<StudyAggregate> = self.scan(studies, layout::study_index).await?;
        debug!(studies = aggregates.len(), "Scanned study aggregates");
        Ok(filter.apply(aggregates.iter().map(StudyAggregate::render)))
    }

    #[instrument(skip(self, filter))]
    pub async fn list_series(&self, study: &str, filter: &QueryFilter) -> Result<Vec<JsonValue>, RetrieveError> {
        check_uids(&[study], RetrieveError::InvalidIdentifier)?;
        let children = self.store.list(&layout::series_root(study)).await?;
        let aggregates: Vec<SeriesAggregate> = self
            .scan(children, |series| layout::series_index(study, series))
            .await?;
        if aggregates.is_empty() {
            return Err(RetrieveError::NotFound(layout::study_dir(study)));
        }
        Ok(filter.apply(aggregates.iter().map(SeriesAggregate::render)))
    }

    #[instrument(skip(self, filter))]
    pub async fn list_instances(
        &self,
        study: &str,
        series: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<JsonValue>, RetrieveError> {
        check_uids(&[study, series], RetrieveError::InvalidIdentifier)?;
        let aggregate: SeriesAggregate = self.read_aggregate(&layout::series_index(study, series)).await?;
        Ok(filter.apply(aggregate.render_instances()))
    }

    #[instrument(skip(self))]
    pub async fn get_metadata(&self, resource: &Resource) -> Result<MetadataDocument, RetrieveError> {
        check_resource(resource)?;
        Ok(match resource {
            Resource::Study(study) => MetadataDocument::Study(self.read_aggregate(&layout::study_index(study)).await?),
            Resource::Series(study, series) => {
                MetadataDocument::Series(self.read_aggregate(&layout::series_index(study, series)).await?)
            }
            Resource::Instance(ids) => MetadataDocument::Instance(self.read_document(&layout::instance_metadata(ids)).await?),
        })
    }

    /// Instance documents of every committed instance in a series.
    #[instrument(skip(self))]
    pub async fn series_instance_metadata(&self, study: &str, series: &str) -> Result<Vec<JsonValue>, RetrieveError> {
        check_uids(&[study, series], RetrieveError::InvalidIdentifier)?;
        let aggregate: SeriesAggregate = self.read_aggregate(&layout::series_index(study, series)).await?;
        let keys: Vec<String> = aggregate
            .instances
            .into_keys()
            .map(|instance| layout::instance_metadata(&InstanceIds::new(study, series, instance)))
            .collect();
        stream::iter(keys)
            .map(|key| async move { self.read_document::<JsonValue>(&key).await })
            .buffered(SCAN_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn pixel_data(&self, ids: &InstanceIds) -> Result<(JsonValue, BulkRef, u32), RetrieveError> {
        let doc: JsonValue = self.read_document(&layout::instance_metadata(ids)).await?;
        let pixel = doc
            .get(tags::PIXEL_DATA.to_string())
            .and_then(bulk_ref_from_json)
            .ok_or_else(|| RetrieveError::NotFound(format!("pixel data of {}", ids.instance)))?;
        let frames = match pixel.frames {
            Some(frames) => frames,
            None => return Err(RetrieveError::NotFound(format!("frames of {}", ids.instance))),
        };
        Ok((doc, pixel, frames))
    }

    /// Frame `number` (1-based), decompressed.
    #[instrument(skip(self), fields(instance_uid = %ids.instance))]
    pub async fn get_frame(&self, ids: &InstanceIds, number: u32) -> Result<Payload, RetrieveError> {
        check_resource(&Resource::Instance(ids.clone()))?;
        let (_, pixel, frames) = self.pixel_data(ids).await?;
        self.read_frame(ids, &pixel, frames, number).await
    }

    /// Every frame of an instance, concatenated in frame order. Encapsulated
    /// frames keep their encoding.
    #[instrument(skip(self), fields(instance_uid = %ids.instance))]
    pub async fn get_pixel_data(&self, ids: &InstanceIds) -> Result<Payload, RetrieveError> {
        check_resource(&Resource::Instance(ids.clone()))?;
        let (_, pixel, frames) = self.pixel_data(ids).await?;
        let pixel = &pixel;
        let parts: Vec<Payload> = stream::iter(1..=frames)
            .map(move |number| self.read_frame(ids, pixel, frames, number))
            .buffered(SCAN_CONCURRENCY)
            .try_collect()
            .await?;

        let mut joined = BytesMut::with_capacity(parts.iter().map(|p| p.bytes.len()).sum());
        for part in &parts {
            joined.extend_from_slice(&part.bytes);
        }
        // Concatenated encoded frames no longer form one image.
        let content_type = if frames == 1 {
            pixel.content_type.clone()
        } else {
            OCTET_STREAM.to_string()
        };
        Ok(Payload {
            bytes: joined.freeze(),
            content_type,
        })
    }

    /// Render one frame (1-based) of an instance, uncached.
    #[instrument(skip(self), fields(instance_uid = %ids.instance))]
    pub async fn get_rendered(&self, ids: &InstanceIds, number: u32) -> Result<Payload, RetrieveError> {
        check_resource(&Resource::Instance(ids.clone()))?;
        let frame = self.frame_image(ids, Some(number)).await?;
        Ok(Payload {
            bytes: self.renderer.render(&frame).await?,
            content_type: THUMBNAIL_CONTENT_TYPE.to_string(),
        })
    }

    async fn read_frame(
        &self,
        ids: &InstanceIds,
        pixel: &BulkRef,
        frames: u32,
        number: u32,
    ) -> Result<Payload, RetrieveError> {
        if number == 0 || number > frames {
            return Err(RetrieveError::NotFound(format!(
                "frame {} of {} (has {})",
                number, ids.instance, frames
            )));
        }
        let object = self.store.get(&layout::frame(ids, number, pixel.codec)).await?;
        Ok(Payload {
            bytes: pixel.codec.decompress(&object.bytes)?,
            content_type: pixel.content_type.clone(),
        })
    }

    /// Bulk attribute items stored for a study, in key order.
    #[instrument(skip(self))]
    pub async fn list_bulk_data(&self, study: &str) -> Result<Vec<BulkListing>, RetrieveError> {
        check_uids(&[study], RetrieveError::InvalidIdentifier)?;
        let mut listings = Vec::new();
        for instance in self.store.list(&layout::bulk_root(study)).await? {
            let dir = layout::bulk_instance_dir(study, &instance);
            for name in self.store.list(&dir).await? {
                let key = format!("{}/{}", dir, name);
                if let Some(BulkLocator::Attribute { instance, path, codec, .. }) = BulkLocator::parse(&key) {
                    listings.push(BulkListing {
                        uri: key,
                        sop_instance_uid: instance,
                        tag_path: path.to_string(),
                        codec: codec.as_str().to_string(),
                    });
                }
            }
        }
        Ok(listings)
    }

    /// Resolve a bulk data URI (an attribute item or a frame key).
    #[instrument(skip(self))]
    pub async fn get_bulk_data(&self, uri: &str) -> Result<Payload, RetrieveError> {
        match BulkLocator::parse(uri) {
            Some(BulkLocator::Attribute { codec, .. }) => {
                let object = self.store.get(uri).await?;
                Ok(Payload {
                    bytes: codec.decompress(&object.bytes)?,
                    content_type: OCTET_STREAM.to_string(),
                })
            }
            Some(BulkLocator::Frame { ids, number, .. }) => self.get_frame(&ids, number).await,
            None => Err(RetrieveError::NotFound(uri.to_string())),
        }
    }

    /// Cached thumbnail, rendered and cached on first request.
    #[instrument(skip(self))]
    pub async fn get_thumbnail(&self, resource: &Resource) -> Result<Payload, RetrieveError> {
        check_resource(resource)?;
        let key = resource.thumbnail();
        match self.store.get(&key).await {
            Ok(object) => {
                return Ok(Payload {
                    bytes: object.bytes,
                    content_type: THUMBNAIL_CONTENT_TYPE.to_string(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let ids = self.representative_instance(resource).await?;
        let frame = self.frame_image(&ids, None).await?;
        let bytes = self.renderer.render(&frame).await?;

        // A failed cache write only costs a re-render next time.
        if let Err(e) = self.store.put(&key, bytes.clone()).await {
            warn!(key = %key, error = %e, "Failed to cache thumbnail");
        }
        Ok(Payload {
            bytes,
            content_type: THUMBNAIL_CONTENT_TYPE.to_string(),
        })
    }

    async fn representative_instance(&self, resource: &Resource) -> Result<InstanceIds, RetrieveError> {
        let (study, series) = match resource {
            Resource::Instance(ids) => return Ok(ids.clone()),
            Resource::Series(study, series) => (study.clone(), series.clone()),
            Resource::Study(study) => {
                let aggregate: StudyAggregate = self.read_aggregate(&layout::study_index(study)).await?;
                let series = aggregate
                    .series
                    .iter()
                    .find(|(_, summary)| summary.instance_count > 0)
                    .map(|(uid, _)| uid.clone())
                    .ok_or_else(|| RetrieveError::NotFound(format!("instances of study {}", study)))?;
                (study.clone(), series)
            }
        };

        let aggregate: SeriesAggregate = self.read_aggregate(&layout::series_index(&study, &series)).await?;
        // Lowest Instance Number, then lowest UID.
        let instance = aggregate
            .instances
            .iter()
            .min_by_key(|(uid, summary)| {
                let number = element_string(summary, tags::INSTANCE_NUMBER)
                    .and_then(|n| n.parse::<i64>().ok())
                    .unwrap_or(i64::MAX);
                (number, (*uid).clone())
            })
            .map(|(uid, _)| uid.clone())
            .ok_or_else(|| RetrieveError::NotFound(format!("instances of series {}", series)))?;
        Ok(InstanceIds::new(study, series, instance))
    }

    /// One frame of an instance with its geometry, the middle one when
    /// `number` is `None`.
    async fn frame_image(&self, ids: &InstanceIds, number: Option<u32>) -> Result<FrameImage, RetrieveError> {
        let (doc, pixel, frames) = self.pixel_data(ids).await?;
        let number = number.unwrap_or_else(|| frames.div_ceil(2).max(1));
        let payload = self.read_frame(ids, &pixel, frames, number).await?;
        let int = |tag| {
            element_string(&doc, tag)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };

        Ok(FrameImage {
            data: payload.bytes,
            content_type: payload.content_type,
            transfer_syntax: element_string(&doc, tags::AVAILABLE_TRANSFER_SYNTAX_UID).unwrap_or_default(),
            rows: int(tags::ROWS),
            columns: int(tags::COLUMNS),
            samples_per_pixel: int(tags::SAMPLES_PER_PIXEL).max(1),
            bits_allocated: int(tags::BITS_ALLOCATED),
            photometric_interpretation: element_string(&doc, tags::PHOTOMETRIC_INTERPRETATION),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Tag, Vr};
    use crate::config::{IngestConfig, QueryConfig};
    use crate::pipeline::IngestPipeline;
    use crate::query::QueryLevel;
    use crate::store::MemoryStore;
    use crate::test_support::InstanceBuilder;
    use crate::thumbnail::{EncodedFramePassthrough, MockThumbnailRenderer};

    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    fn query_config() -> QueryConfig {
        QueryConfig {
            default_limit: 100,
            max_limit: 1000,
        }
    }

    fn ct(series: &str, instance: &str, number: &str) -> InstanceBuilder {
        InstanceBuilder::new("1.2.3", series, instance)
            .text(tags::MODALITY, Vr::CS, "CT")
            .text(tags::PATIENT_NAME, Vr::PN, "Doe^Jane")
            .text(tags::STUDY_DATE, Vr::DA, "20240115")
            .text(tags::INSTANCE_NUMBER, Vr::IS, number)
    }

    fn jpeg(series: &str, instance: &str, number: &str, marker: u8) -> InstanceBuilder {
        ct(series, instance, number)
            .transfer_syntax(JPEG_BASELINE)
            .us(tags::ROWS, 8)
            .us(tags::COLUMNS, 8)
            .us(tags::BITS_ALLOCATED, 8)
            .encapsulated_pixels(vec![vec![0xFF, 0xD8, marker, 0xFF, 0xD9, 0]], false)
    }

    async fn ingest(store: &Arc<MemoryStore>, instances: Vec<InstanceBuilder>) {
        let pipeline = IngestPipeline::new(store.clone(), &IngestConfig::default());
        for instance in instances {
            pipeline.store_instance(instance.build()).await.unwrap();
        }
    }

    fn service(store: &Arc<MemoryStore>) -> ReadService {
        ReadService::new(store.clone(), Arc::new(EncodedFramePassthrough))
    }

    #[tokio::test]
    async fn test_query_levels() {
        let store = Arc::new(MemoryStore::new());
        ingest(
            &store,
            vec![
                ct("1.2.3.4", "1.2.3.4.1", "1"),
                ct("1.2.3.4", "1.2.3.4.2", "2"),
                ct("1.2.3.5", "1.2.3.5.1", "1").text(tags::MODALITY, Vr::CS, "MR"),
            ],
        )
        .await;
        let reader = service(&store);

        let studies = reader
            .list_studies(&QueryFilter::from_params(QueryLevel::Study, [("PatientName", "doe^*")], &query_config()).unwrap())
            .await
            .unwrap();
        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0]["00201208"]["Value"][0], 3);
        assert_eq!(studies[0]["00080061"]["Value"], serde_json::json!(["CT", "MR"]));

        let mr = reader
            .list_series(
                "1.2.3",
                &QueryFilter::from_params(QueryLevel::Series, [("Modality", "MR")], &query_config()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(mr.len(), 1);
        assert_eq!(mr[0]["0020000E"]["Value"][0], "1.2.3.5");

        let instances = reader
            .list_instances("1.2.3", "1.2.3.4", &QueryFilter::all(QueryLevel::Instance, &query_config()))
            .await
            .unwrap();
        assert_eq!(instances.len(), 2);

        assert!(reader
            .list_series("9.9", &QueryFilter::all(QueryLevel::Series, &query_config()))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            reader
                .list_instances("../x", "1", &QueryFilter::all(QueryLevel::Instance, &query_config()))
                .await,
            Err(RetrieveError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_levels() {
        let store = Arc::new(MemoryStore::new());
        ingest(&store, vec![ct("1.2.3.4", "1.2.3.4.1", "1"), ct("1.2.3.4", "1.2.3.4.2", "2")]).await;
        let reader = service(&store);

        match reader.get_metadata(&Resource::Study("1.2.3".into())).await.unwrap() {
            MetadataDocument::Study(study) => assert_eq!(study.instance_count(), 2),
            other => panic!("unexpected {:?}", other),
        }
        let ids = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.2");
        let instance = reader.get_metadata(&Resource::Instance(ids)).await.unwrap().to_json();
        assert_eq!(instance["00080018"]["Value"][0], "1.2.3.4.2");

        let series = reader.series_instance_metadata("1.2.3", "1.2.3.4").await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0]["00080018"]["Value"][0], "1.2.3.4.1");

        let missing = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.9");
        assert!(reader.get_metadata(&Resource::Instance(missing)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_frames_and_bulk_data_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let private = vec![0x42; 4096];
        ingest(
            &store,
            vec![ct("1.2.3.4", "1.2.3.4.1", "1")
                .binary(Tag(0x0009, 0x1010), Vr::OB, private.clone())
                .native_pixels(4, 4, 16, 3)],
        )
        .await;
        let reader = service(&store);
        let ids = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.1");

        let second = reader.get_frame(&ids, 2).await.unwrap();
        assert_eq!(second.content_type, "application/octet-stream");
        let expected: Vec<u8> = (32..64).map(|i| (i % 251) as u8).collect();
        assert_eq!(second.bytes.as_ref(), expected.as_slice());
        assert!(reader.get_frame(&ids, 4).await.unwrap_err().is_not_found());
        assert!(reader.get_frame(&ids, 0).await.unwrap_err().is_not_found());

        let listing = reader.list_bulk_data("1.2.3").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].tag_path, "00091010");
        let bulk = reader.get_bulk_data(&listing[0].uri).await.unwrap();
        assert_eq!(bulk.bytes.as_ref(), private.as_slice());

        let frame_uri = layout::frame(&ids, 3, crate::codec::Codec::Lz4);
        assert_eq!(reader.get_bulk_data(&frame_uri).await.unwrap().bytes.len(), 32);
        assert!(reader.get_bulk_data("studies/1.2.3/elsewhere").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_pixel_data_concatenates_frames() {
        let store = Arc::new(MemoryStore::new());
        ingest(
            &store,
            vec![
                ct("1.2.3.4", "1.2.3.4.1", "1").native_pixels(4, 4, 16, 3),
                jpeg("1.2.3.4", "1.2.3.4.2", "2", 7),
            ],
        )
        .await;
        let reader = service(&store);

        let native = reader
            .get_pixel_data(&InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.1"))
            .await
            .unwrap();
        let expected: Vec<u8> = (0..96).map(|i| (i % 251) as u8).collect();
        assert_eq!(native.bytes.as_ref(), expected.as_slice());
        assert_eq!(native.content_type, "application/octet-stream");

        let encoded = reader
            .get_pixel_data(&InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.2"))
            .await
            .unwrap();
        assert_eq!(encoded.bytes.as_ref(), &[0xFF, 0xD8, 7, 0xFF, 0xD9, 0]);
        assert_eq!(encoded.content_type, "image/jpeg");

        let missing = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.9");
        assert!(reader.get_pixel_data(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rendered_frame_goes_through_renderer() {
        let store = Arc::new(MemoryStore::new());
        ingest(
            &store,
            vec![
                jpeg("1.2.3.4", "1.2.3.4.1", "1", 3),
                ct("1.2.3.4", "1.2.3.4.2", "2").native_pixels(4, 4, 8, 1),
            ],
        )
        .await;
        let reader = service(&store);

        let jpeg_ids = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.1");
        let rendered = reader.get_rendered(&jpeg_ids, 1).await.unwrap();
        assert_eq!(rendered.bytes.as_ref(), &[0xFF, 0xD8, 3, 0xFF, 0xD9, 0]);
        assert_eq!(rendered.content_type, "image/jpeg");
        assert!(reader.get_rendered(&jpeg_ids, 2).await.unwrap_err().is_not_found());
        // Rendering never populates the thumbnail cache.
        assert!(!store.exists(&Resource::Instance(jpeg_ids).thumbnail()).await.unwrap());

        let native = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.2");
        assert!(matches!(
            reader.get_rendered(&native, 1).await,
            Err(RetrieveError::Render(RenderError::Unsupported(_)))
        ));
    }

    #[tokio::test]
    async fn test_thumbnail_rendered_once_then_cached() {
        let store = Arc::new(MemoryStore::new());
        ingest(
            &store,
            vec![jpeg("1.2.3.4", "1.2.3.4.2", "2", 2), jpeg("1.2.3.4", "1.2.3.4.1", "1", 1)],
        )
        .await;

        let mut renderer = MockThumbnailRenderer::new();
        renderer
            .expect_render()
            .withf(|frame| frame.content_type == "image/jpeg" && frame.rows == 8)
            .times(1)
            .returning(|frame| Ok(frame.data.clone()));
        let reader = ReadService::new(store.clone(), Arc::new(renderer));

        let series = Resource::Series("1.2.3".into(), "1.2.3.4".into());
        let first = reader.get_thumbnail(&series).await.unwrap();
        // Instance number 1 is the representative.
        assert_eq!(first.bytes.as_ref(), &[0xFF, 0xD8, 1, 0xFF, 0xD9, 0]);
        assert_eq!(first.content_type, "image/jpeg");

        let cached = reader.get_thumbnail(&series).await.unwrap();
        assert_eq!(cached, first);
        assert!(store.exists(&series.thumbnail()).await.unwrap());
    }

    #[tokio::test]
    async fn test_thumbnail_without_pixels_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        ingest(&store, vec![ct("1.2.3.4", "1.2.3.4.1", "1")]).await;
        let reader = service(&store);

        let err = reader.get_thumbnail(&Resource::Study("1.2.3".into())).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
