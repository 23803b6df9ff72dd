//! Ingestion pipeline.
//!
//! One instance moves through
//! `Received -> Split -> Projected -> BulkCommitted -> Merged -> Committed`,
//! or to `Failed` from any state. Nothing an instance references becomes
//! visible in an aggregate before every bulk item and the instance document
//! are durably stored; the series compare-and-swap is the commit point.
//!
//! Once the series write lands the instance is committed, so a failed study
//! propagation is reported in `IngestReport::study_updated` instead of
//! failing the instance. Resubmitting the instance or rebuilding the study
//! brings the study aggregate up to date.
//!
//! Dropping a pipeline future before `Merged` leaves at most unreferenced
//! bulk items and an unreferenced instance document, which repair collects.

use crate::attribute::{read_part10, AttributeError, InstanceIds};
use crate::bulk::{BulkItem, BulkSplitter, SplitError};
use crate::codec::CodecError;
use crate::config::IngestConfig;
use crate::layout;
use crate::merge::{MergeEngine, MergeError, MergeOutcome};
use crate::projection::{encode_document, instance_document, DocumentError, SeriesAggregate, StudyAggregate};
use crate::store::{ObjectStore, ObjectStoreError};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn, Span};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed instance: {0}")]
    Malformed(#[from] AttributeError),

    #[error("cannot determine frame boundaries: {0}")]
    FrameBoundary(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage failed on {key} after {attempts} attempts: {source}")]
    Storage {
        key: String,
        attempts: u32,
        #[source]
        source: ObjectStoreError,
    },

    #[error("merge contention on {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("unreadable document {key}: {source}")]
    Document {
        key: String,
        #[source]
        source: DocumentError,
    },

    #[error("ingest task aborted: {0}")]
    Aborted(String),

    #[error("ingest task panicked: {0}")]
    Panicked(String),
}

/// The error surface of `store_instance`.
pub type StoreError = IngestError;

impl IngestError {
    /// Resubmitting the same bytes may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Contention { .. } | IngestError::Aborted(_) => true,
            IngestError::Storage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// The input itself is at fault.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            IngestError::Malformed(_) | IngestError::FrameBoundary(_) | IngestError::Codec(_)
        )
    }
}

impl From<SplitError> for IngestError {
    fn from(err: SplitError) -> Self {
        match err {
            SplitError::FrameBoundary(reason) => IngestError::FrameBoundary(reason),
            SplitError::Codec(e) => IngestError::Codec(e),
        }
    }
}

impl From<MergeError> for IngestError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::Contention { key, attempts } => IngestError::Contention { key, attempts },
            MergeError::Storage(source) => IngestError::Storage {
                key: source.key().to_string(),
                attempts: 1,
                source,
            },
            MergeError::Document { key, source } => IngestError::Document { key, source },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IngestState {
    Received,
    Split,
    Projected,
    BulkCommitted,
    Merged,
    Committed,
    Failed(String),
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestState::Received => f.write_str("received"),
            IngestState::Split => f.write_str("split"),
            IngestState::Projected => f.write_str("projected"),
            IngestState::BulkCommitted => f.write_str("bulk_committed"),
            IngestState::Merged => f.write_str("merged"),
            IngestState::Committed => f.write_str("committed"),
            IngestState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome of one committed instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub state: IngestState,
    pub bulk_items: usize,
    pub frames: u32,
    /// Compare-and-swap attempts across the series and study merges.
    pub merge_attempts: u32,
    /// False when the instance was already part of its series.
    pub series_updated: bool,
    /// False when the study aggregate could not be brought up to date.
    pub study_updated: bool,
}

impl IngestReport {
    pub fn ids(&self) -> InstanceIds {
        InstanceIds::new(
            &self.study_instance_uid,
            &self.series_instance_uid,
            &self.sop_instance_uid,
        )
    }
}

/// Tracks and logs state transitions of one instance.
struct Progress {
    state: IngestState,
}

impl Progress {
    fn new() -> Self {
        debug!(state = %IngestState::Received, "Instance received");
        Self {
            state: IngestState::Received,
        }
    }

    fn advance(&mut self, next: IngestState) {
        debug!(from = %self.state, to = %next, "Ingest state transition");
        self.state = next;
    }

    fn fail(&mut self, err: &IngestError) {
        let from = std::mem::replace(&mut self.state, IngestState::Failed(err.to_string()));
        if matches!(from, IngestState::BulkCommitted) {
            warn!(error = %err, "Instance failed after bulk commit, bulk items left for repair");
        }
        warn!(from = %from, error = %err, transient = err.is_transient(), "Ingest failed");
    }
}

pub struct IngestPipeline {
    store: Arc<dyn ObjectStore>,
    splitter: BulkSplitter,
    merge: MergeEngine,
    concurrency: usize,
    io_attempts: u32,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, config: &IngestConfig) -> Self {
        Self {
            merge: MergeEngine::new(store.clone(), config),
            store,
            splitter: BulkSplitter::new(config.bulk_threshold_bytes),
            concurrency: config.concurrency.max(1),
            io_attempts: config.io_attempts.max(1),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
        }
    }

    /// Ingest one Part 10 instance.
    #[instrument(
        skip(self, raw),
        fields(
            size = raw.len(),
            study_uid = tracing::field::Empty,
            series_uid = tracing::field::Empty,
            instance_uid = tracing::field::Empty,
        )
    )]
    pub async fn store_instance(&self, raw: Bytes) -> Result<IngestReport, IngestError> {
        let started = Instant::now();
        let mut progress = Progress::new();

        match self.run(raw, &mut progress).await {
            Ok(report) => {
                counter!("dicomweb.instances.stored").increment(1);
                histogram!("dicomweb.ingest.duration_seconds").record(started.elapsed().as_secs_f64());
                info!(
                    bulk_items = report.bulk_items,
                    frames = report.frames,
                    merge_attempts = report.merge_attempts,
                    "Instance committed"
                );
                Ok(report)
            }
            Err(e) => {
                counter!("dicomweb.instances.failed").increment(1);
                progress.fail(&e);
                Err(e)
            }
        }
    }

    async fn run(&self, raw: Bytes, progress: &mut Progress) -> Result<IngestReport, IngestError> {
        // Parsing and compression are CPU bound.
        let splitter = self.splitter.clone();
        let (ids, split, transfer_syntax) = tokio::task::spawn_blocking(move || {
            let parsed = read_part10(raw)?;
            let ids = parsed.dataset.identifiers()?;
            let split = splitter.split(&ids, parsed.dataset, &parsed.transfer_syntax)?;
            Ok::<_, IngestError>((ids, split, parsed.transfer_syntax))
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                IngestError::Panicked(e.to_string())
            } else {
                IngestError::Aborted(e.to_string())
            }
        })??;

        let span = Span::current();
        span.record("study_uid", ids.study.as_str());
        span.record("series_uid", ids.series.as_str());
        span.record("instance_uid", ids.instance.as_str());
        progress.advance(IngestState::Split);

        let doc = instance_document(&split.inline, &transfer_syntax);
        let doc_key = layout::instance_metadata(&ids);
        let doc_bytes = encode_document(&doc).map_err(|source| IngestError::Document {
            key: doc_key.clone(),
            source,
        })?;
        progress.advance(IngestState::Projected);

        self.write_bulk(&split.items).await?;
        self.put_with_retry(&doc_key, doc_bytes).await?;
        progress.advance(IngestState::BulkCommitted);

        let series = self.merge.merge_instance(&ids, &doc).await?;
        progress.advance(IngestState::Merged);

        let study = self.propagate_to_study(&series.document).await;
        progress.advance(IngestState::Committed);

        Ok(IngestReport {
            study_instance_uid: ids.study,
            series_instance_uid: ids.series,
            sop_instance_uid: ids.instance,
            state: progress.state.clone(),
            bulk_items: split.items.len(),
            frames: split.frames,
            merge_attempts: series.attempts + study.as_ref().map_or(0, |s| s.attempts),
            series_updated: series.written,
            study_updated: study.is_some(),
        })
    }

    /// Fold the committed series into its study, retrying transient
    /// failures. `None` when the study aggregate is left behind.
    async fn propagate_to_study(&self, series: &SeriesAggregate) -> Option<MergeOutcome<StudyAggregate>> {
        let mut backoff = self.backoff();
        let mut attempt = 1;
        loop {
            match self.merge.merge_series_into_study(series).await {
                Ok(outcome) => return Some(outcome),
                Err(e) if e.is_transient() && attempt < self.io_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.backoff_max);
                    warn!(attempt, error = %e, "Study propagation failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    counter!("dicomweb.study.propagation_deferred").increment(1);
                    warn!(
                        study_uid = %series.study_instance_uid,
                        error = %e,
                        "Study aggregate left behind its series, resubmit or rebuild the study"
                    );
                    return None;
                }
            }
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.backoff_initial,
            max_interval: self.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Write every bulk item, `concurrency` at a time. The first failure
    /// cancels the rest.
    async fn write_bulk(&self, items: &[BulkItem]) -> Result<(), IngestError> {
        let writes: Vec<(String, Bytes)> = items.iter().map(|item| (item.key(), item.data.clone())).collect();
        let written: Vec<()> = stream::iter(writes)
            .map(|(key, data)| async move { self.put_with_retry(&key, data).await })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        counter!("dicomweb.bulk.items_written").increment(written.len() as u64);
        Ok(())
    }

    async fn put_with_retry(&self, key: &str, bytes: Bytes) -> Result<(), IngestError> {
        let mut backoff = self.backoff();

        let mut attempt = 1;
        loop {
            match self.store.put(key, bytes.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.io_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.backoff_max);
                    warn!(key = %key, attempt, error = %e, "Storage write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(IngestError::Storage {
                        key: key.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Ingest many instances, `concurrency` at a time. Results come back in
    /// input order and one failure never affects another instance.
    #[instrument(skip(self, instances), fields(count = instances.len()))]
    pub async fn store_batch(&self, instances: Vec<Bytes>) -> Vec<Result<IngestReport, IngestError>> {
        stream::iter(instances)
            .map(|raw| self.store_instance(raw))
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::json::bulk_ref_from_json;
    use crate::attribute::{tags, Tag, Vr};
    use crate::codec::Codec;
    use crate::projection::decode_document;
    use crate::store::MemoryStore;
    use crate::test_support::{FaultyStore, InstanceBuilder};
    use serde_json::Value as JsonValue;
    use std::sync::atomic::Ordering;

    fn config() -> IngestConfig {
        IngestConfig {
            backoff_initial_ms: 1,
            backoff_max_ms: 2,
            ..IngestConfig::default()
        }
    }

    fn instance(series: &str, instance: &str) -> InstanceBuilder {
        InstanceBuilder::new("1.2.3", series, instance)
            .text(tags::MODALITY, Vr::CS, "CT")
            .text(tags::PATIENT_NAME, Vr::PN, "Doe^Jane")
            .text(tags::STUDY_DATE, Vr::DA, "20240115")
    }

    async fn series_aggregate(store: &dyn ObjectStore, series: &str) -> SeriesAggregate {
        let object = store.get(&layout::series_index("1.2.3", series)).await.unwrap();
        decode_document(&object.bytes).unwrap()
    }

    async fn study_aggregate(store: &dyn ObjectStore) -> StudyAggregate {
        let object = store.get(&layout::study_index("1.2.3")).await.unwrap();
        decode_document(&object.bytes).unwrap()
    }

    #[tokio::test]
    async fn test_multiframe_instance_with_private_bulk() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());
        let private = vec![0x5A; 50 * 1024];
        let raw = instance("1.2.3.4", "1.2.3.4.5")
            .binary(Tag(0x0009, 0x1010), Vr::UN, private.clone())
            .native_pixels(16, 16, 8, 4)
            .build();

        let report = pipeline.store_instance(raw).await.unwrap();
        assert_eq!(report.state, IngestState::Committed);
        assert_eq!(report.frames, 4);
        assert_eq!(report.bulk_items, 5);

        let ids = report.ids();
        for n in 1..=4 {
            let frame = store.get(&layout::frame(&ids, n, Codec::Lz4)).await.unwrap();
            assert_eq!(Codec::Lz4.decompress(&frame.bytes).unwrap().len(), 256);
        }

        let doc_object = store.get(&layout::instance_metadata(&ids)).await.unwrap();
        let doc: JsonValue = decode_document(&doc_object.bytes).unwrap();
        let locator = bulk_ref_from_json(&doc["00091010"]).unwrap();
        let bulk = store.get(&locator.uri).await.unwrap();
        assert_eq!(locator.codec.decompress(&bulk.bytes).unwrap().as_ref(), private.as_slice());

        let series = series_aggregate(store.as_ref(), "1.2.3.4").await;
        assert!(series.contains("1.2.3.4.5"));
        assert_eq!(study_aggregate(store.as_ref()).await.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());
        let raw = instance("1.2.3.4", "1.2.3.4.5").native_pixels(4, 4, 8, 2).build();

        pipeline.store_instance(raw.clone()).await.unwrap();
        let keys = store.keys();
        let series = store.get(&layout::series_index("1.2.3", "1.2.3.4")).await.unwrap();
        let study = store.get(&layout::study_index("1.2.3")).await.unwrap();

        let again = pipeline.store_instance(raw).await.unwrap();
        assert!(!again.series_updated);
        assert_eq!(store.keys(), keys);
        assert_eq!(store.get(&layout::series_index("1.2.3", "1.2.3.4")).await.unwrap().bytes, series.bytes);
        assert_eq!(store.get(&layout::study_index("1.2.3")).await.unwrap().bytes, study.bytes);
    }

    #[tokio::test]
    async fn test_concurrent_ingest_of_the_same_instance() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(IngestPipeline::new(store.clone(), &config()));
        let raw = instance("1.2.3.4", "1.2.3.4.5").native_pixels(4, 4, 8, 3).build();

        let a = tokio::spawn({
            let (pipeline, raw) = (pipeline.clone(), raw.clone());
            async move { pipeline.store_instance(raw).await }
        });
        let b = tokio::spawn({
            let (pipeline, raw) = (pipeline.clone(), raw.clone());
            async move { pipeline.store_instance(raw).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let series = series_aggregate(store.as_ref(), "1.2.3.4").await;
        assert_eq!(series.instances.len(), 1);
        let frames = store
            .list(&layout::frames_dir(&InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.5")))
            .await
            .unwrap();
        assert_eq!(frames, vec!["1.lz4", "2.lz4", "3.lz4"]);
    }

    #[tokio::test]
    async fn test_forced_conflict_converges_to_union() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let pipeline = IngestPipeline::new(faulty.clone(), &config());

        pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.1").build())
            .await
            .unwrap();
        faulty.conflict_next(1);
        faulty.put_if_calls.store(0, Ordering::SeqCst);
        let report = pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.2").build())
            .await
            .unwrap();

        // One rejected series write, then the retry, then the study write.
        assert_eq!(faulty.put_if_calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.merge_attempts, 3);
        let series = series_aggregate(faulty.inner().as_ref(), "1.2.3.4").await;
        assert!(series.contains("1.2.3.4.1") && series.contains("1.2.3.4.2"));
    }

    #[tokio::test]
    async fn test_aggregates_only_grow() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());

        let mut previous: Vec<String> = Vec::new();
        for (series, inst) in [("1.2.3.4", "1.2.3.4.1"), ("1.2.3.5", "1.2.3.5.1"), ("1.2.3.4", "1.2.3.4.2")] {
            pipeline.store_instance(instance(series, inst).build()).await.unwrap();
            let study = study_aggregate(store.as_ref()).await;
            let current: Vec<String> = study.series.keys().cloned().collect();
            assert!(previous.iter().all(|s| current.contains(s)));
            previous = current;
        }

        let study = study_aggregate(store.as_ref()).await;
        assert_eq!(study.series.len(), 2);
        assert_eq!(study.instance_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_io_failure_is_retried() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let pipeline = IngestPipeline::new(faulty.clone(), &config());
        faulty.fail_next_puts(2);

        let report = pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.5").build())
            .await
            .unwrap();
        assert_eq!(report.state, IngestState::Committed);
    }

    #[tokio::test]
    async fn test_persistent_io_failure_fails_the_instance_only() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let pipeline = IngestPipeline::new(
            faulty.clone(),
            &IngestConfig {
                io_attempts: 2,
                ..config()
            },
        );
        faulty.fail_next_puts(2);

        let err = pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.5").build())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Storage { attempts: 2, .. }));
        assert!(err.is_transient());
        assert!(!faulty.inner().exists(&layout::series_index("1.2.3", "1.2.3.4")).await.unwrap());

        // The next instance is unaffected.
        pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.6").build())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_study_failure_after_series_commit_keeps_instance_committed() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let pipeline = IngestPipeline::new(faulty.clone(), &config());
        let study_key = layout::study_index("1.2.3");
        faulty.fail_next_put_ifs_on(&study_key, u32::MAX);

        let raw = instance("1.2.3.4", "1.2.3.4.5").build();
        let report = pipeline.store_instance(raw.clone()).await.unwrap();
        assert_eq!(report.state, IngestState::Committed);
        assert!(report.series_updated);
        assert!(!report.study_updated);

        // Series membership matches exactly the committed instances.
        let series = series_aggregate(faulty.inner().as_ref(), "1.2.3.4").await;
        assert_eq!(series.instances.len(), 1);
        assert!(series.contains("1.2.3.4.5"));
        assert!(!faulty.inner().exists(&study_key).await.unwrap());

        // Resubmitting brings the study aggregate up to date.
        faulty.fail_next_put_ifs_on(&study_key, 0);
        let again = pipeline.store_instance(raw).await.unwrap();
        assert!(!again.series_updated);
        assert!(again.study_updated);
        assert_eq!(study_aggregate(faulty.inner().as_ref()).await.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_study_failure_is_retried() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let pipeline = IngestPipeline::new(faulty.clone(), &config());
        faulty.fail_next_put_ifs_on(&layout::study_index("1.2.3"), 1);

        let report = pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.5").build())
            .await
            .unwrap();
        assert!(report.study_updated);
        assert_eq!(study_aggregate(faulty.inner().as_ref()).await.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_geometry_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());
        let raw = instance("1.2.3.4", "1.2.3.4.5")
            .native_pixels(4, 4, 8, 1)
            .us(tags::ROWS, u16::MAX)
            .us(tags::COLUMNS, u16::MAX)
            .us(tags::SAMPLES_PER_PIXEL, u16::MAX)
            .us(tags::BITS_ALLOCATED, 16)
            .text(tags::NUMBER_OF_FRAMES, Vr::IS, "2147483648")
            .build();

        let err = pipeline.store_instance(raw).await.unwrap_err();
        assert!(matches!(err, IngestError::FrameBoundary(_)));
        assert!(err.is_invalid_input());
        assert!(!err.is_transient());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_panicked_task_is_not_transient() {
        let err = IngestError::Panicked("splitter".to_string());
        assert!(!err.is_transient());
        assert!(!err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());

        let results = pipeline
            .store_batch(vec![
                instance("1.2.3.4", "1.2.3.4.1").build(),
                Bytes::from_static(b"not dicom"),
                instance("1.2.3.4", "1.2.3.4.2").build(),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().sop_instance_uid, "1.2.3.4.1");
        let err = results[1].as_ref().unwrap_err();
        assert!(err.is_invalid_input() && !err.is_transient());
        assert_eq!(results[2].as_ref().unwrap().sop_instance_uid, "1.2.3.4.2");
        assert_eq!(series_aggregate(store.as_ref(), "1.2.3.4").await.instances.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_identifier_is_malformed() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());
        let raw = InstanceBuilder::item()
            .text(tags::SOP_CLASS_UID, Vr::UI, "1.2.840.10008.5.1.4.1.1.7")
            .text(tags::SOP_INSTANCE_UID, Vr::UI, "1.2.3.4.5")
            .build();

        let err = pipeline.store_instance(raw).await.unwrap_err();
        assert!(matches!(err, IngestError::Malformed(AttributeError::Missing(_))));
        assert!(store.keys().is_empty());
    }
}
