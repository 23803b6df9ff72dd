//! Aggregate rebuild and orphan collection.
//!
//! Aggregates are derived data: replaying every stored instance document
//! reproduces them. Rebuilds go through the same compare-and-swap loop as
//! ingestion and never drop an instance a concurrent writer committed.
//!
//! Orphans are objects left by an instance that never reached its series
//! aggregate (crash or cancellation after bulk commit). Collecting them is
//! only safe while nothing is ingesting into the study, since an in-flight
//! instance looks exactly like an orphan until its merge lands.

use crate::attribute::{check_uids, is_valid_uid, InstanceIds};
use crate::config::IngestConfig;
use crate::layout::{self, BulkLocator};
use crate::merge::{MergeEngine, MergeError};
use crate::projection::{decode_document, DocumentError, SeriesAggregate, StudyAggregate};
use crate::store::{ObjectStore, ObjectStoreError};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Storage(#[from] ObjectStoreError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("instance document {key} is unreadable: {source}")]
    Document {
        key: String,
        #[source]
        source: DocumentError,
    },

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("nothing stored for study {0}")]
    NotFound(String),
}

impl RepairError {
    /// Running the repair again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RepairError::Storage(e) => e.is_transient(),
            RepairError::Merge(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub struct Repair {
    store: Arc<dyn ObjectStore>,
    merge: MergeEngine,
}

impl Repair {
    pub fn new(store: Arc<dyn ObjectStore>, config: &IngestConfig) -> Self {
        Self {
            merge: MergeEngine::new(store.clone(), config),
            store,
        }
    }

    /// Recompute a series aggregate from its instance documents.
    #[instrument(skip(self))]
    pub async fn rebuild_series(&self, study: &str, series: &str) -> Result<SeriesAggregate, RepairError> {
        check_uids(&[study, series], RepairError::InvalidIdentifier)?;

        let mut rebuilt = SeriesAggregate::empty(study, series);
        for instance in self.store.list(&layout::instances_root(study, series)).await? {
            if !is_valid_uid(&instance) {
                continue;
            }
            let ids = InstanceIds::new(study, series, instance);
            let key = layout::instance_metadata(&ids);
            let object = match self.store.get(&key).await {
                Ok(object) => object,
                // Bulk written but no document: an orphan, not an instance.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let doc: JsonValue =
                decode_document(&object.bytes).map_err(|source| RepairError::Document { key, source })?;
            rebuilt = rebuilt.with_instance(&ids, &doc);
        }

        let outcome = self
            .merge
            .update(
                &layout::series_index(study, series),
                || SeriesAggregate::empty(study, series),
                |current| {
                    // Keep instances merged since the listing above.
                    if current.instances.keys().all(|uid| rebuilt.contains(uid)) {
                        rebuilt.clone()
                    } else {
                        rebuilt.join(current)
                    }
                },
            )
            .await?;

        info!(
            instances = outcome.document.instances.len(),
            written = outcome.written,
            "Series aggregate rebuilt"
        );
        Ok(outcome.document)
    }

    /// Rebuild every series of a study, then the study aggregate from them.
    #[instrument(skip(self))]
    pub async fn rebuild_study(&self, study: &str) -> Result<StudyAggregate, RepairError> {
        check_uids(&[study], RepairError::InvalidIdentifier)?;

        let children = self.store.list(&layout::series_root(study)).await?;
        if children.is_empty() {
            return Err(RepairError::NotFound(study.to_string()));
        }

        let mut rebuilt = StudyAggregate::empty(study);
        for series in children {
            if !is_valid_uid(&series) {
                continue;
            }
            let aggregate = self.rebuild_series(study, &series).await?;
            rebuilt = rebuilt.with_series(&aggregate);
        }

        let outcome = self
            .merge
            .update(
                &layout::study_index(study),
                || StudyAggregate::empty(study),
                |current| {
                    if current.series.keys().all(|uid| rebuilt.series.contains_key(uid)) {
                        rebuilt.clone()
                    } else {
                        rebuilt.join(current)
                    }
                },
            )
            .await?;

        info!(
            series = outcome.document.series.len(),
            instances = outcome.document.instance_count(),
            "Study aggregate rebuilt"
        );
        Ok(outcome.document)
    }

    /// Keys of objects belonging to instances absent from their series
    /// aggregate, sorted.
    #[instrument(skip(self))]
    pub async fn find_orphans(&self, study: &str) -> Result<Vec<String>, RepairError> {
        check_uids(&[study], RepairError::InvalidIdentifier)?;
        let mut orphans = BTreeSet::new();
        let mut committed = BTreeSet::new();

        for series in self.store.list(&layout::series_root(study)).await? {
            if !is_valid_uid(&series) {
                continue;
            }
            let members: BTreeSet<String> = match self.store.get(&layout::series_index(study, &series)).await {
                Ok(object) => {
                    let aggregate: SeriesAggregate = decode_document(&object.bytes).map_err(|source| {
                        RepairError::Document {
                            key: layout::series_index(study, &series),
                            source,
                        }
                    })?;
                    aggregate.instances.into_keys().collect()
                }
                Err(e) if e.is_not_found() => BTreeSet::new(),
                Err(e) => return Err(e.into()),
            };

            for instance in self.store.list(&layout::instances_root(study, &series)).await? {
                if members.contains(&instance) {
                    continue;
                }
                let ids = InstanceIds::new(study, series.as_str(), instance);
                self.collect_instance_dir(&ids, &mut orphans).await?;
            }
            committed.extend(members);
        }

        for instance in self.store.list(&layout::bulk_root(study)).await? {
            if committed.contains(&instance) {
                continue;
            }
            let dir = layout::bulk_instance_dir(study, &instance);
            for name in self.store.list(&dir).await? {
                let key = format!("{}/{}", dir, name);
                if BulkLocator::parse(&key).is_some() {
                    orphans.insert(key);
                }
            }
        }

        Ok(orphans.into_iter().collect())
    }

    async fn collect_instance_dir(&self, ids: &InstanceIds, out: &mut BTreeSet<String>) -> Result<(), RepairError> {
        let dir = layout::instance_dir(ids);
        for name in self.store.list(&dir).await? {
            if name == "frames" {
                let frames = layout::frames_dir(ids);
                for frame in self.store.list(&frames).await? {
                    out.insert(format!("{}/{}", frames, frame));
                }
            } else {
                out.insert(format!("{}/{}", dir, name));
            }
        }
        Ok(())
    }

    /// Delete what [`Repair::find_orphans`] reports; returns deleted keys.
    #[instrument(skip(self))]
    pub async fn collect_orphans(&self, study: &str) -> Result<Vec<String>, RepairError> {
        let orphans = self.find_orphans(study).await?;
        for key in &orphans {
            self.store.delete(key).await?;
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Deleted orphaned objects");
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{tags, Vr};
    use crate::pipeline::IngestPipeline;
    use crate::projection::encode_document;
    use crate::store::MemoryStore;
    use crate::test_support::InstanceBuilder;

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
            .native_pixels(4, 4, 8, 2)
    }

    async fn setup() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), &config());
        for (series, inst) in [("1.2.3.4", "1.2.3.4.1"), ("1.2.3.4", "1.2.3.4.2"), ("1.2.3.5", "1.2.3.5.1")] {
            pipeline.store_instance(instance(series, inst).build()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_rebuild_reproduces_aggregates() {
        let store = setup().await;
        let series_before = store.get(&layout::series_index("1.2.3", "1.2.3.4")).await.unwrap().bytes;
        let study_before = store.get(&layout::study_index("1.2.3")).await.unwrap().bytes;

        store.delete(&layout::series_index("1.2.3", "1.2.3.4")).await.unwrap();
        store.delete(&layout::study_index("1.2.3")).await.unwrap();

        let repair = Repair::new(store.clone(), &config());
        let study = repair.rebuild_study("1.2.3").await.unwrap();
        assert_eq!(study.instance_count(), 3);
        assert_eq!(store.get(&layout::series_index("1.2.3", "1.2.3.4")).await.unwrap().bytes, series_before);
        assert_eq!(store.get(&layout::study_index("1.2.3")).await.unwrap().bytes, study_before);
    }

    #[tokio::test]
    async fn test_rebuild_clears_stale_mixed_state() {
        let store = setup().await;
        let key = layout::series_index("1.2.3", "1.2.3.4");
        let mut stale: SeriesAggregate = decode_document(&store.get(&key).await.unwrap().bytes).unwrap();
        stale.promoted.attributes.remove("00080060");
        stale.promoted.mixed.insert("00080060".to_string());
        store.put(&key, encode_document(&stale).unwrap()).await.unwrap();

        let repair = Repair::new(store.clone(), &config());
        let rebuilt = repair.rebuild_series("1.2.3", "1.2.3.4").await.unwrap();
        assert!(rebuilt.promoted.mixed.is_empty());
        assert!(rebuilt.promoted.attributes.contains_key("00080060"));
    }

    #[tokio::test]
    async fn test_orphans_found_and_collected() {
        let store = setup().await;
        // Bulk and frames of an instance that never merged.
        let ghost = InstanceIds::new("1.2.3", "1.2.3.4", "1.2.3.4.9");
        store
            .put(&layout::frame(&ghost, 1, crate::codec::Codec::Lz4), "x".into())
            .await
            .unwrap();
        let bulk_key = format!("{}/00091010.zst", layout::bulk_instance_dir("1.2.3", "1.2.3.4.9"));
        store.put(&bulk_key, "y".into()).await.unwrap();

        let repair = Repair::new(store.clone(), &config());
        let orphans = repair.find_orphans("1.2.3").await.unwrap();
        assert_eq!(
            orphans,
            vec![
                bulk_key.clone(),
                "studies/1.2.3/series/1.2.3.4/instances/1.2.3.4.9/frames/1.lz4".to_string(),
            ]
        );

        let committed_before = store.keys().len();
        assert_eq!(repair.collect_orphans("1.2.3").await.unwrap().len(), 2);
        assert_eq!(store.keys().len(), committed_before - 2);
        assert!(repair.find_orphans("1.2.3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_adopts_unmerged_instance_document() {
        let store = setup().await;
        let pipeline = IngestPipeline::new(store.clone(), &config());
        pipeline
            .store_instance(instance("1.2.3.4", "1.2.3.4.3").build())
            .await
            .unwrap();
        // Roll the series back to before the third instance merged.
        let repair = Repair::new(store.clone(), &config());
        let key = layout::series_index("1.2.3", "1.2.3.4");
        let mut older: SeriesAggregate = decode_document(&store.get(&key).await.unwrap().bytes).unwrap();
        older.instances.remove("1.2.3.4.3");
        store.put(&key, encode_document(&older).unwrap()).await.unwrap();
        assert!(repair
            .find_orphans("1.2.3")
            .await
            .unwrap()
            .iter()
            .any(|k| k.contains("1.2.3.4.3")));

        let rebuilt = repair.rebuild_series("1.2.3", "1.2.3.4").await.unwrap();
        assert!(rebuilt.contains("1.2.3.4.3"));
        assert!(repair.find_orphans("1.2.3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_study_rejected() {
        let repair = Repair::new(Arc::new(MemoryStore::new()), &config());
        assert!(matches!(
            repair.find_orphans("../etc").await,
            Err(RepairError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_rebuilding_an_unknown_study_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let repair = Repair::new(store.clone(), &config());
        assert!(matches!(
            repair.rebuild_study("9.9.9").await,
            Err(RepairError::NotFound(_))
        ));
        assert!(store.keys().is_empty());
    }
}
