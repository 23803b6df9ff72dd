//! Optimistic read-join-write of aggregate documents.
//!
//! Every update reads the current aggregate with its version, joins the new
//! contribution in and writes back only if the stored version is unchanged.
//! Because joins are idempotent, a losing writer simply re-reads and tries
//! again; the retry count is bounded so a hot series surfaces as a transient
//! error instead of spinning.

use crate::attribute::InstanceIds;
use crate::config::IngestConfig;
use crate::layout;
use crate::projection::{
    check_version, decode_document, encode_document, DocumentError, SeriesAggregate,
    StudyAggregate,
};
use crate::store::{ObjectStore, ObjectStoreError};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("gave up on {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },

    #[error(transparent)]
    Storage(#[from] ObjectStoreError),

    #[error("aggregate {key} is unreadable: {source}")]
    Document {
        key: String,
        #[source]
        source: DocumentError,
    },
}

impl MergeError {
    /// Safe to resubmit the same instance later.
    pub fn is_transient(&self) -> bool {
        match self {
            MergeError::Contention { .. } => true,
            MergeError::Storage(e) => e.is_transient(),
            MergeError::Document { .. } => false,
        }
    }
}

/// A stored aggregate document.
pub trait Aggregate: Serialize + DeserializeOwned + PartialEq + Clone + Send {
    fn schema_version(&self) -> u32;
}

impl Aggregate for SeriesAggregate {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl Aggregate for StudyAggregate {
    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome<T> {
    /// The aggregate as stored after this merge.
    pub document: T,
    /// False when the join changed nothing and no write was issued.
    pub written: bool,
    pub attempts: u32,
}

pub struct MergeEngine {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: &IngestConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_merge_attempts.max(1),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
        }
    }

    /// Add one instance document to its series aggregate.
    #[instrument(skip(self, doc), fields(study_uid = %ids.study, series_uid = %ids.series, instance_uid = %ids.instance))]
    pub async fn merge_instance(
        &self,
        ids: &InstanceIds,
        doc: &JsonValue,
    ) -> Result<MergeOutcome<SeriesAggregate>, MergeError> {
        let key = layout::series_index(&ids.study, &ids.series);
        self.update(
            &key,
            || SeriesAggregate::empty(&ids.study, &ids.series),
            |current| current.with_instance(ids, doc),
        )
        .await
    }

    /// Fold a committed series aggregate into its study aggregate.
    #[instrument(skip(self, series), fields(study_uid = %series.study_instance_uid, series_uid = %series.series_instance_uid))]
    pub async fn merge_series_into_study(
        &self,
        series: &SeriesAggregate,
    ) -> Result<MergeOutcome<StudyAggregate>, MergeError> {
        let key = layout::study_index(&series.study_instance_uid);
        self.update(
            &key,
            || StudyAggregate::empty(&series.study_instance_uid),
            |current| current.with_series(series),
        )
        .await
    }

    /// Compare-and-swap loop over one aggregate document.
    ///
    /// `apply` must be a join: applying it to an already updated document
    /// returns that document unchanged.
    pub async fn update<T, E, F>(&self, key: &str, empty: E, apply: F) -> Result<MergeOutcome<T>, MergeError>
    where
        T: Aggregate,
        E: Fn() -> T,
        F: Fn(&T) -> T,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.backoff_initial,
            max_interval: self.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        };

        for attempt in 1..=self.max_attempts {
            counter!("dicomweb.merge.attempts").increment(1);

            let (current, version) = match self.store.get(key).await {
                Ok(object) => {
                    let current: T = decode_document(&object.bytes).map_err(|source| MergeError::Document {
                        key: key.to_string(),
                        source,
                    })?;
                    check_version(current.schema_version()).map_err(|source| MergeError::Document {
                        key: key.to_string(),
                        source,
                    })?;
                    (current, Some(object.version))
                }
                Err(e) if e.is_not_found() => (empty(), None),
                Err(e) => return Err(e.into()),
            };

            let merged = apply(&current);
            if version.is_some() && merged == current {
                debug!(key = %key, attempt, "Aggregate already up to date");
                return Ok(MergeOutcome {
                    document: merged,
                    written: false,
                    attempts: attempt,
                });
            }

            let bytes = encode_document(&merged).map_err(|source| MergeError::Document {
                key: key.to_string(),
                source,
            })?;

            match self.store.put_if(key, bytes, version.as_ref()).await {
                Ok(new_version) => {
                    debug!(key = %key, attempt, version = %new_version, "Aggregate written");
                    return Ok(MergeOutcome {
                        document: merged,
                        written: true,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_conflict() => {
                    counter!("dicomweb.merge.conflicts").increment(1);
                    if attempt == self.max_attempts {
                        break;
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.backoff_max);
                    debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Aggregate changed underneath, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(key = %key, attempts = self.max_attempts, "Merge contention, giving up");
        Err(MergeError::Contention {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}
