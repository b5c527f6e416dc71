//! Occurrence store
//!
//! Occurrence records persist independently of the template repository so a
//! user's per-occurrence edits survive restarts even before the next successful
//! sync with the repository. Records are keyed by occurrence id with a
//! secondary index on `template_id`.
//!
//! Two implementations share [`OccurrenceIndex`]:
//! - [`MemoryOccurrenceStore`] for tests and embedding
//! - [`FileOccurrenceStore`] backed by one locked JSON document
//!
//! Engine writes ([`OccurrenceStore::upsert_snapshots`]) and user edits
//! ([`OccurrenceStore::apply_override`]) are applied to the record as
//! currently stored, never to a copy read earlier, so an override written by
//! another handle survives a regeneration or cascade in this one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock;
use crate::occurrence::{split_occurrence_id, FieldValue, Occurrence, TaskField};

const OCCURRENCES_SCHEMA_VERSION: &str = "recur.occurrences.v1";

/// A record that could not be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub id: String,
    pub error: String,
}

impl StoreFailure {
    pub fn new(id: impl Into<String>, error: &Error) -> Self {
        Self {
            id: id.into(),
            error: error.to_string(),
        }
    }
}

/// Per-record result of a batch write
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<StoreFailure>,
}

impl BatchOutcome {
    fn record(&mut self, id: String, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(id),
            Err(err) => {
                warn!(occurrence_id = %id, error = %err, "occurrence write failed");
                self.failed.push(StoreFailure::new(id, &err));
            }
        }
    }
}

/// Asynchronous keyed store of occurrence records.
///
/// Every operation is idempotent: upserting the same record twice or deleting
/// a missing id is not an error.
#[async_trait]
pub trait OccurrenceStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Occurrence>>;

    async fn get(&self, id: &str) -> Result<Option<Occurrence>>;

    /// Occurrences of one template, ordered by sequence number
    async fn get_by_template(&self, template_id: &str) -> Result<Vec<Occurrence>>;

    async fn upsert(&self, occurrence: Occurrence) -> Result<()>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Returns the number of records removed
    async fn delete_by_template(&self, template_id: &str) -> Result<usize>;

    async fn clear(&self) -> Result<()>;

    /// Pick up writes made through other handles
    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    /// Write regenerated or cascaded records.
    ///
    /// A record already stored under the same id keeps its overrides and
    /// creation time; only the template-owned parts of the incoming record
    /// are taken. A failure on one record does not stop the others.
    async fn upsert_snapshots(&self, occurrences: Vec<Occurrence>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for occurrence in occurrences {
            let id = occurrence.id.clone();
            let result = match self.get(&id).await {
                Ok(Some(mut stored)) => {
                    stored.absorb_snapshot(occurrence);
                    self.upsert(stored).await
                }
                Ok(None) => self.upsert(occurrence).await,
                Err(err) => Err(err),
            };
            outcome.record(id, result);
        }
        outcome
    }

    /// Set or clear one override on the stored record and return the result
    async fn apply_override(
        &self,
        id: &str,
        field: TaskField,
        value: FieldValue,
    ) -> Result<Occurrence> {
        let mut occurrence = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        occurrence.set_override(field, value)?;
        self.upsert(occurrence.clone()).await?;
        Ok(occurrence)
    }

    /// Delete many records; a failure on one does not stop the others
    async fn delete_batch(&self, ids: Vec<String>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            let result = self.delete(&id).await.map(|_| ());
            outcome.record(id, result);
        }
        outcome
    }
}

/// Reject records whose id does not belong to their `template_id`
pub fn check_identity(occurrence: &Occurrence) -> Result<()> {
    match split_occurrence_id(&occurrence.id) {
        Some((template_id, _)) if template_id == occurrence.template_id => Ok(()),
        _ => Err(Error::ForeignOccurrence {
            occurrence_id: occurrence.id.clone(),
            template_id: occurrence.template_id.clone(),
        }),
    }
}

/// Primary map plus `template_id` secondary index
#[derive(Debug, Clone, Default)]
pub struct OccurrenceIndex {
    by_id: BTreeMap<String, Occurrence>,
    by_template: HashMap<String, BTreeSet<String>>,
}

impl OccurrenceIndex {
    pub fn from_records(records: impl IntoIterator<Item = Occurrence>) -> Self {
        let mut index = Self::default();
        for record in records {
            index.insert(record);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Occurrence> {
        self.by_id.get(id)
    }

    pub fn all(&self) -> Vec<Occurrence> {
        self.by_id.values().cloned().collect()
    }

    pub fn by_template(&self, template_id: &str) -> Vec<Occurrence> {
        let mut records: Vec<Occurrence> = self
            .by_template
            .get(template_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect();
        records.sort_by(|a, b| {
            a.sequence_number
                .cmp(&b.sequence_number)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    pub fn insert(&mut self, occurrence: Occurrence) {
        self.by_template
            .entry(occurrence.template_id.clone())
            .or_default()
            .insert(occurrence.id.clone());
        if let Some(previous) = self.by_id.insert(occurrence.id.clone(), occurrence) {
            debug!(occurrence_id = %previous.id, "replaced occurrence");
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Occurrence> {
        let removed = self.by_id.remove(id)?;
        if let Some(ids) = self.by_template.get_mut(&removed.template_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_template.remove(&removed.template_id);
            }
        }
        Some(removed)
    }

    pub fn remove_template(&mut self, template_id: &str) -> usize {
        let Some(ids) = self.by_template.remove(template_id) else {
            return 0;
        };
        ids.iter()
            .filter(|id| self.by_id.remove(id.as_str()).is_some())
            .count()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_template.clear();
    }
}

/// In-memory occurrence store
#[derive(Debug, Default)]
pub struct MemoryOccurrenceStore {
    index: RwLock<OccurrenceIndex>,
}

impl MemoryOccurrenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OccurrenceStore for MemoryOccurrenceStore {
    async fn get_all(&self) -> Result<Vec<Occurrence>> {
        Ok(self.index.read().await.all())
    }

    async fn get(&self, id: &str) -> Result<Option<Occurrence>> {
        Ok(self.index.read().await.get(id).cloned())
    }

    async fn get_by_template(&self, template_id: &str) -> Result<Vec<Occurrence>> {
        Ok(self.index.read().await.by_template(template_id))
    }

    async fn upsert(&self, occurrence: Occurrence) -> Result<()> {
        check_identity(&occurrence)?;
        self.index.write().await.insert(occurrence);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.index.write().await.remove(id).is_some())
    }

    async fn delete_by_template(&self, template_id: &str) -> Result<usize> {
        Ok(self.index.write().await.remove_template(template_id))
    }

    async fn clear(&self) -> Result<()> {
        self.index.write().await.clear();
        Ok(())
    }
}

/// On-disk document of the file store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccurrenceDocument {
    pub schema_version: String,
    #[serde(default)]
    pub occurrences: BTreeMap<String, Occurrence>,
}

impl Default for OccurrenceDocument {
    fn default() -> Self {
        Self {
            schema_version: OCCURRENCES_SCHEMA_VERSION.to_string(),
            occurrences: BTreeMap::new(),
        }
    }
}

/// Occurrence store persisted to a JSON document.
///
/// Each mutation is a locked read-modify-write of the whole document, so
/// several processes sharing a data directory stay consistent. Reads are
/// served from the in-memory index, refreshed by every mutation and by
/// [`OccurrenceStore::reload`].
pub struct FileOccurrenceStore {
    path: PathBuf,
    lock_timeout_ms: u64,
    index: Mutex<OccurrenceIndex>,
}

impl FileOccurrenceStore {
    /// Open (or lazily create) the document at `path`
    pub async fn open(path: impl Into<PathBuf>, lock_timeout_ms: u64) -> Result<Self> {
        let path = path.into();
        let document = load_document(path.clone()).await?;
        debug!(path = %path.display(), count = document.occurrences.len(), "opened occurrence store");
        Ok(Self {
            path,
            lock_timeout_ms,
            index: Mutex::new(OccurrenceIndex::from_records(document.occurrences.into_values())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut OccurrenceDocument) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        // Holding the index lock across the write keeps in-process writers ordered.
        let mut index = self.index.lock().await;
        let path = self.path.clone();
        let timeout_ms = self.lock_timeout_ms;
        let (result, document) = tokio::task::spawn_blocking(move || {
            lock::update_json_locked(&path, timeout_ms, |document: &mut OccurrenceDocument| {
                check_schema(document)?;
                let result = f(document)?;
                Ok((result, document.clone()))
            })
        })
        .await
        .map_err(|err| Error::Store(format!("storage task failed: {err}")))??;
        *index = OccurrenceIndex::from_records(document.occurrences.into_values());
        Ok(result)
    }
}

async fn load_document(path: PathBuf) -> Result<OccurrenceDocument> {
    let document = tokio::task::spawn_blocking(move || lock::read_json::<OccurrenceDocument>(&path))
        .await
        .map_err(|err| Error::Store(format!("storage task failed: {err}")))??
        .unwrap_or_default();
    check_schema(&document)?;
    Ok(document)
}

fn check_schema(document: &OccurrenceDocument) -> Result<()> {
    if document.schema_version != OCCURRENCES_SCHEMA_VERSION {
        return Err(Error::Store(format!(
            "unsupported occurrence schema '{}'",
            document.schema_version
        )));
    }
    Ok(())
}

#[async_trait]
impl OccurrenceStore for FileOccurrenceStore {
    async fn get_all(&self) -> Result<Vec<Occurrence>> {
        Ok(self.index.lock().await.all())
    }

    async fn get(&self, id: &str) -> Result<Option<Occurrence>> {
        Ok(self.index.lock().await.get(id).cloned())
    }

    async fn get_by_template(&self, template_id: &str) -> Result<Vec<Occurrence>> {
        Ok(self.index.lock().await.by_template(template_id))
    }

    async fn upsert(&self, occurrence: Occurrence) -> Result<()> {
        check_identity(&occurrence)?;
        self.mutate(move |document| {
            document
                .occurrences
                .insert(occurrence.id.clone(), occurrence);
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.mutate(move |document| Ok(document.occurrences.remove(&id).is_some()))
            .await
    }

    async fn delete_by_template(&self, template_id: &str) -> Result<usize> {
        let template_id = template_id.to_string();
        self.mutate(move |document| {
            let before = document.occurrences.len();
            document
                .occurrences
                .retain(|_, occurrence| occurrence.template_id != template_id);
            Ok(before - document.occurrences.len())
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.mutate(|document| {
            document.occurrences.clear();
            Ok(())
        })
        .await
    }

    async fn reload(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        let document = load_document(self.path.clone()).await?;
        debug!(path = %self.path.display(), count = document.occurrences.len(), "reloaded occurrence store");
        *index = OccurrenceIndex::from_records(document.occurrences.into_values());
        Ok(())
    }

    /// One document write for the whole batch, merged against the document
    /// read under the lock. Records failing the identity check are reported
    /// individually; a failed write fails every record.
    async fn upsert_snapshots(&self, occurrences: Vec<Occurrence>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut valid = Vec::with_capacity(occurrences.len());
        for occurrence in occurrences {
            match check_identity(&occurrence) {
                Ok(()) => valid.push(occurrence),
                Err(err) => outcome.record(occurrence.id.clone(), Err(err)),
            }
        }
        if valid.is_empty() {
            return outcome;
        }

        let ids: Vec<String> = valid.iter().map(|occurrence| occurrence.id.clone()).collect();
        let result = self
            .mutate(move |document| {
                for occurrence in valid {
                    match document.occurrences.get_mut(&occurrence.id) {
                        Some(stored) => stored.absorb_snapshot(occurrence),
                        None => {
                            document
                                .occurrences
                                .insert(occurrence.id.clone(), occurrence);
                        }
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => outcome.succeeded.extend(ids),
            Err(err) => {
                for id in ids {
                    outcome.record(id, Err(Error::Store(err.to_string())));
                }
            }
        }
        outcome
    }

    async fn apply_override(
        &self,
        id: &str,
        field: TaskField,
        value: FieldValue,
    ) -> Result<Occurrence> {
        let id = id.to_string();
        self.mutate(move |document| {
            let occurrence = document
                .occurrences
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            occurrence.set_override(field, value)?;
            Ok(occurrence.clone())
        })
        .await
    }

    async fn delete_batch(&self, ids: Vec<String>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if ids.is_empty() {
            return outcome;
        }
        let targets = ids.clone();
        let result = self
            .mutate(move |document| {
                for id in &targets {
                    document.occurrences.remove(id);
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => outcome.succeeded.extend(ids),
            Err(err) => {
                for id in ids {
                    outcome.record(id, Err(Error::Store(err.to_string())));
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::CalendarDate;
    use crate::template::Template;
    use tempfile::TempDir;

    fn occurrence(template_id: &str, month: u32, seq: u32) -> Occurrence {
        let template = Template::new(template_id, "Task");
        let date = CalendarDate::from_ymd(2024, month, 1).expect("date");
        Occurrence::new(&template, date, seq)
    }

    #[tokio::test]
    async fn memory_store_indexes_by_template() {
        let store = MemoryOccurrenceStore::new();
        store.upsert(occurrence("A", 3, 2)).await.expect("upsert");
        store.upsert(occurrence("A", 1, 0)).await.expect("upsert");
        store.upsert(occurrence("B", 1, 0)).await.expect("upsert");

        let a = store.get_by_template("A").await.expect("by template");
        let ids: Vec<&str> = a.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["A#2024-01-01", "A#2024-03-01"]);

        assert_eq!(store.delete_by_template("A").await.expect("delete"), 2);
        assert!(store.get_by_template("A").await.expect("by template").is_empty());
        assert_eq!(store.get_all().await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn operations_are_idempotent() {
        let store = MemoryOccurrenceStore::new();
        let record = occurrence("A", 1, 0);
        store.upsert(record.clone()).await.expect("first");
        store.upsert(record.clone()).await.expect("retry");
        assert_eq!(store.get_all().await.expect("all").len(), 1);

        assert!(store.delete(&record.id).await.expect("delete"));
        assert!(!store.delete(&record.id).await.expect("delete again"));
        assert_eq!(store.delete_by_template("A").await.expect("none left"), 0);
    }

    #[tokio::test]
    async fn foreign_records_are_rejected() {
        let store = MemoryOccurrenceStore::new();
        let mut record = occurrence("A", 1, 0);
        record.template_id = "B".to_string();
        let err = store.upsert(record).await.expect_err("foreign");
        assert!(matches!(err, Error::ForeignOccurrence { .. }));
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let store = MemoryOccurrenceStore::new();
        let mut bad = occurrence("A", 2, 1);
        bad.template_id = "Z".to_string();
        let outcome = store
            .upsert_snapshots(vec![occurrence("A", 1, 0), bad, occurrence("A", 3, 2)])
            .await;
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].id, "A#2024-02-01");
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("occurrences.json");

        let store = FileOccurrenceStore::open(&path, 1000).await.expect("open");
        let outcome = store
            .upsert_snapshots(vec![occurrence("A", 1, 0), occurrence("A", 2, 1)])
            .await;
        assert!(outcome.failed.is_empty());
        store.upsert(occurrence("B", 1, 0)).await.expect("upsert");
        assert!(store.delete("A#2024-02-01").await.expect("delete"));
        drop(store);

        let reopened = FileOccurrenceStore::open(&path, 1000).await.expect("reopen");
        let all = reopened.get_all().await.expect("all");
        let ids: Vec<&str> = all.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["A#2024-01-01", "B#2024-01-01"]);
        assert_eq!(reopened.get_by_template("B").await.expect("by template").len(), 1);

        reopened.clear().await.expect("clear");
        let again = FileOccurrenceStore::open(&path, 1000).await.expect("reopen");
        assert!(again.get_all().await.expect("all").is_empty());
    }

    #[tokio::test]
    async fn file_store_rejects_unknown_schema() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("occurrences.json");
        std::fs::write(&path, r#"{"schema_version":"other.v9","occurrences":{}}"#).expect("write");
        let err = FileOccurrenceStore::open(&path, 1000).await.err().expect("schema error");
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn snapshot_writes_keep_overrides_from_another_handle() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("occurrences.json");
        let first = FileOccurrenceStore::open(&path, 1000).await.expect("open");
        first
            .upsert_snapshots(vec![occurrence("A", 1, 0), occurrence("A", 2, 1)])
            .await;

        let second = FileOccurrenceStore::open(&path, 1000).await.expect("open second");
        second
            .apply_override("A#2024-02-01", TaskField::Completed, FieldValue::Flag(true))
            .await
            .expect("complete");

        // `first` still holds the record as it was before the edit.
        let mut stale = first
            .get("A#2024-02-01")
            .await
            .expect("get")
            .expect("cached");
        assert!(stale.overrides.completed.is_none());
        stale.base_fields.title = "Renamed".to_string();
        let outcome = first.upsert_snapshots(vec![stale]).await;
        assert!(outcome.failed.is_empty());

        let reopened = FileOccurrenceStore::open(&path, 1000).await.expect("reopen");
        let stored = reopened
            .get("A#2024-02-01")
            .await
            .expect("get")
            .expect("stored");
        assert_eq!(stored.base_fields.title, "Renamed");
        assert_eq!(stored.overrides.completed, Some(true));
        assert!(stored.completion_status);
    }

    #[tokio::test]
    async fn reload_picks_up_other_writers() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("occurrences.json");
        let reader = FileOccurrenceStore::open(&path, 1000).await.expect("open");
        let writer = FileOccurrenceStore::open(&path, 1000).await.expect("open writer");
        writer.upsert(occurrence("A", 1, 0)).await.expect("upsert");

        assert!(reader.get_all().await.expect("all").is_empty());
        reader.reload().await.expect("reload");
        assert_eq!(reader.get_all().await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn override_on_missing_record_writes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("occurrences.json");
        let store = FileOccurrenceStore::open(&path, 1000).await.expect("open");
        let err = store
            .apply_override("A#2024-01-01", TaskField::Title, FieldValue::Text("x".to_string()))
            .await
            .expect_err("missing");
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn memory_snapshot_writes_keep_overrides() {
        let store = MemoryOccurrenceStore::new();
        let mut edited = occurrence("A", 1, 0);
        edited
            .set_override(TaskField::Notes, FieldValue::Text("mine".to_string()))
            .expect("override");
        store.upsert(edited).await.expect("upsert");

        let mut fresh = occurrence("A", 1, 0);
        fresh.base_fields.notes = Some("template".to_string());
        store.upsert_snapshots(vec![fresh]).await;

        let stored = store.get("A#2024-01-01").await.expect("get").expect("stored");
        assert_eq!(stored.overrides.notes.as_deref(), Some("mine"));
        assert_eq!(stored.base_fields.notes.as_deref(), Some("template"));
    }
}
