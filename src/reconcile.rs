//! Reconciliation and cascade controller
//!
//! Sits between incoming template data and the occurrence store:
//!
//! ```text
//! templates ──► detect_changes ──► Added / Rescheduled ──► generator::regenerate
//!                     │          └► Described ──────────► cascade
//!                     └► Removed ──────────────────────► delete_by_template
//! ```
//!
//! Change detection is pure and compares each template with the last snapshot
//! the controller saw. Completion and priority are occurrence-owned and never
//! count as a template change, so re-fetching the same data is a no-op.
//!
//! Every write touching one template's occurrences runs inside a lock keyed by
//! template id, so a refresh can never interleave with a field update on the
//! same template.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::generator::{self, Diagnostic, GenerationReport, OrphanedDeviation};
use crate::occurrence::{split_occurrence_id, FieldValue, Occurrence, TaskField};
use crate::store::{OccurrenceStore, StoreFailure};
use crate::template::Template;

/// How a template differs from the last snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateChange {
    Added,
    Removed,
    /// Recurrence flag, interval, final date or deadline changed
    Rescheduled,
    /// Only descriptive fields changed, or the completion of a single task
    Described,
    Unchanged,
}

/// Classify `current` against the `previous` snapshot of the same template
pub fn classify(previous: Option<&Template>, current: &Template) -> TemplateChange {
    let Some(previous) = previous else {
        return TemplateChange::Added;
    };
    if previous.recurring != current.recurring
        || previous.interval != current.interval
        || previous.final_date != current.final_date
        || previous.deadline != current.deadline
    {
        return TemplateChange::Rescheduled;
    }
    if previous.title != current.title
        || previous.project != current.project
        || previous.notes != current.notes
        || previous.link != current.link
        || previous.responsible != current.responsible
        || (!current.recurring && previous.completed != current.completed)
    {
        return TemplateChange::Described;
    }
    TemplateChange::Unchanged
}

/// Per-template changes between a snapshot and an incoming template set.
///
/// When `incoming` repeats an id the last record wins.
pub fn detect_changes(
    previous: &HashMap<String, Template>,
    incoming: &[Template],
) -> BTreeMap<String, TemplateChange> {
    let mut latest: BTreeMap<&str, &Template> = BTreeMap::new();
    for template in incoming {
        latest.insert(template.id.as_str(), template);
    }

    let mut changes: BTreeMap<String, TemplateChange> = latest
        .iter()
        .map(|(id, template)| (id.to_string(), classify(previous.get(*id), template)))
        .collect();
    for id in previous.keys() {
        if !latest.contains_key(id.as_str()) {
            changes.insert(id.clone(), TemplateChange::Removed);
        }
    }
    changes
}

/// Outcome of one [`Reconciler::reconcile_all`] pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Occurrences stored once the pass finished
    pub instance_count: usize,
    pub regenerated: Vec<String>,
    pub cascaded: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    /// Ids of occurrences written during the pass
    pub written: Vec<String>,
    /// Ids of occurrences deleted during the pass
    pub deleted: Vec<String>,
    pub failures: Vec<StoreFailure>,
    pub diagnostics: Vec<Diagnostic>,
    pub orphaned: Vec<OrphanedDeviation>,
}

impl ReconcileReport {
    fn absorb(&mut self, report: GenerationReport) {
        self.written.extend(report.written);
        self.deleted.extend(report.deleted);
        self.failures.extend(report.failures);
        self.diagnostics.extend(report.diagnostics);
        self.orphaned.extend(report.orphaned);
    }

    /// Whether the pass wrote to the occurrence store
    pub fn has_writes(&self) -> bool {
        !self.written.is_empty() || !self.deleted.is_empty()
    }
}

/// Async locks keyed by template id
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    /// Drop the lock entry of a template that no longer exists
    pub fn forget(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = locks.get(key) {
            // Still held or awaited by someone else.
            if Arc::strong_count(entry) > 1 {
                return;
            }
        }
        locks.remove(key);
    }
}

/// Orchestrates regeneration, cascade and override writes for all templates
pub struct Reconciler {
    store: Arc<dyn OccurrenceStore>,
    config: EngineConfig,
    snapshot: StdMutex<HashMap<String, Template>>,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OccurrenceStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            snapshot: StdMutex::new(HashMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn OccurrenceStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn snapshot(&self) -> std::sync::MutexGuard<'_, HashMap<String, Template>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `template` as seen without touching any occurrence
    pub fn observe(&self, template: &Template) {
        self.snapshot().insert(template.id.clone(), template.clone());
    }

    /// The last seen version of a template
    pub fn last_seen(&self, template_id: &str) -> Option<Template> {
        self.snapshot().get(template_id).cloned()
    }

    /// Bring the occurrence store in line with `templates`.
    ///
    /// The store is reloaded first so edits made by other processes are
    /// planned against. Only new, removed and changed templates cause writes. Templates whose
    /// pass failed keep their previous snapshot so the next pass retries
    /// them. Occurrences of template ids absent from `templates` are deleted
    /// even if this controller never saw those templates.
    pub async fn reconcile_all(&self, templates: &[Template]) -> Result<ReconcileReport> {
        self.store.reload().await?;
        let previous = self.snapshot().clone();
        let changes = detect_changes(&previous, templates);
        let mut report = ReconcileReport::default();

        let latest: BTreeMap<&str, &Template> = templates
            .iter()
            .map(|template| (template.id.as_str(), template))
            .collect();

        for (id, change) in &changes {
            match change {
                TemplateChange::Unchanged => report.unchanged += 1,
                TemplateChange::Removed => {}
                TemplateChange::Added | TemplateChange::Rescheduled => {
                    let Some(template) = latest.get(id.as_str()) else {
                        continue;
                    };
                    match self.regenerate(template).await {
                        Ok(generated) => {
                            if generated.failures.is_empty() {
                                self.observe(template);
                            }
                            report.regenerated.push(id.clone());
                            report.absorb(generated);
                        }
                        Err(err) => {
                            warn!(template_id = %id, error = %err, "regeneration failed");
                            report.failures.push(StoreFailure::new(id.clone(), &err));
                        }
                    }
                }
                TemplateChange::Described => {
                    let Some(template) = latest.get(id.as_str()) else {
                        continue;
                    };
                    match self.cascade(template).await {
                        Ok(cascaded) => {
                            report.cascaded.push(id.clone());
                            report.absorb(cascaded);
                        }
                        Err(err) => {
                            warn!(template_id = %id, error = %err, "cascade failed");
                            report.failures.push(StoreFailure::new(id.clone(), &err));
                        }
                    }
                }
            }
        }

        let mut gone: BTreeSet<String> = changes
            .iter()
            .filter(|(_, change)| **change == TemplateChange::Removed)
            .map(|(id, _)| id.clone())
            .collect();
        for occurrence in self.store.get_all().await? {
            if !latest.contains_key(occurrence.template_id.as_str()) {
                gone.insert(occurrence.template_id);
            }
        }
        for id in gone {
            match self.remove_template(&id).await {
                Ok(deleted) => {
                    report.deleted.extend(deleted);
                    report.removed.push(id);
                }
                Err(err) => {
                    warn!(template_id = %id, error = %err, "cleanup of removed template failed");
                    report.failures.push(StoreFailure::new(id, &err));
                }
            }
        }

        report.instance_count = self.store.get_all().await?.len();
        if report.has_writes() || !report.failures.is_empty() {
            info!(
                regenerated = report.regenerated.len(),
                cascaded = report.cascaded.len(),
                removed = report.removed.len(),
                failures = report.failures.len(),
                instances = report.instance_count,
                "reconciled templates"
            );
        } else {
            debug!(instances = report.instance_count, "reconcile found no changes");
        }
        Ok(report)
    }

    /// Fully regenerate one template's occurrences
    pub async fn regenerate(&self, template: &Template) -> Result<GenerationReport> {
        let _guard = self.locks.lock(&template.id).await;
        generator::regenerate(template, self.store.as_ref(), &self.config).await
    }

    /// Rewrite the base snapshot of every occurrence of `template`.
    ///
    /// Overrides and completion are never touched, so a user's own value
    /// keeps winning. Occurrences already in sync are not rewritten.
    pub async fn cascade(&self, template: &Template) -> Result<GenerationReport> {
        let _guard = self.locks.lock(&template.id).await;
        let mut report = GenerationReport {
            template_id: template.id.clone(),
            ..GenerationReport::default()
        };

        let mut changed = Vec::new();
        for mut occurrence in self.store.get_by_template(&template.id).await? {
            if occurrence.rebase(template) {
                changed.push(occurrence);
            } else {
                report.unchanged += 1;
            }
        }
        if !changed.is_empty() {
            let outcome = self.store.upsert_snapshots(changed).await;
            report.written = outcome.succeeded;
            report.failures = outcome.failed;
        }
        if report.failures.is_empty() {
            self.observe(template);
        }
        debug!(
            template_id = %template.id,
            written = report.written.len(),
            unchanged = report.unchanged,
            "cascaded template fields"
        );
        Ok(report)
    }

    /// Delete every occurrence of a template and forget it.
    ///
    /// Returns the ids of the deleted occurrences.
    pub async fn remove_template(&self, template_id: &str) -> Result<Vec<String>> {
        let removed = {
            let _guard = self.locks.lock(template_id).await;
            let ids: Vec<String> = self
                .store
                .get_by_template(template_id)
                .await?
                .into_iter()
                .map(|occurrence| occurrence.id)
                .collect();
            self.store.delete_by_template(template_id).await?;
            self.snapshot().remove(template_id);
            ids
        };
        self.locks.forget(template_id);
        debug!(template_id = %template_id, removed = removed.len(), "removed template occurrences");
        Ok(removed)
    }

    /// Record a user edit on one occurrence.
    ///
    /// Only the override layer changes; the base snapshot stays as the
    /// template last produced it.
    pub async fn set_override(
        &self,
        occurrence_id: &str,
        field: TaskField,
        value: FieldValue,
    ) -> Result<Occurrence> {
        let Some((template_id, _)) = split_occurrence_id(occurrence_id) else {
            return Err(Error::NotFound(occurrence_id.to_string()));
        };
        let _guard = self.locks.lock(template_id).await;
        let occurrence = self
            .store
            .apply_override(occurrence_id, field, value)
            .await?;
        debug!(occurrence_id = %occurrence_id, field = %field, "set override");
        Ok(occurrence)
    }
}
