//! Combined task store
//!
//! One subscribable, in-memory list of every task a consumer should see:
//! non-recurring templates (merged with their working copy) and the dated
//! occurrences of recurring templates.
//!
//! The store is constructed explicitly with [`CombinedTaskStore::create`] and
//! shut down with [`CombinedTaskStore::dispose`]. Every mutation is queued to
//! a single worker task and applied in submission order, one at a time, so two
//! rapid edits can never interleave their read-modify-write cycles. After each
//! successful mutation every subscriber is called exactly once with the new
//! list.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock, Weak};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::date::CalendarDate;
use crate::error::{Error, Result};
use crate::occurrence::{clone_id, split_occurrence_id, FieldValue, Occurrence, TaskField, TaskFields};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::repository::TemplateRepository;
use crate::template::{Priority, ResponsibleParty, Template, TemplatePatch};

/// One entry of the combined list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    /// Template id for non-recurring tasks, occurrence id otherwise
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<CalendarDate>,
    pub responsible: ResponsibleParty,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub completed: bool,
    pub is_recurring_instance: bool,
    pub original_template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_date: Option<CalendarDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u32>,
    /// Fields carrying a per-occurrence override
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overridden: Vec<TaskField>,
}

impl TaskView {
    fn from_fields(id: String, template_id: &str, fields: TaskFields) -> Self {
        Self {
            id,
            title: fields.title,
            project: fields.project,
            deadline: fields.deadline,
            responsible: fields.responsible,
            priority: fields.priority,
            notes: fields.notes,
            link: fields.link,
            completed: fields.completed,
            is_recurring_instance: false,
            original_template_id: template_id.to_string(),
            occurrence_date: None,
            sequence_number: None,
            overridden: Vec::new(),
        }
    }
}

/// Merge templates and occurrences into the flattened list.
///
/// A non-recurring template shows as itself with the overrides of its
/// `_clone` applied. A recurring template shows as its occurrences in
/// sequence order. Occurrences of unknown templates are left out.
pub fn build_view(templates: &[Template], occurrences: &[Occurrence]) -> Vec<TaskView> {
    let mut by_template: BTreeMap<&str, Vec<&Occurrence>> = BTreeMap::new();
    for occurrence in occurrences {
        by_template
            .entry(occurrence.template_id.as_str())
            .or_default()
            .push(occurrence);
    }
    for group in by_template.values_mut() {
        group.sort_by(|a, b| {
            a.sequence_number
                .cmp(&b.sequence_number)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    let mut view = Vec::new();
    for template in templates {
        let group = by_template
            .get(template.id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();

        if !template.recurring {
            let mut base = TaskFields::snapshot(template, template.deadline_date());
            base.completed = template.completed;
            let working_copy = group.iter().find(|occurrence| occurrence.is_clone());
            let (fields, overridden) = match working_copy {
                Some(copy) => (copy.overrides.apply_to(&base), copy.overrides.fields()),
                None => (base, Vec::new()),
            };
            let mut entry = TaskView::from_fields(template.id.clone(), &template.id, fields);
            entry.overridden = overridden;
            view.push(entry);
            continue;
        }

        for occurrence in group {
            let mut entry =
                TaskView::from_fields(occurrence.id.clone(), &template.id, occurrence.effective());
            entry.is_recurring_instance = !occurrence.is_clone();
            entry.occurrence_date = occurrence.occurrence_date;
            entry.sequence_number = Some(occurrence.sequence_number);
            entry.overridden = occurrence.overrides.fields();
            view.push(entry);
        }
    }
    view
}

type Listener = Arc<dyn Fn(&[TaskView]) + Send + Sync>;

enum Job {
    SetTemplates(Vec<Template>, oneshot::Sender<Result<()>>),
    SetOccurrences(Vec<Occurrence>, oneshot::Sender<Result<()>>),
    UpdateField {
        id: String,
        field: TaskField,
        value: FieldValue,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateTemplate {
        id: String,
        patch: TemplatePatch,
        reply: oneshot::Sender<Result<Template>>,
    },
    AddTemplate(Template, oneshot::Sender<Result<Template>>),
    RemoveTemplate(String, oneshot::Sender<Result<Vec<String>>>),
    Refresh(oneshot::Sender<Result<ReconcileReport>>),
}

#[derive(Default)]
struct State {
    templates: Vec<Template>,
    occurrences: Vec<Occurrence>,
    view: Vec<TaskView>,
}

struct Inner {
    repository: Arc<dyn TemplateRepository>,
    reconciler: Arc<Reconciler>,
    state: StdRwLock<State>,
    listeners: StdMutex<BTreeMap<u64, Listener>>,
    next_listener: AtomicU64,
}

/// Handle returned by [`CombinedTaskStore::subscribe`]
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Stop receiving updates
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

/// The merged, subscribable task list
pub struct CombinedTaskStore {
    inner: Arc<Inner>,
    sender: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CombinedTaskStore {
    /// Start the store's worker on the current tokio runtime
    pub fn create(
        repository: Arc<dyn TemplateRepository>,
        reconciler: Arc<Reconciler>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            Error::OperationFailed(format!("task store needs a tokio runtime: {err}"))
        })?;
        let inner = Arc::new(Inner {
            repository,
            reconciler,
            state: StdRwLock::new(State::default()),
            listeners: StdMutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(0),
        });

        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker_inner = Arc::clone(&inner);
        let worker = runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                worker_inner.run(job).await;
            }
            debug!("task store worker stopped");
        });

        Ok(Self {
            inner,
            sender: StdMutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop accepting mutations and wait for queued ones to finish
    pub async fn dispose(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "task store worker ended abnormally");
            }
        }
    }

    /// Snapshot of the merged list
    pub fn get_all(&self) -> Vec<TaskView> {
        self.inner.read_state().view.clone()
    }

    /// Call `listener` with the new list after every successful mutation
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[TaskView]) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub async fn set_templates(&self, templates: Vec<Template>) -> Result<()> {
        self.submit(|reply| Job::SetTemplates(templates, reply)).await
    }

    pub async fn set_occurrences(&self, occurrences: Vec<Occurrence>) -> Result<()> {
        self.submit(|reply| Job::SetOccurrences(occurrences, reply))
            .await
    }

    /// Edit one field of a task.
    ///
    /// Occurrence ids write a per-occurrence override. Template ids update
    /// the repository, then cascade (or regenerate when the field affects
    /// the schedule). Ids matching neither fail with [`Error::NotFound`]
    /// before anything is written.
    pub async fn update_field(&self, id: &str, field: TaskField, value: FieldValue) -> Result<()> {
        let id = id.to_string();
        self.submit(|reply| Job::UpdateField {
            id,
            field,
            value,
            reply,
        })
        .await
    }

    /// Apply several template edits at once and bring its occurrences in line
    pub async fn update_template(&self, id: &str, patch: TemplatePatch) -> Result<Template> {
        let id = id.to_string();
        self.submit(|reply| Job::UpdateTemplate { id, patch, reply })
            .await
    }

    /// Store a new template and generate its occurrences.
    ///
    /// The repository assigns the id; the stored template is returned.
    pub async fn add_template(&self, draft: Template) -> Result<Template> {
        self.submit(|reply| Job::AddTemplate(draft, reply)).await
    }

    /// Delete a template and all of its occurrences.
    ///
    /// Returns the ids of the deleted occurrences.
    pub async fn remove_template(&self, id: &str) -> Result<Vec<String>> {
        let id = id.to_string();
        self.submit(|reply| Job::RemoveTemplate(id, reply)).await
    }

    /// Re-read the repository, reconcile, and reload the occurrence cache
    pub async fn refresh(&self) -> Result<ReconcileReport> {
        self.submit(Job::Refresh).await
    }

    async fn submit<T>(&self, job: impl FnOnce(oneshot::Sender<Result<T>>) -> Job) -> Result<T> {
        let (reply, response) = oneshot::channel();
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender.as_ref().ok_or(Error::Disposed)?;
            sender.send(job(reply)).map_err(|_| Error::Disposed)?;
        }
        response.await.map_err(|_| Error::Disposed)?
    }
}

impl Inner {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self, job: Job) {
        match job {
            Job::SetTemplates(templates, reply) => {
                self.write_state().templates = templates;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Job::SetOccurrences(occurrences, reply) => {
                self.write_state().occurrences = occurrences;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Job::UpdateField {
                id,
                field,
                value,
                reply,
            } => {
                let result = self.update_field(&id, field, value).await;
                match &result {
                    Ok(()) => self.publish(),
                    Err(err) => warn!(id = %id, field = %field, error = %err, "field update failed"),
                }
                let _ = reply.send(result);
            }
            Job::UpdateTemplate { id, patch, reply } => {
                let result = self.apply_patch(&id, &patch).await;
                match &result {
                    Ok(_) => self.publish(),
                    Err(err) => warn!(template_id = %id, error = %err, "template update failed"),
                }
                let _ = reply.send(result);
            }
            Job::AddTemplate(draft, reply) => {
                let result = self.add_template(draft).await;
                if result.is_ok() {
                    self.publish();
                }
                let _ = reply.send(result);
            }
            Job::RemoveTemplate(id, reply) => {
                let result = self.remove_template(&id).await;
                if result.is_ok() {
                    self.publish();
                }
                let _ = reply.send(result);
            }
            Job::Refresh(reply) => {
                let result = self.refresh().await;
                if result.is_ok() {
                    self.publish();
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn update_field(&self, id: &str, field: TaskField, value: FieldValue) -> Result<()> {
        if split_occurrence_id(id).is_some() {
            return self.set_override(id, field, value).await;
        }

        // Template ids never contain the separator, so anything else is a
        // template or nothing at all.
        let Some(template) = self.repository.get(id).await? else {
            return Err(Error::NotFound(id.to_string()));
        };
        // Completion of a single task lives on its working copy once one
        // exists, like it does for every recurring occurrence.
        if field == TaskField::Completed && !template.recurring {
            let copy_id = clone_id(id);
            if self.reconciler.store().get(&copy_id).await?.is_some() {
                return self.set_override(&copy_id, field, value).await;
            }
        }

        let patch = TemplatePatch::from_field(field, value)?;
        self.apply_patch(id, &patch).await.map(|_| ())
    }

    async fn apply_patch(&self, id: &str, patch: &TemplatePatch) -> Result<Template> {
        if split_occurrence_id(id).is_some() {
            return Err(Error::TemplateNotFound(id.to_string()));
        }
        let updated = self.repository.update(id, patch).await?;
        let report = if patch.touches_schedule() {
            self.reconciler.regenerate(&updated).await?
        } else {
            self.reconciler.cascade(&updated).await?
        };
        if !report.failures.is_empty() {
            warn!(
                template_id = %id,
                failures = report.failures.len(),
                "template saved but some occurrences were not updated"
            );
        } else {
            self.reconciler.observe(&updated);
        }
        self.reload_template(&updated).await?;
        Ok(updated)
    }

    async fn add_template(&self, draft: Template) -> Result<Template> {
        let id = self.repository.add(draft).await?;
        let template = self
            .repository
            .get(&id)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(id.clone()))?;
        let report = self.reconciler.regenerate(&template).await?;
        for diagnostic in &report.diagnostics {
            warn!(template_id = %id, "{diagnostic}");
        }
        if report.failures.is_empty() {
            self.reconciler.observe(&template);
        }
        self.reload_template(&template).await?;
        Ok(template)
    }

    async fn remove_template(&self, id: &str) -> Result<Vec<String>> {
        self.repository.delete(id).await?;
        let deleted = self.reconciler.remove_template(id).await?;
        let mut state = self.write_state();
        state.templates.retain(|cached| cached.id != id);
        state.occurrences.retain(|cached| cached.template_id != id);
        Ok(deleted)
    }

    /// Replace the cached template and its occurrences with stored state
    async fn reload_template(&self, template: &Template) -> Result<()> {
        let occurrences = self.reconciler.store().get_by_template(&template.id).await?;
        let mut state = self.write_state();
        match state.templates.iter_mut().find(|cached| cached.id == template.id) {
            Some(cached) => *cached = template.clone(),
            None => state.templates.push(template.clone()),
        }
        state.occurrences.retain(|cached| cached.template_id != template.id);
        state.occurrences.extend(occurrences);
        Ok(())
    }

    async fn set_override(&self, occurrence_id: &str, field: TaskField, value: FieldValue) -> Result<()> {
        let occurrence = self.reconciler.set_override(occurrence_id, field, value).await?;
        let mut state = self.write_state();
        match state.occurrences.iter_mut().find(|cached| cached.id == occurrence.id) {
            Some(cached) => *cached = occurrence,
            None => state.occurrences.push(occurrence),
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<ReconcileReport> {
        let templates = self.repository.get_all().await?;
        let report = self.reconciler.reconcile_all(&templates).await?;
        let occurrences = self.reconciler.store().get_all().await?;
        let mut state = self.write_state();
        state.templates = templates;
        state.occurrences = occurrences;
        Ok(report)
    }

    /// Rebuild the view and call every listener once
    fn publish(&self) {
        let view = {
            let mut state = self.write_state();
            state.view = build_view(&state.templates, &state.occurrences);
            state.view.clone()
        };
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&view);
        }
    }
}
