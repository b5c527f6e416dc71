//! Template repository
//!
//! The engine never owns templates. It reads and updates them through the
//! [`TemplateRepository`] trait, the contract of whatever list or collection
//! the templates really live in.
//!
//! Two adapters ship with the crate:
//! - [`MemoryTemplateRepository`] for tests and embedding
//! - [`JsonTemplateRepository`], a locked JSON document using the backing
//!   list's wire names (`Title`, `IsRecurring`, `ResponsibleParty`, ...)
//!
//! Wire quirks stay inside the adapter: the assignee set is a `;`-delimited
//! string on the wire and a [`ResponsibleParty`] everywhere else.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::lock;
use crate::template::{Priority, ResponsibleParty, Template, TemplatePatch};

const TEMPLATES_SCHEMA_VERSION: &str = "recur.templates.v1";

/// Delimiter of the assignee list on the wire
pub const PARTY_DELIMITER: &str = ";";

/// Asynchronous template source
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get_all(&self) -> Result<Vec<Template>>;

    async fn get(&self, id: &str) -> Result<Option<Template>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .find(|template| template.id == id))
    }

    /// Store a new template and return its assigned id.
    ///
    /// The id of `draft` is ignored.
    async fn add(&self, draft: Template) -> Result<String>;

    /// Apply `patch` and return the updated template
    async fn update(&self, id: &str, patch: &TemplatePatch) -> Result<Template>;

    async fn delete(&self, id: &str) -> Result<()>;
}

fn new_template_id() -> String {
    Ulid::new().to_string()
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryTemplateRepository {
    templates: RwLock<Vec<Template>>,
}

impl MemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with templates that keep their ids
    pub fn with_templates(templates: impl IntoIterator<Item = Template>) -> Self {
        Self {
            templates: RwLock::new(templates.into_iter().collect()),
        }
    }

    /// Insert or replace a template under its own id
    pub async fn put(&self, template: Template) {
        let mut templates = self.templates.write().await;
        match templates.iter_mut().find(|existing| existing.id == template.id) {
            Some(existing) => *existing = template,
            None => templates.push(template),
        }
    }
}

#[async_trait]
impl TemplateRepository for MemoryTemplateRepository {
    async fn get_all(&self) -> Result<Vec<Template>> {
        Ok(self.templates.read().await.clone())
    }

    async fn add(&self, mut draft: Template) -> Result<String> {
        draft.id = new_template_id();
        let id = draft.id.clone();
        self.templates.write().await.push(draft);
        Ok(id)
    }

    async fn update(&self, id: &str, patch: &TemplatePatch) -> Result<Template> {
        let mut templates = self.templates.write().await;
        let template = templates
            .iter_mut()
            .find(|template| template.id == id)
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))?;
        template.apply(patch);
        Ok(template.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut templates = self.templates.write().await;
        let before = templates.len();
        templates.retain(|template| template.id != id);
        if templates.len() == before {
            return Err(Error::TemplateNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// One template as the backing list stores it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible_party: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
    /// Number or numeric string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// Fields this crate does not know, kept so rewrites do not lose them
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TemplateRecord {
    pub fn to_template(&self) -> Template {
        let mut template = Template::new(self.id.clone(), self.title.clone());
        template.project = non_empty(&self.project);
        template.deadline = non_empty(&self.deadline);
        template.responsible = self
            .responsible_party
            .as_deref()
            .map(parse_party)
            .unwrap_or_default();
        template.recurring = self.is_recurring;
        template.interval = self
            .interval
            .as_ref()
            .and_then(|raw| parse_interval(&self.id, raw));
        template.final_date = non_empty(&self.final_date);
        template.priority = match self.priority.as_deref().map(str::trim) {
            None | Some("") => Priority::Normal,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(template_id = %self.id, priority = raw, "unknown priority, using Normal");
                Priority::Normal
            }),
        };
        template.notes = non_empty(&self.notes);
        template.link = non_empty(&self.link);
        template.completed = self.completed;
        template
    }

    /// Overwrite the known fields from `template`, keeping unknown ones
    pub fn assign(&mut self, template: &Template) {
        self.id = template.id.clone();
        self.title = template.title.clone();
        self.project = template.project.clone();
        self.deadline = template.deadline.clone();
        self.responsible_party = if template.responsible.is_empty() {
            None
        } else {
            Some(format_party(&template.responsible))
        };
        self.is_recurring = template.recurring;
        self.interval = template.interval.map(Value::from);
        self.final_date = template.final_date.clone();
        self.priority = Some(template.priority.as_str().to_string());
        self.notes = template.notes.clone();
        self.link = template.link.clone();
        self.completed = template.completed;
    }

    pub fn from_template(template: &Template) -> Self {
        let mut record = Self::default();
        record.assign(template);
        record
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// `"alice; bob;carol"` into an ordered set
pub fn parse_party(raw: &str) -> ResponsibleParty {
    raw.split(PARTY_DELIMITER).map(str::trim).collect()
}

pub fn format_party(party: &ResponsibleParty) -> String {
    party.iter().collect::<Vec<_>>().join(PARTY_DELIMITER)
}

fn parse_interval(template_id: &str, raw: &Value) -> Option<u32> {
    let parsed = match raw {
        Value::Null => return None,
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) if text.trim().is_empty() => return None,
        Value::String(text) => text.trim().parse::<u32>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warn!(template_id = %template_id, interval = %raw, "ignoring non-numeric interval");
    }
    parsed
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TemplateDocument {
    schema_version: String,
    #[serde(default)]
    items: Vec<TemplateRecord>,
}

impl Default for TemplateDocument {
    fn default() -> Self {
        Self {
            schema_version: TEMPLATES_SCHEMA_VERSION.to_string(),
            items: Vec::new(),
        }
    }
}

impl TemplateDocument {
    fn find_mut(&mut self, id: &str) -> Result<&mut TemplateRecord> {
        self.items
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| Error::TemplateNotFound(id.to_string()))
    }
}

/// File-backed repository using the backing list's wire format
pub struct JsonTemplateRepository {
    path: PathBuf,
    lock_timeout_ms: u64,
}

impl JsonTemplateRepository {
    pub fn new(path: impl Into<PathBuf>, lock_timeout_ms: u64) -> Self {
        Self {
            path: path.into(),
            lock_timeout_ms,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<TemplateDocument> {
        let path = self.path.clone();
        let document = tokio::task::spawn_blocking(move || lock::read_json::<TemplateDocument>(&path))
            .await
            .map_err(|err| Error::Store(format!("storage task failed: {err}")))??
            .unwrap_or_default();
        check_schema(&document)?;
        Ok(document)
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TemplateDocument) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let path = self.path.clone();
        let timeout_ms = self.lock_timeout_ms;
        tokio::task::spawn_blocking(move || {
            lock::update_json_locked(&path, timeout_ms, |document: &mut TemplateDocument| {
                check_schema(document)?;
                f(document)
            })
        })
        .await
        .map_err(|err| Error::Store(format!("storage task failed: {err}")))?
    }
}

fn check_schema(document: &TemplateDocument) -> Result<()> {
    if document.schema_version != TEMPLATES_SCHEMA_VERSION {
        return Err(Error::Store(format!(
            "unsupported template schema '{}'",
            document.schema_version
        )));
    }
    Ok(())
}

#[async_trait]
impl TemplateRepository for JsonTemplateRepository {
    async fn get_all(&self) -> Result<Vec<Template>> {
        let document = self.read().await?;
        Ok(document.items.iter().map(TemplateRecord::to_template).collect())
    }

    async fn add(&self, mut draft: Template) -> Result<String> {
        draft.id = new_template_id();
        let id = draft.id.clone();
        self.mutate(move |document| {
            document.items.push(TemplateRecord::from_template(&draft));
            Ok(())
        })
        .await?;
        debug!(template_id = %id, "added template");
        Ok(id)
    }

    async fn update(&self, id: &str, patch: &TemplatePatch) -> Result<Template> {
        let id = id.to_string();
        let patch = patch.clone();
        self.mutate(move |document| {
            let record = document.find_mut(&id)?;
            let mut template = record.to_template();
            template.apply(&patch);
            record.assign(&template);
            Ok(template)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(move |document| {
            let before = document.items.len();
            document.items.retain(|record| record.id != id);
            if document.items.len() == before {
                return Err(Error::TemplateNotFound(id));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wire_record_maps_quirky_fields() {
        let record: TemplateRecord = serde_json::from_value(serde_json::json!({
            "Id": "T1",
            "Title": "Quarterly VAT",
            "Deadline": "2024-01-15T00:00:00Z",
            "ResponsibleParty": "alice; bob;alice",
            "IsRecurring": true,
            "Interval": "3",
            "Priority": "urgent",
            "Department": "Finance"
        }))
        .expect("record");

        let template = record.to_template();
        assert_eq!(template.interval, Some(3));
        assert!(template.recurring);
        assert_eq!(template.priority, Priority::Urgent);
        assert_eq!(template.responsible.iter().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(record.extra.get("Department"), Some(&Value::from("Finance")));
    }

    #[test]
    fn non_numeric_interval_is_absent() {
        let record: TemplateRecord = serde_json::from_value(serde_json::json!({
            "Id": "T1",
            "IsRecurring": true,
            "Interval": "monthly"
        }))
        .expect("record");
        assert_eq!(record.to_template().interval, None);
    }

    #[test]
    fn assign_writes_wire_shapes() {
        let mut template = Template::new("T1", "Rent");
        template.responsible = ["alice", "bob"].into_iter().collect();
        template.interval = Some(1);
        let value = serde_json::to_value(TemplateRecord::from_template(&template)).expect("json");
        assert_eq!(value["ResponsibleParty"], "alice;bob");
        assert_eq!(value["Interval"], 1);
        assert_eq!(value["Priority"], "Normal");
    }

    #[tokio::test]
    async fn memory_repository_crud() {
        let repo = MemoryTemplateRepository::with_templates([Template::new("T1", "Rent")]);
        let id = repo.add(Template::new("", "Taxes")).await.expect("add");
        assert_eq!(id.len(), 26);

        let patch = TemplatePatch {
            title: Some("Pay rent".to_string()),
            ..TemplatePatch::default()
        };
        let updated = repo.update("T1", &patch).await.expect("update");
        assert_eq!(updated.title, "Pay rent");

        repo.delete("T1").await.expect("delete");
        assert!(matches!(
            repo.delete("T1").await,
            Err(Error::TemplateNotFound(_))
        ));
        assert_eq!(repo.get_all().await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn json_repository_round_trips_and_keeps_unknown_fields() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("templates.json");
        std::fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({
                "schema_version": "recur.templates.v1",
                "items": [{"Id": "T1", "Title": "Rent", "Department": "Ops"}]
            }))
            .expect("json"),
        )
        .expect("seed");

        let repo = JsonTemplateRepository::new(&path, 1000);
        let patch = TemplatePatch {
            notes: Some(Some("landlord".to_string())),
            ..TemplatePatch::default()
        };
        repo.update("T1", &patch).await.expect("update");
        let id = repo.add(Template::new("", "Taxes")).await.expect("add");

        let all = repo.get_all().await.expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].notes.as_deref(), Some("landlord"));
        assert_eq!(all[1].id, id);

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"Department\": \"Ops\""));

        let missing = repo.update("nope", &patch).await;
        assert!(matches!(missing, Err(Error::TemplateNotFound(_))));
    }
}
