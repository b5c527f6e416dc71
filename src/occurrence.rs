//! Occurrences: dated materializations of a template.
//!
//! An occurrence keeps two layers of task fields:
//!
//! ```text
//! base_fields   snapshot of the template, rewritten only by regeneration/cascade
//! overrides     sparse per-occurrence edits made by the user
//! ```
//!
//! The effective value of a field is `overrides[field] ?? base_fields[field]`.
//! User actions only ever touch `overrides`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::date::{self, CalendarDate};
use crate::error::{Error, Result};
use crate::template::{Priority, ResponsibleParty, Template};

/// Joins template id and date in an occurrence id. Never valid in either part.
pub const ID_SEPARATOR: char = '#';

/// Date component used for the single occurrence of a non-recurring template
pub const CLONE_SUFFIX: &str = "_clone";

/// Id of the occurrence of `template_id` on `date`
pub fn occurrence_id(template_id: &str, date: &CalendarDate) -> String {
    format!("{template_id}{ID_SEPARATOR}{}", date.to_iso())
}

/// Id of the single working copy of a non-recurring template
pub fn clone_id(template_id: &str) -> String {
    format!("{template_id}{ID_SEPARATOR}{CLONE_SUFFIX}")
}

/// Split an occurrence id into `(template_id, date_or_clone_suffix)`
pub fn split_occurrence_id(id: &str) -> Option<(&str, &str)> {
    let (template_id, rest) = id.split_once(ID_SEPARATOR)?;
    if template_id.is_empty() || rest.is_empty() {
        return None;
    }
    Some((template_id, rest))
}

/// Addressable task fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskField {
    Title,
    Project,
    Deadline,
    Responsible,
    Priority,
    Notes,
    Link,
    Completed,
}

impl TaskField {
    pub const ALL: [TaskField; 8] = [
        TaskField::Title,
        TaskField::Project,
        TaskField::Deadline,
        TaskField::Responsible,
        TaskField::Priority,
        TaskField::Notes,
        TaskField::Link,
        TaskField::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskField::Title => "title",
            TaskField::Project => "project",
            TaskField::Deadline => "deadline",
            TaskField::Responsible => "responsible",
            TaskField::Priority => "priority",
            TaskField::Notes => "notes",
            TaskField::Link => "link",
            TaskField::Completed => "completed",
        }
    }

    /// Status-like fields belong to the occurrence, not the template
    pub fn is_status(&self) -> bool {
        matches!(self, TaskField::Completed | TaskField::Priority)
    }
}

impl fmt::Display for TaskField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskField {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "title" => Ok(TaskField::Title),
            "project" => Ok(TaskField::Project),
            "deadline" | "due" => Ok(TaskField::Deadline),
            "responsible" | "responsible_party" | "assignees" => Ok(TaskField::Responsible),
            "priority" => Ok(TaskField::Priority),
            "notes" | "note" => Ok(TaskField::Notes),
            "link" | "url" => Ok(TaskField::Link),
            "completed" | "completion" | "completion_status" | "done" => Ok(TaskField::Completed),
            other => Err(Error::InvalidArgument(format!("unknown field '{other}'"))),
        }
    }
}

/// A typed value for one [`TaskField`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum FieldValue {
    Text(String),
    Date(CalendarDate),
    Party(ResponsibleParty),
    Priority(Priority),
    Flag(bool),
    /// Remove the value (an override falls back to the template)
    Clear,
}

impl FieldValue {
    /// Parse a raw string for `field`
    pub fn parse(field: TaskField, raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        match field {
            TaskField::Title | TaskField::Project | TaskField::Notes | TaskField::Link => {
                Ok(FieldValue::Text(raw.to_string()))
            }
            TaskField::Deadline => date::parse(trimmed)
                .map(FieldValue::Date)
                .ok_or_else(|| Error::InvalidArgument(format!("unparseable date '{trimmed}'"))),
            TaskField::Responsible => Ok(FieldValue::Party(
                trimmed.split([',', ';']).map(str::trim).collect(),
            )),
            TaskField::Priority => trimmed.parse().map(FieldValue::Priority),
            TaskField::Completed => parse_flag(trimmed).map(FieldValue::Flag),
        }
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "done" => Ok(true),
        "false" | "no" | "0" | "open" => Ok(false),
        other => Err(Error::InvalidArgument(format!("invalid boolean '{other}'"))),
    }
}

/// Full set of task fields; the snapshot an occurrence takes of its template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFields {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<CalendarDate>,
    #[serde(default)]
    pub responsible: ResponsibleParty,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl TaskFields {
    /// Snapshot of `template` for an occurrence dated `date`
    pub fn snapshot(template: &Template, date: Option<CalendarDate>) -> Self {
        Self {
            title: template.title.clone(),
            project: template.project.clone(),
            deadline: date,
            responsible: template.responsible.clone(),
            priority: template.priority,
            notes: template.notes.clone(),
            link: template.link.clone(),
            completed: template.completed,
        }
    }

    /// Take the descriptive fields and the priority of `template`.
    ///
    /// The deadline stays the occurrence's own date and `completed` is never
    /// taken from the template once the occurrence exists.
    pub fn cascade_from(&mut self, template: &Template) {
        self.title = template.title.clone();
        self.project = template.project.clone();
        self.responsible = template.responsible.clone();
        self.priority = template.priority;
        self.notes = template.notes.clone();
        self.link = template.link.clone();
    }
}

/// Sparse per-occurrence edits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<CalendarDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible: Option<ResponsibleParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields that carry an override
    pub fn fields(&self) -> Vec<TaskField> {
        TaskField::ALL
            .into_iter()
            .filter(|field| self.has(*field))
            .collect()
    }

    pub fn has(&self, field: TaskField) -> bool {
        match field {
            TaskField::Title => self.title.is_some(),
            TaskField::Project => self.project.is_some(),
            TaskField::Deadline => self.deadline.is_some(),
            TaskField::Responsible => self.responsible.is_some(),
            TaskField::Priority => self.priority.is_some(),
            TaskField::Notes => self.notes.is_some(),
            TaskField::Link => self.link.is_some(),
            TaskField::Completed => self.completed.is_some(),
        }
    }

    /// Set or clear (with [`FieldValue::Clear`]) the override for `field`
    pub fn set(&mut self, field: TaskField, value: FieldValue) -> Result<()> {
        match (field, value) {
            (field, FieldValue::Clear) => self.clear(field),
            (TaskField::Title, FieldValue::Text(text)) => self.title = Some(text),
            (TaskField::Project, FieldValue::Text(text)) => self.project = Some(text),
            (TaskField::Notes, FieldValue::Text(text)) => self.notes = Some(text),
            (TaskField::Link, FieldValue::Text(text)) => self.link = Some(text),
            (TaskField::Deadline, FieldValue::Date(date)) => self.deadline = Some(date),
            (TaskField::Responsible, FieldValue::Party(party)) => self.responsible = Some(party),
            (TaskField::Priority, FieldValue::Priority(priority)) => self.priority = Some(priority),
            (TaskField::Completed, FieldValue::Flag(flag)) => self.completed = Some(flag),
            (field, value) => {
                return Err(Error::InvalidArgument(format!(
                    "value {value:?} does not fit field '{field}'"
                )))
            }
        }
        Ok(())
    }

    pub fn clear(&mut self, field: TaskField) {
        match field {
            TaskField::Title => self.title = None,
            TaskField::Project => self.project = None,
            TaskField::Deadline => self.deadline = None,
            TaskField::Responsible => self.responsible = None,
            TaskField::Priority => self.priority = None,
            TaskField::Notes => self.notes = None,
            TaskField::Link => self.link = None,
            TaskField::Completed => self.completed = None,
        }
    }

    /// `base` with every present override applied
    pub fn apply_to(&self, base: &TaskFields) -> TaskFields {
        TaskFields {
            title: self.title.clone().unwrap_or_else(|| base.title.clone()),
            project: self.project.clone().or_else(|| base.project.clone()),
            deadline: self.deadline.or(base.deadline),
            responsible: self
                .responsible
                .clone()
                .unwrap_or_else(|| base.responsible.clone()),
            priority: self.priority.unwrap_or(base.priority),
            notes: self.notes.clone().or_else(|| base.notes.clone()),
            link: self.link.clone().or_else(|| base.link.clone()),
            completed: self.completed.unwrap_or(base.completed),
        }
    }
}

/// One dated materialization of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub id: String,
    pub template_id: String,
    /// `None` only for the clone of a template without a parsable deadline
    pub occurrence_date: Option<CalendarDate>,
    pub sequence_number: u32,
    pub base_fields: TaskFields,
    #[serde(default)]
    pub overrides: Overrides,
    /// Mirror of the effective completion flag, for cheap filtering
    #[serde(default)]
    pub completion_status: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Occurrence {
    /// A fresh, open occurrence of `template` on `date`
    pub fn new(template: &Template, date: CalendarDate, sequence_number: u32) -> Self {
        Self::build(
            occurrence_id(&template.id, &date),
            template,
            Some(date),
            sequence_number,
            false,
        )
    }

    /// The single working copy of a non-recurring template.
    ///
    /// Unlike dated occurrences the clone starts with the template's own
    /// completion flag, since the template is the task.
    pub fn new_clone(template: &Template) -> Self {
        let date = template.deadline_date();
        Self::build(clone_id(&template.id), template, date, 0, template.completed)
    }

    fn build(
        id: String,
        template: &Template,
        date: Option<CalendarDate>,
        sequence_number: u32,
        completed: bool,
    ) -> Self {
        let now = Utc::now();
        let mut base_fields = TaskFields::snapshot(template, date);
        base_fields.completed = completed;
        Self {
            id,
            template_id: template.id.clone(),
            occurrence_date: date,
            sequence_number,
            completion_status: base_fields.completed,
            base_fields,
            overrides: Overrides::default(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_clone(&self) -> bool {
        split_occurrence_id(&self.id).map(|(_, rest)| rest) == Some(CLONE_SUFFIX)
    }

    pub fn has_deviations(&self) -> bool {
        !self.overrides.is_empty()
    }

    /// Effective field values
    pub fn effective(&self) -> TaskFields {
        self.overrides.apply_to(&self.base_fields)
    }

    /// Record a user edit on this occurrence only
    pub fn set_override(&mut self, field: TaskField, value: FieldValue) -> Result<()> {
        self.overrides.set(field, value)?;
        self.refresh_completion();
        self.last_modified = Utc::now();
        Ok(())
    }

    /// Cascade the descriptive fields of `template` into `base_fields`.
    ///
    /// Returns whether the snapshot changed. Overrides and the date are left
    /// alone, as is the completion flag of dated occurrences.
    pub fn rebase(&mut self, template: &Template) -> bool {
        let before = self.base_fields.clone();
        self.take_template_fields(template);
        let changed = self.base_fields != before;
        if changed {
            self.last_modified = Utc::now();
        }
        changed
    }

    /// Copy the template-owned fields into `base_fields`.
    ///
    /// The working copy of a single task also takes the template's
    /// completion flag: there the template is the task.
    pub fn take_template_fields(&mut self, template: &Template) {
        self.base_fields.cascade_from(template);
        if self.is_clone() && !template.recurring {
            self.base_fields.completed = template.completed;
        }
        self.refresh_completion();
    }

    /// Replace everything the template owns with `incoming`, keeping this
    /// record's overrides and creation time
    pub fn absorb_snapshot(&mut self, incoming: Occurrence) {
        let overrides = std::mem::take(&mut self.overrides);
        let created_at = self.created_at;
        *self = incoming;
        self.overrides = overrides;
        self.created_at = created_at;
        self.refresh_completion();
    }

    pub fn refresh_completion(&mut self) {
        self.completion_status = self.overrides.completed.unwrap_or(self.base_fields.completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        let mut template = Template::new("T1", "Pay rent");
        template.deadline = Some("2024-01-15".to_string());
        template.notes = Some("base note".to_string());
        template
    }

    fn date(y: i32, m: u32, d: u32) -> CalendarDate {
        CalendarDate::from_ymd(y, m, d).expect("date")
    }

    #[test]
    fn ids_are_derived_from_template_and_date() {
        let occurrence = Occurrence::new(&template(), date(2024, 3, 15), 1);
        assert_eq!(occurrence.id, "T1#2024-03-15");
        assert_eq!(split_occurrence_id(&occurrence.id), Some(("T1", "2024-03-15")));
        assert!(!occurrence.is_clone());

        let clone = Occurrence::new_clone(&template());
        assert_eq!(clone.id, "T1#_clone");
        assert!(clone.is_clone());
        assert_eq!(clone.occurrence_date, Some(date(2024, 1, 15)));
    }

    #[test]
    fn ids_do_not_collide_across_templates() {
        let d = date(2024, 3, 15);
        assert_ne!(occurrence_id("T1", &d), occurrence_id("T11", &d));
        assert_ne!(occurrence_id("T1", &d), clone_id("T1"));
    }

    #[test]
    fn overrides_win_over_base_without_touching_it() {
        let mut occurrence = Occurrence::new(&template(), date(2024, 1, 15), 0);
        occurrence
            .set_override(TaskField::Notes, FieldValue::Text("mine".to_string()))
            .expect("notes");
        occurrence
            .set_override(TaskField::Completed, FieldValue::Flag(true))
            .expect("completed");

        let effective = occurrence.effective();
        assert_eq!(effective.notes.as_deref(), Some("mine"));
        assert!(effective.completed);
        assert!(occurrence.completion_status);
        assert_eq!(occurrence.base_fields.notes.as_deref(), Some("base note"));
        assert!(!occurrence.base_fields.completed);
        assert_eq!(
            occurrence.overrides.fields(),
            vec![TaskField::Notes, TaskField::Completed]
        );
    }

    #[test]
    fn clearing_an_override_falls_back_to_base() {
        let mut occurrence = Occurrence::new(&template(), date(2024, 1, 15), 0);
        occurrence
            .set_override(TaskField::Completed, FieldValue::Flag(true))
            .expect("set");
        occurrence
            .set_override(TaskField::Completed, FieldValue::Clear)
            .expect("clear");
        assert!(!occurrence.has_deviations());
        assert!(!occurrence.completion_status);
    }

    #[test]
    fn dated_occurrences_start_open_but_clones_follow_the_template() {
        let mut done = template();
        done.completed = true;
        assert!(!Occurrence::new(&done, date(2024, 2, 15), 1).completion_status);
        assert!(Occurrence::new_clone(&done).completion_status);
    }

    #[test]
    fn rebase_keeps_overrides_and_completion() {
        let mut occurrence = Occurrence::new(&template(), date(2024, 1, 15), 0);
        occurrence
            .set_override(TaskField::Completed, FieldValue::Flag(true))
            .expect("completed");

        let mut renamed = template();
        renamed.title = "Pay the rent".to_string();
        renamed.completed = true;
        assert!(occurrence.rebase(&renamed));
        assert!(!occurrence.rebase(&renamed));

        assert_eq!(occurrence.base_fields.title, "Pay the rent");
        assert_eq!(occurrence.base_fields.deadline, Some(date(2024, 1, 15)));
        assert!(!occurrence.base_fields.completed);
        assert_eq!(occurrence.overrides.completed, Some(true));
    }

    #[test]
    fn single_task_copy_tracks_template_completion() {
        let mut copy = Occurrence::new_clone(&template());
        assert!(!copy.completion_status);

        let mut done = template();
        done.completed = true;
        assert!(copy.rebase(&done));
        assert!(copy.base_fields.completed);
        assert!(copy.completion_status);

        copy.set_override(TaskField::Completed, FieldValue::Flag(false))
            .expect("reopen");
        assert!(!copy.rebase(&done));
        assert!(!copy.completion_status);
    }

    #[test]
    fn absorbing_a_snapshot_keeps_user_state() {
        let mut stored = Occurrence::new(&template(), date(2024, 1, 15), 0);
        stored
            .set_override(TaskField::Completed, FieldValue::Flag(true))
            .expect("completed");
        let created_at = stored.created_at;

        let mut renamed = template();
        renamed.title = "Rent".to_string();
        stored.absorb_snapshot(Occurrence::new(&renamed, date(2024, 1, 15), 3));

        assert_eq!(stored.base_fields.title, "Rent");
        assert_eq!(stored.sequence_number, 3);
        assert_eq!(stored.created_at, created_at);
        assert_eq!(stored.overrides.completed, Some(true));
        assert!(stored.completion_status);
    }

    #[test]
    fn mismatched_values_are_rejected() {
        let mut overrides = Overrides::default();
        let err = overrides
            .set(TaskField::Completed, FieldValue::Text("yes".to_string()))
            .expect_err("type mismatch");
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(overrides.is_empty());
    }

    #[test]
    fn field_values_parse_from_strings() {
        assert_eq!(
            FieldValue::parse(TaskField::Completed, "yes").expect("flag"),
            FieldValue::Flag(true)
        );
        assert_eq!(
            FieldValue::parse(TaskField::Priority, "urgent").expect("priority"),
            FieldValue::Priority(Priority::Urgent)
        );
        assert_eq!(
            FieldValue::parse(TaskField::Deadline, "03/01/2024").expect("date"),
            FieldValue::Date(date(2024, 3, 1))
        );
        assert!(FieldValue::parse(TaskField::Deadline, "whenever").is_err());
        assert_eq!("due".parse::<TaskField>().expect("field"), TaskField::Deadline);
    }

    #[test]
    fn persisted_layout_uses_camel_case_keys() {
        let occurrence = Occurrence::new(&template(), date(2024, 1, 15), 0);
        let value = serde_json::to_value(&occurrence).expect("serialize");
        assert_eq!(value["templateId"], "T1");
        assert_eq!(value["occurrenceDate"], "2024-01-15");
        assert_eq!(value["sequenceNumber"], 0);
        assert_eq!(value["completionStatus"], false);
        assert!(value["baseFields"].is_object());
        assert!(value["overrides"].as_object().map(|o| o.is_empty()).unwrap_or(false));
    }
}
