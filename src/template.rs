//! Task templates as read from the template repository.
//!
//! Templates are the user-authored definition of a task. The engine only ever
//! reads them; writes go through a [`TemplateRepository`] as a
//! [`TemplatePatch`].
//!
//! [`TemplateRepository`]: crate::repository::TemplateRepository

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::date::{self, CalendarDate};
use crate::error::{Error, Result};
use crate::occurrence::{FieldValue, TaskField, ID_SEPARATOR};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "Normal",
            Priority::Urgent => "Urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Priority::Normal),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::InvalidArgument(format!(
                "invalid priority '{other}' (expected normal|urgent)"
            ))),
        }
    }
}

/// Ordered set of assignee identifiers.
///
/// Insertion order is kept and duplicates are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ResponsibleParty(Vec<String>);

impl ResponsibleParty {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an assignee; returns false when it was already present
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        let id = id.trim();
        if id.is_empty() || self.contains(id) {
            return false;
        }
        self.0.push(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|entry| entry == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ResponsibleParty {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut party = ResponsibleParty::new();
        for id in iter {
            party.insert(id);
        }
        party
    }
}

impl From<Vec<String>> for ResponsibleParty {
    fn from(ids: Vec<String>) -> Self {
        ids.into_iter().collect()
    }
}

impl From<ResponsibleParty> for Vec<String> {
    fn from(party: ResponsibleParty) -> Self {
        party.0
    }
}

impl fmt::Display for ResponsibleParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

/// A task template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// First occurrence date, as stored by the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "ResponsibleParty::is_empty")]
    pub responsible: ResponsibleParty,
    #[serde(default)]
    pub recurring: bool,
    /// Months between occurrences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_date: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl Template {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            project: None,
            deadline: None,
            responsible: ResponsibleParty::new(),
            recurring: false,
            interval: None,
            final_date: None,
            priority: Priority::Normal,
            notes: None,
            link: None,
            completed: false,
        }
    }

    pub fn deadline_date(&self) -> Option<CalendarDate> {
        date::parse_opt(self.deadline.as_deref())
    }

    /// Reject ids that would make occurrence ids ambiguous
    pub fn validate_id(&self) -> Result<()> {
        validate_template_id(&self.id)
    }

    /// Apply the fields present in `patch`
    pub fn apply(&mut self, patch: &TemplatePatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(project) = &patch.project {
            self.project = project.clone();
        }
        if let Some(deadline) = &patch.deadline {
            self.deadline = deadline.clone();
        }
        if let Some(responsible) = &patch.responsible {
            self.responsible = responsible.clone();
        }
        if let Some(recurring) = patch.recurring {
            self.recurring = recurring;
        }
        if let Some(interval) = patch.interval {
            self.interval = interval;
        }
        if let Some(final_date) = &patch.final_date {
            self.final_date = final_date.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
        if let Some(link) = &patch.link {
            self.link = link.clone();
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
    }
}

pub fn validate_template_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidTemplateId {
            id: id.to_string(),
            reason: "id cannot be empty".to_string(),
        });
    }
    if id.contains(ID_SEPARATOR) {
        return Err(Error::InvalidTemplateId {
            id: id.to_string(),
            reason: format!("id cannot contain '{ID_SEPARATOR}'"),
        });
    }
    Ok(())
}

/// Partial template update.
///
/// `None` means "leave unchanged". Clearable fields nest a second `Option`, so
/// `Some(None)` explicitly clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible: Option<ResponsibleParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_date: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl TemplatePatch {
    pub fn is_empty(&self) -> bool {
        *self == TemplatePatch::default()
    }

    /// Patch setting one field, as routed from a task field edit
    pub fn from_field(field: TaskField, value: FieldValue) -> Result<Self> {
        let mut patch = TemplatePatch::default();
        match (field, value) {
            (TaskField::Title, FieldValue::Text(text)) => patch.title = Some(text),
            (TaskField::Title, FieldValue::Clear) => {
                return Err(Error::InvalidArgument("title cannot be cleared".to_string()))
            }
            (TaskField::Project, FieldValue::Text(text)) => patch.project = Some(Some(text)),
            (TaskField::Project, FieldValue::Clear) => patch.project = Some(None),
            (TaskField::Deadline, FieldValue::Date(date)) => {
                patch.deadline = Some(Some(date.to_iso()))
            }
            (TaskField::Deadline, FieldValue::Clear) => patch.deadline = Some(None),
            (TaskField::Responsible, FieldValue::Party(party)) => patch.responsible = Some(party),
            (TaskField::Responsible, FieldValue::Clear) => {
                patch.responsible = Some(ResponsibleParty::new())
            }
            (TaskField::Priority, FieldValue::Priority(priority)) => patch.priority = Some(priority),
            (TaskField::Priority, FieldValue::Clear) => patch.priority = Some(Priority::Normal),
            (TaskField::Notes, FieldValue::Text(text)) => patch.notes = Some(Some(text)),
            (TaskField::Notes, FieldValue::Clear) => patch.notes = Some(None),
            (TaskField::Link, FieldValue::Text(text)) => patch.link = Some(Some(text)),
            (TaskField::Link, FieldValue::Clear) => patch.link = Some(None),
            (TaskField::Completed, FieldValue::Flag(flag)) => patch.completed = Some(flag),
            (TaskField::Completed, FieldValue::Clear) => patch.completed = Some(false),
            (field, value) => {
                return Err(Error::InvalidArgument(format!(
                    "value {value:?} does not fit field '{field}'"
                )))
            }
        }
        Ok(patch)
    }

    /// Whether applying this patch can change which occurrences exist
    pub fn touches_schedule(&self) -> bool {
        self.recurring.is_some()
            || self.interval.is_some()
            || self.final_date.is_some()
            || self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responsible_party_keeps_order_and_drops_duplicates() {
        let party: ResponsibleParty = ["bob", "alice", "bob", " ", "carol"].into_iter().collect();
        assert_eq!(party.iter().collect::<Vec<_>>(), vec!["bob", "alice", "carol"]);
        assert_eq!(party.to_string(), "bob, alice, carol");
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("URGENT".parse::<Priority>().expect("priority"), Priority::Urgent);
        assert_eq!(" normal ".parse::<Priority>().expect("priority"), Priority::Normal);
        assert!("high".parse::<Priority>().is_err());
    }

    #[test]
    fn patch_applies_only_present_fields() {
        let mut template = Template::new("T1", "Quarterly report");
        template.notes = Some("keep".to_string());
        template.link = Some("https://example.com".to_string());

        let patch = TemplatePatch {
            title: Some("Monthly report".to_string()),
            link: Some(None),
            ..TemplatePatch::default()
        };
        template.apply(&patch);

        assert_eq!(template.title, "Monthly report");
        assert_eq!(template.notes.as_deref(), Some("keep"));
        assert_eq!(template.link, None);
        assert!(!patch.touches_schedule());
    }

    #[test]
    fn field_edits_become_patches() {
        let patch = TemplatePatch::from_field(
            TaskField::Deadline,
            FieldValue::Date(CalendarDate::from_ymd(2024, 2, 1).expect("date")),
        )
        .expect("deadline");
        assert_eq!(patch.deadline, Some(Some("2024-02-01".to_string())));
        assert!(patch.touches_schedule());

        let patch = TemplatePatch::from_field(TaskField::Notes, FieldValue::Clear).expect("notes");
        assert_eq!(patch.notes, Some(None));
        assert!(!patch.touches_schedule());

        assert!(TemplatePatch::from_field(TaskField::Title, FieldValue::Clear).is_err());
        assert!(TemplatePatch::from_field(TaskField::Link, FieldValue::Flag(true)).is_err());
    }

    #[test]
    fn template_ids_cannot_contain_separator() {
        assert!(validate_template_id("T1").is_ok());
        assert!(matches!(
            validate_template_id("T#1"),
            Err(Error::InvalidTemplateId { .. })
        ));
        assert!(validate_template_id("  ").is_err());
    }
}
