//! Command output: a versioned JSON envelope or a short human report.
//!
//! Engine problems that do not fail a command (schedule diagnostics, edits
//! dropped with their occurrence, records that could not be written) travel
//! as structured [`Warning`]s, so `--json` consumers can act on them without
//! parsing the human text.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::generator::{Diagnostic, OrphanedDeviation};
use crate::store::StoreFailure;

pub const SCHEMA_VERSION: &str = "recur.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

/// Where a warning came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSource {
    /// A template could not be scheduled as written
    Schedule,
    /// User edits were discarded with their occurrence
    OrphanedEdit,
    /// An occurrence could not be written
    WriteFailed,
    /// Anything else, such as an unwritable event sink
    Note,
}

/// A non-fatal problem reported next to a successful result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub source: WarningSource,
    /// Template or occurrence the warning is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Warning {
    fn new(source: WarningSource, id: Option<String>, message: String) -> Self {
        Self {
            source,
            id,
            message,
            detail: None,
        }
    }

    fn with_detail<T: Serialize>(mut self, detail: &T) -> Self {
        self.detail = serde_json::to_value(detail).ok();
        self
    }
}

impl From<&Diagnostic> for Warning {
    fn from(diagnostic: &Diagnostic) -> Self {
        Warning::new(
            WarningSource::Schedule,
            Some(diagnostic.template_id().to_string()),
            diagnostic.to_string(),
        )
        .with_detail(diagnostic)
    }
}

impl From<&OrphanedDeviation> for Warning {
    fn from(orphan: &OrphanedDeviation) -> Self {
        Warning::new(
            WarningSource::OrphanedEdit,
            Some(orphan.occurrence_id.clone()),
            format!(
                "{} dropped with edits to {} field(s)",
                orphan.occurrence_id,
                orphan.fields.len()
            ),
        )
        .with_detail(orphan)
    }
}

impl From<&StoreFailure> for Warning {
    fn from(failure: &StoreFailure) -> Self {
        Warning::new(
            WarningSource::WriteFailed,
            Some(failure.id.clone()),
            format!("{}: {}", failure.id, failure.error),
        )
    }
}

impl From<String> for Warning {
    fn from(message: String) -> Self {
        Warning::new(WarningSource::Note, None, message)
    }
}

#[derive(Debug, Clone)]
pub struct HumanOutput {
    header: String,
    summary: Vec<(String, String)>,
    details: Vec<String>,
    warnings: Vec<Warning>,
    next_steps: Vec<String>,
}

impl HumanOutput {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            summary: Vec::new(),
            details: Vec::new(),
            warnings: Vec::new(),
            next_steps: Vec::new(),
        }
    }

    pub fn push_summary(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.summary.push((key.into(), value.into()));
    }

    pub fn push_detail(&mut self, value: impl Into<String>) {
        self.details.push(value.into());
    }

    pub fn push_warning(&mut self, warning: impl Into<Warning>) {
        self.warnings.push(warning.into());
    }

    pub fn push_next_step(&mut self, value: impl Into<String>) {
        self.next_steps.push(value.into());
    }
}

#[derive(Serialize)]
struct SuccessEnvelope<'a, T: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    status: &'static str,
    data: &'a T,
    #[serde(skip_serializing_if = "is_empty")]
    warnings: &'a [Warning],
    #[serde(skip_serializing_if = "is_empty")]
    next_steps: &'a [String],
}

fn is_empty<T>(items: &&[T]) -> bool {
    items.is_empty()
}

fn success_envelope<'a, T: Serialize>(
    command: &'a str,
    data: &'a T,
    human: Option<&'a HumanOutput>,
) -> SuccessEnvelope<'a, T> {
    SuccessEnvelope {
        schema_version: SCHEMA_VERSION,
        command,
        status: "success",
        data,
        warnings: human.map(|h| h.warnings.as_slice()).unwrap_or_default(),
        next_steps: human.map(|h| h.next_steps.as_slice()).unwrap_or_default(),
    }
}

pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    human: Option<&HumanOutput>,
) -> Result<()> {
    if options.json {
        let payload = success_envelope(command, data, human);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if options.quiet {
        return Ok(());
    }

    if let Some(human) = human {
        println!("{}", format_human(human));
    }

    Ok(())
}

pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    let hint = error_hint(err);
    if json {
        #[derive(Serialize)]
        struct ErrorBody<'a> {
            message: &'a str,
            code: i32,
            kind: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<serde_json::Value>,
        }

        #[derive(Serialize)]
        struct Envelope<'a> {
            schema_version: &'static str,
            command: &'a str,
            status: &'static str,
            error: ErrorBody<'a>,
            #[serde(skip_serializing_if = "Option::is_none")]
            hint: Option<&'static str>,
        }

        let payload = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "error",
            error: ErrorBody {
                message: &err.to_string(),
                code: err.exit_code(),
                kind: error_kind(err),
                details: err.details(),
            },
            hint,
        };

        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    eprintln!("error: {err}");
    if let Some(hint) = hint {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

pub fn format_human(output: &HumanOutput) -> String {
    let mut lines = vec![output.header.clone()];

    if !output.summary.is_empty() {
        lines.push(String::new());
        lines.push("Summary:".to_string());
        for (key, value) in &output.summary {
            lines.push(format!("- {key}: {value}"));
        }
    }
    push_section(&mut lines, "Details", output.details.iter());
    push_section(
        &mut lines,
        "Warnings",
        output.warnings.iter().map(|warning| &warning.message),
    );
    push_section(&mut lines, "Next steps", output.next_steps.iter());

    lines.join("\n")
}

fn error_kind(err: &Error) -> &'static str {
    if err.is_user_error() {
        "user_error"
    } else {
        "operation_failed"
    }
}

fn error_hint(err: &Error) -> Option<&'static str> {
    match err {
        Error::NotFound(_) => Some("recur list"),
        Error::TemplateNotFound(_) => Some("recur template list"),
        Error::InvalidTemplateId { .. } => {
            Some("template ids must be non-empty and must not contain '#'")
        }
        Error::InvalidConfig(_) => Some("fix .recur/config.toml then retry"),
        Error::LockFailed(_) => Some("another recur process holds the data files; retry"),
        Error::Store(_) => Some("recur init"),
        _ => None,
    }
}

fn push_section<'a>(lines: &mut Vec<String>, title: &str, items: impl Iterator<Item = &'a String>) {
    let mut items = items.peekable();
    if items.peek().is_none() {
        return;
    }

    lines.push(String::new());
    lines.push(format!("{title}:"));
    lines.extend(items.map(|item| format!("- {item}")));
}
