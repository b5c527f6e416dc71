//! Instance generator
//!
//! Expands one template into its bounded, dated sequence of occurrences and
//! works out how that sequence differs from what is already stored.
//!
//! Generation is split in two so the scheduling rules stay pure:
//! - [`generate`] computes a [`GenerationPlan`] from a template and the
//!   occurrences that already exist for it
//! - [`apply`] writes the plan through an [`OccurrenceStore`], isolating
//!   failures per record
//!
//! Dates are computed from the start date as `start + n * interval` months
//! rather than by repeatedly adding to the previous date, so a clamped
//! month-end (Jan 31 to Feb 29) never drags later occurrences to the 29th.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::date::{self, CalendarDate};
use crate::error::Result;
use crate::occurrence::{clone_id, occurrence_id, Occurrence, TaskField};
use crate::store::{OccurrenceStore, StoreFailure};
use crate::template::Template;

/// Non-fatal problems found while scheduling a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Recurring without an interval of at least one month
    MissingInterval { template_id: String },
    /// Recurring without a parsable deadline to start from
    UnparseableStart {
        template_id: String,
        raw: Option<String>,
    },
    /// Start date lies after the horizon
    StartBeyondHorizon {
        template_id: String,
        start: CalendarDate,
    },
    /// Final date could not be parsed; the default span was used
    UnparseableFinalDate { template_id: String, raw: String },
    /// Final date precedes the start; only the start date was generated
    FinalBeforeStart {
        template_id: String,
        start: CalendarDate,
        final_date: CalendarDate,
    },
    /// The occurrence cap cut the sequence short
    Truncated { template_id: String, limit: usize },
}

impl Diagnostic {
    pub fn template_id(&self) -> &str {
        match self {
            Diagnostic::MissingInterval { template_id }
            | Diagnostic::UnparseableStart { template_id, .. }
            | Diagnostic::StartBeyondHorizon { template_id, .. }
            | Diagnostic::UnparseableFinalDate { template_id, .. }
            | Diagnostic::FinalBeforeStart { template_id, .. }
            | Diagnostic::Truncated { template_id, .. } => template_id,
        }
    }

    /// Whether the template fell back to a single working copy
    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self,
            Diagnostic::MissingInterval { .. }
                | Diagnostic::UnparseableStart { .. }
                | Diagnostic::StartBeyondHorizon { .. }
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingInterval { template_id } => {
                write!(f, "{template_id}: recurring without a valid interval")
            }
            Diagnostic::UnparseableStart { template_id, raw } => write!(
                f,
                "{template_id}: cannot parse start date '{}'",
                raw.as_deref().unwrap_or("")
            ),
            Diagnostic::StartBeyondHorizon { template_id, start } => {
                write!(f, "{template_id}: start date {start} is beyond the horizon")
            }
            Diagnostic::UnparseableFinalDate { template_id, raw } => {
                write!(f, "{template_id}: cannot parse final date '{raw}'")
            }
            Diagnostic::FinalBeforeStart {
                template_id,
                start,
                final_date,
            } => write!(
                f,
                "{template_id}: final date {final_date} is before start {start}"
            ),
            Diagnostic::Truncated { template_id, limit } => {
                write!(f, "{template_id}: sequence capped at {limit} occurrences")
            }
        }
    }
}

/// User edits that were discarded because their date left the schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanedDeviation {
    pub occurrence_id: String,
    pub occurrence_date: Option<CalendarDate>,
    pub fields: Vec<TaskField>,
}

/// The active window and cadence of a recurring template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start: CalendarDate,
    pub end: CalendarDate,
    pub interval: u32,
}

impl Schedule {
    /// Work out the schedule of a recurring template.
    ///
    /// `Err` means the template cannot be scheduled at all. The `Ok` side may
    /// still carry diagnostics about the final date.
    pub fn for_template(
        template: &Template,
        config: &EngineConfig,
    ) -> std::result::Result<(Schedule, Vec<Diagnostic>), Diagnostic> {
        let template_id = template.id.clone();
        let interval = match template.interval {
            Some(interval) if interval >= 1 => interval,
            _ => return Err(Diagnostic::MissingInterval { template_id }),
        };
        let Some(start) = template.deadline_date() else {
            return Err(Diagnostic::UnparseableStart {
                template_id,
                raw: template.deadline.clone(),
            });
        };
        let horizon = match config.horizon() {
            Some(horizon) if start <= horizon => horizon,
            _ => return Err(Diagnostic::StartBeyondHorizon { template_id, start }),
        };

        let mut diagnostics = Vec::new();
        let default_end = start.add_years(config.default_span_years).unwrap_or(horizon);
        let raw_final = template
            .final_date
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty());
        let end = match raw_final {
            None => default_end,
            Some(raw) => match date::parse(raw) {
                Some(final_date) if final_date >= start => final_date,
                Some(final_date) => {
                    diagnostics.push(Diagnostic::FinalBeforeStart {
                        template_id: template_id.clone(),
                        start,
                        final_date,
                    });
                    start
                }
                None => {
                    diagnostics.push(Diagnostic::UnparseableFinalDate {
                        template_id: template_id.clone(),
                        raw: raw.to_string(),
                    });
                    default_end
                }
            },
        };

        Ok((
            Schedule {
                start,
                end: end.min(horizon),
                interval,
            },
            diagnostics,
        ))
    }

    /// Dates in `[start, end]`, at most `limit` of them.
    ///
    /// The flag is true when the limit cut the sequence short.
    pub fn dates(&self, limit: usize) -> (Vec<CalendarDate>, bool) {
        let mut dates = Vec::new();
        for step in 0u32.. {
            let Some(months) = step.checked_mul(self.interval) else {
                break;
            };
            let Some(date) = self.start.add_months(months) else {
                break;
            };
            if date > self.end {
                break;
            }
            if dates.len() == limit {
                return (dates, true);
            }
            dates.push(date);
        }
        (dates, false)
    }
}

/// What one generation pass will change for one template
#[derive(Debug, Clone, Default)]
pub struct GenerationPlan {
    pub template_id: String,
    /// New occurrences and existing ones whose snapshot or position changed
    pub upserts: Vec<Occurrence>,
    /// Existing occurrences left exactly as stored
    pub unchanged: Vec<Occurrence>,
    /// Ids of occurrences that no longer belong to the schedule
    pub deletes: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub orphaned: Vec<OrphanedDeviation>,
}

impl GenerationPlan {
    fn new(template_id: &str) -> Self {
        Self {
            template_id: template_id.to_string(),
            ..Self::default()
        }
    }

    /// Whether applying the plan would write anything
    pub fn is_noop(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// The full occurrence set after the plan is applied, in sequence order
    pub fn occurrences(&self) -> Vec<Occurrence> {
        let mut all: Vec<Occurrence> = self
            .upserts
            .iter()
            .chain(self.unchanged.iter())
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.sequence_number
                .cmp(&b.sequence_number)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }
}

struct Slot {
    id: String,
    date: Option<CalendarDate>,
    sequence_number: u32,
}

/// Compute the occurrence set of `template` against what already exists.
///
/// Scheduling problems never fail: they fall back to a single `_clone`
/// working copy and are reported as diagnostics. The only error is an
/// invalid template id, which would make occurrence ids ambiguous.
pub fn generate(
    template: &Template,
    existing: &[Occurrence],
    config: &EngineConfig,
) -> Result<GenerationPlan> {
    template.validate_id()?;
    let mut plan = GenerationPlan::new(&template.id);

    let mut current: BTreeMap<&str, &Occurrence> = BTreeMap::new();
    for occurrence in existing {
        if occurrence.template_id == template.id {
            current.insert(occurrence.id.as_str(), occurrence);
        } else {
            warn!(
                template_id = %template.id,
                occurrence_id = %occurrence.id,
                "ignoring occurrence of another template"
            );
        }
    }

    // A recurring template that cannot be scheduled keeps its dated
    // occurrences until the next pass that can.
    let mut keep_unlisted = false;
    let slots = if template.recurring {
        match Schedule::for_template(template, config) {
            Ok((schedule, notes)) => {
                plan.diagnostics.extend(notes);
                let (dates, truncated) = schedule.dates(config.max_occurrences);
                if truncated {
                    plan.diagnostics.push(Diagnostic::Truncated {
                        template_id: template.id.clone(),
                        limit: config.max_occurrences,
                    });
                }
                dates
                    .into_iter()
                    .zip(0u32..)
                    .map(|(date, sequence_number)| Slot {
                        id: occurrence_id(&template.id, &date),
                        date: Some(date),
                        sequence_number,
                    })
                    .collect()
            }
            Err(diagnostic) => {
                plan.diagnostics.push(diagnostic);
                keep_unlisted = true;
                vec![clone_slot(template)]
            }
        }
    } else {
        vec![clone_slot(template)]
    };

    for slot in slots {
        match current.remove(slot.id.as_str()) {
            Some(stored) => match refreshed(stored, template, &slot) {
                Some(next) => plan.upserts.push(next),
                None => plan.unchanged.push(stored.clone()),
            },
            None => plan.upserts.push(match slot.date {
                Some(date) if template.recurring && !keep_unlisted => {
                    Occurrence::new(template, date, slot.sequence_number)
                }
                _ => Occurrence::new_clone(template),
            }),
        }
    }

    for (id, stored) in current {
        if keep_unlisted && !stored.is_clone() {
            plan.unchanged.push(stored.clone());
            continue;
        }
        if stored.has_deviations() {
            plan.orphaned.push(OrphanedDeviation {
                occurrence_id: id.to_string(),
                occurrence_date: stored.occurrence_date,
                fields: stored.overrides.fields(),
            });
        }
        plan.deletes.push(id.to_string());
    }

    for diagnostic in &plan.diagnostics {
        warn!(template_id = %template.id, "{diagnostic}");
    }
    for orphan in &plan.orphaned {
        warn!(
            template_id = %template.id,
            occurrence_id = %orphan.occurrence_id,
            fields = ?orphan.fields,
            "discarding edits on an occurrence that left the schedule"
        );
    }
    debug!(
        template_id = %template.id,
        upserts = plan.upserts.len(),
        unchanged = plan.unchanged.len(),
        deletes = plan.deletes.len(),
        "planned generation"
    );

    Ok(plan)
}

fn clone_slot(template: &Template) -> Slot {
    Slot {
        id: clone_id(&template.id),
        date: template.deadline_date(),
        sequence_number: 0,
    }
}

/// `stored` brought up to date with `template`, or `None` when it already is
fn refreshed(stored: &Occurrence, template: &Template, slot: &Slot) -> Option<Occurrence> {
    let mut next = stored.clone();
    next.take_template_fields(template);
    next.base_fields.deadline = slot.date;
    next.occurrence_date = slot.date;
    next.sequence_number = slot.sequence_number;
    if next == *stored {
        return None;
    }
    next.last_modified = Utc::now();
    Some(next)
}

/// Outcome of applying one [`GenerationPlan`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationReport {
    pub template_id: String,
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
    pub failures: Vec<StoreFailure>,
    pub diagnostics: Vec<Diagnostic>,
    pub orphaned: Vec<OrphanedDeviation>,
}

impl GenerationReport {
    /// Occurrences of the template known to be stored after the pass
    pub fn instance_count(&self) -> usize {
        self.written.len() + self.unchanged
    }

    pub fn has_writes(&self) -> bool {
        !self.written.is_empty() || !self.deleted.is_empty()
    }
}

/// Persist `plan`. Failed records are reported, the rest still land.
pub async fn apply<S>(plan: GenerationPlan, store: &S) -> GenerationReport
where
    S: OccurrenceStore + ?Sized,
{
    let GenerationPlan {
        template_id,
        upserts,
        unchanged,
        deletes,
        diagnostics,
        orphaned,
    } = plan;

    let mut report = GenerationReport {
        template_id,
        unchanged: unchanged.len(),
        diagnostics,
        orphaned,
        ..GenerationReport::default()
    };

    if !upserts.is_empty() {
        let outcome = store.upsert_snapshots(upserts).await;
        report.written = outcome.succeeded;
        report.failures.extend(outcome.failed);
    }
    if !deletes.is_empty() {
        let outcome = store.delete_batch(deletes).await;
        report.deleted = outcome.succeeded;
        report.failures.extend(outcome.failed);
    }

    if report.has_writes() {
        debug!(
            template_id = %report.template_id,
            written = report.written.len(),
            deleted = report.deleted.len(),
            failures = report.failures.len(),
            "applied generation"
        );
    }
    report
}

/// Regenerate `template` against the occurrences stored for it
pub async fn regenerate<S>(
    template: &Template,
    store: &S,
    config: &EngineConfig,
) -> Result<GenerationReport>
where
    S: OccurrenceStore + ?Sized,
{
    let existing = store.get_by_template(&template.id).await?;
    let plan = generate(template, &existing, config)?;
    Ok(apply(plan, store).await)
}
