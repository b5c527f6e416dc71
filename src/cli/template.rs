//! recur template command implementations

use serde::Serialize;

use crate::config::EngineConfig;
use crate::date;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind};
use crate::generator::{Diagnostic, Schedule};
use crate::output::{emit_success, HumanOutput};
use crate::repository::TemplateRepository;
use crate::template::{ResponsibleParty, Template, TemplatePatch};

use super::{CommandContext, GlobalOptions, TemplateFields};

pub struct AddOptions {
    pub title: String,
    pub fields: TemplateFields,
    pub global: GlobalOptions,
}

pub struct EditOptions {
    pub id: String,
    pub title: Option<String>,
    pub fields: TemplateFields,
    pub once: bool,
    pub completed: Option<bool>,
    pub clear: Vec<String>,
    pub global: GlobalOptions,
}

#[derive(Serialize)]
struct TemplateReport {
    template: Template,
    /// Entries the template contributes to the task list
    tasks: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    diagnostics: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct TemplateListReport {
    templates: Vec<Template>,
}

#[derive(Serialize)]
struct TemplateRemovedReport {
    id: String,
    deleted: Vec<String>,
}

pub async fn run_add(options: AddOptions) -> Result<()> {
    let mut ctx = CommandContext::load(options.global)?;
    let title = options.title.trim();
    if title.is_empty() {
        return Err(Error::InvalidArgument("title cannot be empty".to_string()));
    }
    let mut draft = Template::new(String::new(), title);
    draft.apply(&fields_patch(options.fields)?);

    let store = ctx.open_engine().await?;
    let outcome = store.add_template(draft).await;
    let view = store.get_all();
    store.dispose().await;
    let template = outcome?;

    let tasks = count_tasks(&view, &template.id);
    let diagnostics = schedule_diagnostics(&template, &ctx.config.engine);
    let event_warning = ctx.emit_events(
        Event::new(EventKind::TemplateAdded, Some(template.id.clone()))
            .with_data(&template)
            .map(|event| vec![event]),
    );

    let mut human = HumanOutput::new("Template added");
    if let Some(warning) = event_warning {
        human.push_warning(warning);
    }
    push_template_summary(&mut human, &template, tasks);
    for diagnostic in &diagnostics {
        human.push_warning(diagnostic);
    }
    human.push_next_step(format!("recur list --template {}", template.id));

    let report = TemplateReport {
        template,
        tasks,
        diagnostics,
    };
    emit_success(ctx.output, "template add", &report, Some(&human))
}

pub async fn run_list(global: GlobalOptions) -> Result<()> {
    let ctx = CommandContext::load(global)?;
    let templates = ctx.repository().get_all().await?;

    let mut human = HumanOutput::new("Templates");
    human.push_summary("count", templates.len().to_string());
    for template in &templates {
        human.push_detail(format!(
            "{}  {}  ({})",
            template.id,
            template.title,
            describe_schedule(template)
        ));
    }
    if templates.is_empty() {
        human.push_next_step("recur template add <title> --deadline <date> --every <months>");
    }

    emit_success(
        ctx.output,
        "template list",
        &TemplateListReport { templates },
        Some(&human),
    )
}

pub async fn run_edit(options: EditOptions) -> Result<()> {
    let mut ctx = CommandContext::load(options.global)?;
    let mut patch = fields_patch(options.fields)?;
    if let Some(title) = options.title {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::InvalidArgument("title cannot be empty".to_string()));
        }
        patch.title = Some(title.to_string());
    }
    if options.once {
        patch.recurring = Some(false);
    }
    if let Some(completed) = options.completed {
        patch.completed = Some(completed);
    }
    for field in &options.clear {
        clear_field(&mut patch, field)?;
    }
    if patch.is_empty() {
        return Err(Error::InvalidArgument("nothing to change".to_string()));
    }

    let store = ctx.open_engine().await?;
    let outcome = store.update_template(&options.id, patch.clone()).await;
    let view = store.get_all();
    store.dispose().await;
    let template = outcome?;

    let tasks = count_tasks(&view, &template.id);
    let diagnostics = schedule_diagnostics(&template, &ctx.config.engine);
    let event_warning = ctx.emit_events(
        Event::new(EventKind::TemplateUpdated, Some(template.id.clone()))
            .with_data(&patch)
            .map(|event| vec![event]),
    );

    let mut human = HumanOutput::new("Template updated");
    if let Some(warning) = event_warning {
        human.push_warning(warning);
    }
    push_template_summary(&mut human, &template, tasks);
    for diagnostic in &diagnostics {
        human.push_warning(diagnostic);
    }

    let report = TemplateReport {
        template,
        tasks,
        diagnostics,
    };
    emit_success(ctx.output, "template edit", &report, Some(&human))
}

pub async fn run_rm(id: String, global: GlobalOptions) -> Result<()> {
    let mut ctx = CommandContext::load(global)?;
    let store = ctx.open_engine().await?;
    let outcome = store.remove_template(&id).await;
    store.dispose().await;
    let deleted = outcome?;

    let events = std::iter::once(Event::new(EventKind::TemplateRemoved, Some(id.clone())))
        .chain(
            deleted
                .iter()
                .map(|occurrence| Event::new(EventKind::OccurrenceDeleted, Some(occurrence.clone()))),
        )
        .collect();
    let event_warning = ctx.emit_events(Ok(events));

    let mut human = HumanOutput::new("Template removed");
    if let Some(warning) = event_warning {
        human.push_warning(warning);
    }
    human.push_summary("ID", id.clone());
    human.push_summary("occurrences deleted", deleted.len().to_string());

    emit_success(
        ctx.output,
        "template rm",
        &TemplateRemovedReport { id, deleted },
        Some(&human),
    )
}

/// Translate the shared flags into a patch, checking dates up front
fn fields_patch(fields: TemplateFields) -> Result<TemplatePatch> {
    let mut patch = TemplatePatch::default();
    if let Some(project) = fields.project {
        patch.project = Some(non_blank(project));
    }
    if let Some(deadline) = fields.deadline {
        patch.deadline = Some(Some(checked_date("--deadline", &deadline)?));
    }
    if let Some(responsible) = fields.responsible {
        patch.responsible = Some(responsible.into_iter().collect());
    }
    if let Some(every) = fields.every {
        if every == 0 {
            return Err(Error::InvalidArgument(
                "--every must be at least 1 month".to_string(),
            ));
        }
        patch.recurring = Some(true);
        patch.interval = Some(Some(every));
    }
    if let Some(until) = fields.until {
        patch.final_date = Some(Some(checked_date("--until", &until)?));
    }
    if let Some(priority) = fields.priority {
        patch.priority = Some(priority.parse()?);
    }
    if let Some(notes) = fields.notes {
        patch.notes = Some(non_blank(notes));
    }
    if let Some(link) = fields.link {
        patch.link = Some(non_blank(link));
    }
    Ok(patch)
}

fn clear_field(patch: &mut TemplatePatch, field: &str) -> Result<()> {
    match field.trim().to_ascii_lowercase().as_str() {
        "project" => patch.project = Some(None),
        "deadline" => patch.deadline = Some(None),
        "responsible" => patch.responsible = Some(ResponsibleParty::new()),
        "until" | "final_date" | "final-date" => patch.final_date = Some(None),
        "every" | "interval" => patch.interval = Some(None),
        "notes" => patch.notes = Some(None),
        "link" => patch.link = Some(None),
        other => {
            return Err(Error::InvalidArgument(format!(
                "cannot clear '{other}' (expected project, deadline, responsible, until, every, notes, link)"
            )))
        }
    }
    Ok(())
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn checked_date(flag: &str, raw: &str) -> Result<String> {
    date::parse(raw)
        .map(|parsed| parsed.to_iso())
        .ok_or_else(|| Error::InvalidArgument(format!("{flag}: unparseable date '{raw}'")))
}

fn count_tasks(view: &[crate::combined::TaskView], template_id: &str) -> usize {
    view.iter()
        .filter(|task| task.original_template_id == template_id)
        .count()
}

fn schedule_diagnostics(template: &Template, config: &EngineConfig) -> Vec<Diagnostic> {
    if !template.recurring {
        return Vec::new();
    }
    match Schedule::for_template(template, config) {
        Ok((_, diagnostics)) => diagnostics,
        Err(diagnostic) => vec![diagnostic],
    }
}

fn describe_schedule(template: &Template) -> String {
    let start = template.deadline.as_deref().unwrap_or("no deadline");
    if !template.recurring {
        return format!("once, {start}");
    }
    let every = match template.interval {
        Some(1) => "every month".to_string(),
        Some(months) => format!("every {months} months"),
        None => "no interval".to_string(),
    };
    match template.final_date.as_deref() {
        Some(until) => format!("{every} from {start} until {until}"),
        None => format!("{every} from {start}"),
    }
}

fn push_template_summary(human: &mut HumanOutput, template: &Template, tasks: usize) {
    human.push_summary("ID", template.id.clone());
    human.push_summary("Title", template.title.clone());
    human.push_summary("Schedule", describe_schedule(template));
    human.push_summary("Tasks", tasks.to_string());
}
