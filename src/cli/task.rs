//! recur list, set and unset command implementations

use serde::Serialize;

use crate::combined::{CombinedTaskStore, TaskView};
use crate::error::Result;
use crate::events::{Event, EventKind};
use crate::occurrence::{clone_id, split_occurrence_id, FieldValue, TaskField};
use crate::output::{emit_success, HumanOutput};

use super::{CommandContext, GlobalOptions};

pub struct ListOptions {
    pub template: Option<String>,
    pub open: bool,
    pub global: GlobalOptions,
}

pub struct SetOptions {
    pub id: String,
    pub field: String,
    /// `None` clears the field
    pub value: Option<String>,
    pub global: GlobalOptions,
}

#[derive(Serialize)]
struct TaskListReport {
    total: usize,
    tasks: Vec<TaskView>,
}

#[derive(Serialize)]
struct TaskUpdatedReport {
    id: String,
    field: TaskField,
    value: FieldValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<TaskView>,
}

pub async fn run_list(options: ListOptions) -> Result<()> {
    let mut ctx = CommandContext::load(options.global)?;
    let store = ctx.open_engine().await?;
    let outcome = store.refresh().await;
    let view = store.get_all();
    store.dispose().await;
    let report = outcome?;
    let event_warning = if report.has_writes() {
        ctx.emit_events(Event::from_reconcile(&report))
    } else {
        None
    };

    let tasks = filter_tasks(view, options.template.as_deref(), options.open);
    let mut human = HumanOutput::new(format!("Tasks ({})", tasks.len()));
    if let Some(warning) = event_warning {
        human.push_warning(warning);
    }
    for diagnostic in &report.diagnostics {
        human.push_warning(diagnostic);
    }
    for task in &tasks {
        human.push_detail(format_task(task));
    }
    if tasks.is_empty() && options.template.is_none() {
        human.push_next_step("recur template add <title> --deadline <date> --every <months>");
    }

    emit_success(
        ctx.output,
        "list",
        &TaskListReport {
            total: tasks.len(),
            tasks,
        },
        Some(&human),
    )
}

pub async fn run_set(options: SetOptions) -> Result<()> {
    let mut ctx = CommandContext::load(options.global)?;
    let field: TaskField = options.field.parse()?;
    let value = match options.value.as_deref() {
        Some(raw) => FieldValue::parse(field, raw)?,
        None => FieldValue::Clear,
    };
    let command = if options.value.is_some() { "set" } else { "unset" };

    let store = ctx.open_engine().await?;
    let outcome = refresh_and_update(&store, &options.id, field, value.clone()).await;
    let view = store.get_all();
    store.dispose().await;
    outcome?;

    let task = find_task(&view, &options.id);
    let event = if split_occurrence_id(&options.id).is_some() {
        Event::override_set(&options.id, field, &value)
    } else {
        Event::new(EventKind::TemplateUpdated, Some(options.id.clone())).with_data(
            serde_json::json!({
                "field": field,
                "value": &value,
            }),
        )
    };
    let event_warning = ctx.emit_events(event.map(|event| vec![event]));

    let mut human = HumanOutput::new(format!("Updated {field} of {}", options.id));
    if let Some(warning) = event_warning {
        human.push_warning(warning);
    }
    if let Some(task) = &task {
        human.push_summary("task", format_task(task));
        if !task.overridden.is_empty() {
            let fields: Vec<&str> = task.overridden.iter().map(|field| field.as_str()).collect();
            human.push_summary("overridden", fields.join(", "));
        }
    }

    let report = TaskUpdatedReport {
        id: options.id,
        field,
        value,
        task,
    };
    emit_success(ctx.output, command, &report, Some(&human))
}

/// Bring occurrences up to date first so the edit lands on current records
async fn refresh_and_update(
    store: &CombinedTaskStore,
    id: &str,
    field: TaskField,
    value: FieldValue,
) -> Result<()> {
    store.refresh().await?;
    store.update_field(id, field, value).await
}

fn filter_tasks(view: Vec<TaskView>, template: Option<&str>, open: bool) -> Vec<TaskView> {
    view.into_iter()
        .filter(|task| template.map_or(true, |id| task.original_template_id == id))
        .filter(|task| !open || !task.completed)
        .collect()
}

/// The view entry an edit landed on.
///
/// Single-task completion is stored on the working copy but still shown under
/// the template id.
fn find_task(view: &[TaskView], id: &str) -> Option<TaskView> {
    view.iter()
        .find(|task| task.id == id)
        .or_else(|| {
            let (template_id, _) = split_occurrence_id(id)?;
            (clone_id(template_id) == id)
                .then(|| view.iter().find(|task| task.id == template_id))
                .flatten()
        })
        .cloned()
}

fn format_task(task: &TaskView) -> String {
    let mark = if task.completed { "[x]" } else { "[ ]" };
    let deadline = task
        .deadline
        .map(|date| date.to_string())
        .unwrap_or_else(|| "----------".to_string());
    let mut line = format!("{mark} {deadline}  {}  {}", task.id, task.title);
    if let Some(project) = &task.project {
        line.push_str(&format!("  @{project}"));
    }
    if task.priority != crate::template::Priority::Normal {
        line.push_str(&format!("  !{}", task.priority));
    }
    if !task.responsible.is_empty() {
        line.push_str(&format!("  ({})", task.responsible));
    }
    line
}
