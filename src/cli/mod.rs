//! Command-line interface for recur
//!
//! This module defines the CLI structure using clap derive macros.
//! Each command group is implemented in its own submodule.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::combined::CombinedTaskStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventDestination, EventSink};
use crate::output::OutputOptions;
use crate::reconcile::Reconciler;
use crate::repository::JsonTemplateRepository;
use crate::storage::Storage;
use crate::store::FileOccurrenceStore;

mod init;
mod refresh;
mod task;
mod template;

/// recur - recurring task instances
///
/// Expands recurring task templates into dated occurrences, keeps them in
/// sync when templates change, and remembers per-occurrence edits.
#[derive(Parser, Debug)]
#[command(name = "recur")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding the `.recur/` data directory (defaults to current directory)
    #[arg(long, global = true, env = "RECUR_DIR")]
    pub dir: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit change events as JSONL (`-` for stdout, or a file path)
    #[arg(long, global = true)]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory and a default config
    Init,

    /// Template management
    #[command(subcommand)]
    Template(TemplateCommands),

    /// Reconcile every template with its stored occurrences
    Refresh,

    /// List the combined task view
    List {
        /// Only tasks of this template
        #[arg(long)]
        template: Option<String>,

        /// Hide completed tasks
        #[arg(long)]
        open: bool,
    },

    /// Edit one field of a task (template id or occurrence id)
    Set {
        /// Template id, or occurrence id like `ID#2024-01-15`
        id: String,

        /// title, project, deadline, responsible, priority, notes, link, completed
        field: String,

        /// New value
        value: String,
    },

    /// Clear a field; on an occurrence this drops its override
    Unset {
        id: String,

        field: String,
    },

    /// Reconcile periodically until interrupted
    Watch {
        /// Time between passes (e.g. "30s", "5m"); defaults to refresh.interval
        #[arg(long)]
        interval: Option<String>,

        /// Stop after this many passes
        #[arg(long)]
        ticks: Option<u64>,
    },
}

/// Fields shared by `template add` and `template edit`
#[derive(clap::Args, Debug, Default)]
pub struct TemplateFields {
    /// Project name
    #[arg(long)]
    pub project: Option<String>,

    /// Deadline, and the first occurrence of a recurring template (YYYY-MM-DD)
    #[arg(long)]
    pub deadline: Option<String>,

    /// Responsible people (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub responsible: Option<Vec<String>>,

    /// Repeat every N months
    #[arg(long, value_name = "MONTHS")]
    pub every: Option<u32>,

    /// Last date to generate occurrences for (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    pub until: Option<String>,

    /// Priority: normal, urgent
    #[arg(long)]
    pub priority: Option<String>,

    #[arg(long)]
    pub notes: Option<String>,

    #[arg(long)]
    pub link: Option<String>,
}

/// Template subcommands
#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// Add a template and generate its occurrences
    Add {
        /// Task title
        title: String,

        #[command(flatten)]
        fields: TemplateFields,
    },

    /// List stored templates
    List,

    /// Change a template; occurrences follow
    Edit {
        /// Template id
        id: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        fields: TemplateFields,

        /// Stop repeating
        #[arg(long, conflicts_with = "every")]
        once: bool,

        /// Mark the template completed (true/false)
        #[arg(long)]
        completed: Option<bool>,

        /// Clear a field: project, deadline, responsible, until, notes, link
        #[arg(long, value_name = "FIELD")]
        clear: Vec<String>,
    },

    /// Delete a template and all of its occurrences
    Rm {
        /// Template id
        id: String,
    },
}

impl Commands {
    /// Command name as reported in output envelopes
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Init => "init",
            Commands::Template(TemplateCommands::Add { .. }) => "template add",
            Commands::Template(TemplateCommands::List) => "template list",
            Commands::Template(TemplateCommands::Edit { .. }) => "template edit",
            Commands::Template(TemplateCommands::Rm { .. }) => "template rm",
            Commands::Refresh => "refresh",
            Commands::List { .. } => "list",
            Commands::Set { .. } => "set",
            Commands::Unset { .. } => "unset",
            Commands::Watch { .. } => "watch",
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.dispatch())
    }

    async fn dispatch(self) -> Result<()> {
        let global = GlobalOptions {
            dir: self.dir,
            json: self.json,
            quiet: self.quiet,
            events: self.events,
        };
        match self.command {
            Commands::Init => init::run(global),
            Commands::Template(cmd) => match cmd {
                TemplateCommands::Add { title, fields } => {
                    template::run_add(template::AddOptions { title, fields, global }).await
                }
                TemplateCommands::List => template::run_list(global).await,
                TemplateCommands::Edit {
                    id,
                    title,
                    fields,
                    once,
                    completed,
                    clear,
                } => {
                    template::run_edit(template::EditOptions {
                        id,
                        title,
                        fields,
                        once,
                        completed,
                        clear,
                        global,
                    })
                    .await
                }
                TemplateCommands::Rm { id } => template::run_rm(id, global).await,
            },
            Commands::Refresh => refresh::run_refresh(global).await,
            Commands::List { template, open } => {
                task::run_list(task::ListOptions {
                    template,
                    open,
                    global,
                })
                .await
            }
            Commands::Set { id, field, value } => {
                task::run_set(task::SetOptions {
                    id,
                    field,
                    value: Some(value),
                    global,
                })
                .await
            }
            Commands::Unset { id, field } => {
                task::run_set(task::SetOptions {
                    id,
                    field,
                    value: None,
                    global,
                })
                .await
            }
            Commands::Watch { interval, ticks } => {
                refresh::run_watch(refresh::WatchOptions {
                    interval,
                    ticks,
                    global,
                })
                .await
            }
        }
    }
}

/// Flags every command accepts
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub dir: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
    pub events: Option<String>,
}

/// Resolved state shared by the commands that touch the data directory
struct CommandContext {
    storage: Storage,
    config: Config,
    output: OutputOptions,
    events: Option<EventSink>,
}

impl CommandContext {
    /// Resolve the data directory and load its config.
    ///
    /// Fails when `recur init` has not been run there.
    fn load(global: GlobalOptions) -> Result<Self> {
        let storage = resolve_storage(global.dir)?;
        if !storage.is_initialized() {
            return Err(Error::Store(format!(
                "no data directory at {}",
                storage.root().display()
            )));
        }
        let config = storage.load_config()?;

        let destination = EventDestination::parse(global.events.as_deref());
        let events = destination.as_ref().map(|dest| dest.open()).transpose()?;
        let events_to_stdout = matches!(destination, Some(EventDestination::Stdout));

        Ok(Self {
            storage,
            config,
            output: OutputOptions {
                json: global.json && !events_to_stdout,
                quiet: global.quiet || events_to_stdout,
            },
            events,
        })
    }

    fn repository(&self) -> JsonTemplateRepository {
        JsonTemplateRepository::new(
            self.storage.templates_file(),
            self.config.storage.lock_timeout_ms,
        )
    }

    /// Wire the file-backed repository and occurrence store into a task store
    async fn open_engine(&self) -> Result<CombinedTaskStore> {
        let occurrences = FileOccurrenceStore::open(
            self.storage.occurrences_file(),
            self.config.storage.lock_timeout_ms,
        )
        .await?;
        let reconciler = Reconciler::new(Arc::new(occurrences), self.config.engine.clone());
        CombinedTaskStore::create(Arc::new(self.repository()), Arc::new(reconciler))
    }

    /// Write events when a sink is configured.
    ///
    /// Returns a warning instead of failing the command.
    fn emit_events(&mut self, events: Result<Vec<Event>>) -> Option<String> {
        let sink = self.events.as_mut()?;
        let result = events.and_then(|events| sink.emit_all(&events));
        match result {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(error = %err, "failed to emit events");
                Some(format!("failed to emit events: {err}"))
            }
        }
    }
}

fn resolve_storage(dir: Option<PathBuf>) -> Result<Storage> {
    let base = match dir {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    Ok(Storage::in_dir(&base))
}
