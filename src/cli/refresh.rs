//! recur refresh and watch command implementations
//!
//! Both run a full reconcile pass: every template is compared with the last
//! state this process saw, and only templates that changed are regenerated or
//! cascaded. A fresh process has seen nothing, so its first pass checks every
//! template against the stored occurrences.

use std::time::Duration;

use serde::Serialize;

use crate::combined::CombinedTaskStore;
use crate::config::parse_duration;
use crate::error::Result;
use crate::events::Event;
use crate::output::{emit_success, HumanOutput};
use crate::reconcile::ReconcileReport;

use super::{CommandContext, GlobalOptions};

pub struct WatchOptions {
    pub interval: Option<String>,
    pub ticks: Option<u64>,
    pub global: GlobalOptions,
}

#[derive(Debug, Serialize, Default)]
struct WatchReport {
    passes: u64,
    /// Passes that could not run at all
    failed_passes: u64,
    written: usize,
    deleted: usize,
    /// Failed occurrence writes plus failed passes
    failures: usize,
    instance_count: usize,
}

impl WatchReport {
    /// Count one pass. A failed pass is logged and the watch goes on.
    fn record(&mut self, pass: &Result<ReconcileReport>) {
        self.passes += 1;
        match pass {
            Ok(report) => {
                self.written += report.written.len();
                self.deleted += report.deleted.len();
                self.failures += report.failures.len();
                self.instance_count = report.instance_count;
            }
            Err(err) => {
                tracing::warn!(pass = self.passes, error = %err, "refresh pass failed");
                self.failed_passes += 1;
                self.failures += 1;
            }
        }
    }
}

pub async fn run_refresh(global: GlobalOptions) -> Result<()> {
    let mut ctx = CommandContext::load(global)?;
    let store = ctx.open_engine().await?;
    let outcome = store.refresh().await;
    store.dispose().await;
    let report = outcome?;

    let event_warning = ctx.emit_events(Event::from_reconcile(&report));

    let header = if report.has_writes() {
        "recur refresh: occurrences updated"
    } else {
        "recur refresh: up to date"
    };
    let mut human = HumanOutput::new(header);
    if let Some(warning) = event_warning {
        human.push_warning(warning);
    }
    push_report(&mut human, &report);

    emit_success(ctx.output, "refresh", &report, Some(&human))
}

pub async fn run_watch(options: WatchOptions) -> Result<()> {
    let mut ctx = CommandContext::load(options.global)?;
    let period = match options.interval.as_deref() {
        Some(raw) => parse_duration(raw)?,
        None => ctx.config.refresh.interval()?,
    };

    let store = ctx.open_engine().await?;
    let outcome = watch(&mut ctx, &store, period, options.ticks).await;
    store.dispose().await;
    let summary = outcome?;

    let mut human = HumanOutput::new("recur watch: stopped");
    human.push_summary("passes", summary.passes.to_string());
    human.push_summary("written", summary.written.to_string());
    human.push_summary("deleted", summary.deleted.to_string());
    human.push_summary("instances", summary.instance_count.to_string());
    if summary.failed_passes > 0 {
        human.push_warning(format!("{} passes failed", summary.failed_passes));
    }
    if summary.failures > 0 {
        human.push_warning(format!("{} failures in total", summary.failures));
    }

    emit_success(ctx.output, "watch", &summary, Some(&human))
}

async fn watch(
    ctx: &mut CommandContext,
    store: &CombinedTaskStore,
    period: Duration,
    ticks: Option<u64>,
) -> Result<WatchReport> {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut summary = WatchReport::default();

    tracing::info!(period_secs = period.as_secs(), "watching templates");
    while ticks.map_or(true, |limit| summary.passes < limit) {
        tokio::select! {
            _ = timer.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }

        let pass = store.refresh().await;
        summary.record(&pass);
        let Ok(report) = pass else {
            continue;
        };

        if let Some(warning) = ctx.emit_events(Event::from_reconcile(&report)) {
            tracing::warn!("{warning}");
        }
        if report.has_writes() && !ctx.output.json && !ctx.output.quiet {
            println!(
                "pass {}: {} written, {} deleted, {} instances",
                summary.passes,
                report.written.len(),
                report.deleted.len(),
                report.instance_count
            );
        }
        for diagnostic in &report.diagnostics {
            tracing::warn!(template_id = %diagnostic.template_id(), "{diagnostic}");
        }
    }
    Ok(summary)
}

fn push_report(human: &mut HumanOutput, report: &ReconcileReport) {
    human.push_summary("instances", report.instance_count.to_string());
    human.push_summary("written", report.written.len().to_string());
    human.push_summary("deleted", report.deleted.len().to_string());
    human.push_summary("unchanged templates", report.unchanged.to_string());
    for id in &report.regenerated {
        human.push_detail(format!("{id} regenerated"));
    }
    for id in &report.cascaded {
        human.push_detail(format!("{id} fields cascaded"));
    }
    for id in &report.removed {
        human.push_detail(format!("{id} removed"));
    }
    for diagnostic in &report.diagnostics {
        human.push_warning(diagnostic);
    }
    for orphan in &report.orphaned {
        human.push_warning(orphan);
    }
    for failure in &report.failures {
        human.push_warning(failure);
    }
}
