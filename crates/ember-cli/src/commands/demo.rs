//! `ember demo`: a three-step dependent workflow on a chainable bus.
//!
//! A root `workflow.started` event opens the conversation, then one
//! `workflow.step` child per step is published. Each child runs
//! `validate → enrich → persist` in dependency order, alongside an
//! independent `audit` handler. With `--interrupt`, the conversation is
//! interrupted while the second step's `validate` is still running, so its
//! dependents and every later step are skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use ember_config::Config;
use ember_events::middleware::MetricsSnapshot;
use ember_events::{
    ActiveChains, BroadcastForwarder, BusStats, ChainableEventBus, Event, EventReceiver,
    EventSnapshot, EventStatus, HandlerRegistration, async_handler_fn, handler_fn,
};
use serde::Serialize;
use tracing::info;

use crate::config_bridge;

const CONVERSATION_ID: &str = "demo-conversation";
const AGENT_ID: &str = "demo-agent";
const STEPS: u32 = 3;
const STEP_DELAY: Duration = Duration::from_millis(40);
const INTERRUPT_AFTER: Duration = Duration::from_millis(20);

/// Everything the demo observed, rendered as pretty text or JSON.
#[derive(Debug, Serialize)]
struct DemoReport {
    results: Vec<StepResult>,
    history: Vec<EventSnapshot>,
    chains: ActiveChains,
    forwarded: Vec<String>,
    metrics: Option<MetricsSnapshot>,
    stats: BusStats,
}

#[derive(Debug, Serialize)]
struct StepResult {
    event_type: String,
    step: Option<u32>,
    processed: bool,
}

/// Run the demo workflow and print what happened.
pub(crate) async fn run_demo(cfg: &Config, interrupt: bool, format: &str) -> Result<()> {
    let report = run_workflow(cfg, interrupt).await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_pretty(&report),
    }
    Ok(())
}

async fn run_workflow(cfg: &Config, interrupt: bool) -> Result<DemoReport> {
    let bus = Arc::new(ChainableEventBus::new(config_bridge::build_bus(cfg)));
    register_workflow(&bus)?;

    let feed = Arc::new(BroadcastForwarder::new("demo-feed", ["workflow.*"])?);
    let mut receiver = feed.subscribe();
    bus.bus().add_forwarder(feed);

    let root = Arc::new(
        Event::new("workflow.started", "ember-cli").with_conversation(CONVERSATION_ID, AGENT_ID),
    );
    let mut results = vec![StepResult {
        event_type: root.event_type().to_owned(),
        step: None,
        processed: bus.publish(Arc::clone(&root)).await?,
    }];

    for step in 1..=STEPS {
        let child = root.create_child("workflow.step").with_field("step", step);

        let processed = if interrupt && step == 2 {
            let publisher = Arc::clone(&bus);
            let in_flight = tokio::spawn(async move { publisher.publish(child).await });
            tokio::time::sleep(INTERRUPT_AFTER).await;
            let found =
                bus.interrupt_conversation(CONVERSATION_ID, "interrupted from the command line");
            info!(conversation_id = CONVERSATION_ID, found, "Interrupted conversation");
            in_flight.await.context("step publisher task failed")??
        } else {
            bus.publish(child).await?
        };

        results.push(StepResult {
            event_type: "workflow.step".to_owned(),
            step: Some(step),
            processed,
        });
    }

    let report = DemoReport {
        results,
        history: bus.bus().history(None).iter().map(|e| e.snapshot()).collect(),
        chains: bus.get_active_chains(),
        forwarded: drain(&mut receiver),
        metrics: bus.bus().metrics().map(|m| m.snapshot()),
        stats: bus.bus().stats(),
    };
    bus.end_event_chain(root.id(), "demo finished");
    Ok(report)
}

/// `validate → enrich → persist` on steps, plus an independent `audit`.
fn register_workflow(bus: &ChainableEventBus) -> Result<()> {
    bus.subscribe(
        HandlerRegistration::new(
            "audit",
            handler_fn(|event| {
                info!(event_id = %event.id(), event_type = %event.event_type(), "Audited event");
                Ok(true)
            }),
        )
        .pattern("workflow.*"),
    )?;

    let steps = [
        ("validate", None),
        ("enrich", Some("validate")),
        ("persist", Some("enrich")),
    ];
    for (name, depends_on) in steps {
        let mut registration =
            HandlerRegistration::new(name, workflow_step(name)).pattern("workflow.step");
        if let Some(dep) = depends_on {
            registration = registration.depends_on(dep);
        }
        bus.subscribe(registration)?;
    }
    Ok(())
}

fn workflow_step(name: &'static str) -> ember_events::Handler {
    async_handler_fn(move |event| async move {
        tokio::time::sleep(STEP_DELAY).await;
        if event.is_cancellation_requested() {
            info!(
                handler = name,
                event_id = %event.id(),
                "Step saw cancellation, finishing early"
            );
            return Ok(false);
        }
        Ok(true)
    })
}

fn drain(receiver: &mut EventReceiver) -> Vec<String> {
    let mut forwarded = Vec::new();
    while let Some(event) = receiver.try_recv() {
        forwarded.push(format!("{} [{}]", event.event_type(), event.status()));
    }
    forwarded
}

fn status_label(status: EventStatus) -> colored::ColoredString {
    let text = format!("{:<10}", status.to_string());
    match status {
        EventStatus::Completed => text.green(),
        EventStatus::Failed => text.red(),
        EventStatus::Cancelled => text.yellow(),
        EventStatus::Pending | EventStatus::Processing => text.normal(),
    }
}

fn print_pretty(report: &DemoReport) {
    println!("{}", "Publish results".bold());
    for result in &report.results {
        let label = match result.step {
            Some(step) => format!("{} #{step}", result.event_type),
            None => result.event_type.clone(),
        };
        let outcome = if result.processed {
            "processed".green()
        } else {
            "not processed".yellow()
        };
        println!("  {label:<20} {outcome}");
    }

    println!("\n{}", "History (oldest first)".bold());
    for event in &report.history {
        println!(
            "  {:<18} {} by [{}]{}",
            event.event_type,
            status_label(event.status),
            event.processed_by.join(", "),
            event
                .error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
                .dimmed()
        );
    }

    println!("\n{}", "Active chains".bold());
    for chain in &report.chains.chains {
        println!(
            "  {} / {}: {} events{}",
            chain.conversation_id,
            chain.agent_id,
            chain.event_count,
            if chain.cancelled { " (cancelled)".yellow() } else { "".normal() }
        );
    }

    println!("\n{}", "Forwarded".bold());
    for line in &report.forwarded {
        println!("  {line}");
    }

    if let Some(metrics) = &report.metrics {
        println!("\n{}", "Handler metrics".bold());
        for (handler, stats) in &metrics.handlers {
            println!(
                "  {handler:<10} total {:<3} ok {:<3} failed {:<3} avg {:.1}ms",
                stats.total, stats.successes, stats.failures, stats.avg_duration_ms
            );
        }
    }

    let stats = &report.stats;
    println!(
        "\n{} published {}, completed {}, failed {}, cancelled {}",
        "Totals:".bold(),
        stats.published,
        stats.completed,
        stats.failed,
        stats.cancelled
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        let mut cfg = Config::default();
        cfg.retry.base_delay_ms = 0;
        cfg
    }

    #[tokio::test]
    async fn workflow_runs_every_step() {
        let report = run_workflow(&quiet_config(), false).await.unwrap();

        assert!(report.results.iter().all(|r| r.processed));
        assert_eq!(report.stats.completed, 4);
        assert_eq!(report.forwarded.len(), 4);

        let step = &report.history[1];
        assert_eq!(step.processed_by.len(), 4);
        let enrich = step.processed_by.iter().position(|h| h == "enrich").unwrap();
        let persist = step.processed_by.iter().position(|h| h == "persist").unwrap();
        assert!(enrich < persist);

        let metrics = report.metrics.unwrap();
        assert_eq!(metrics.handlers["persist"].successes, 3);
    }

    #[tokio::test]
    async fn interrupt_skips_remaining_steps() {
        let report = run_workflow(&quiet_config(), true).await.unwrap();

        let processed: Vec<bool> = report.results.iter().map(|r| r.processed).collect();
        // Step 2's audit handler still succeeded; step 3 never ran.
        assert_eq!(processed, vec![true, true, true, false]);

        let second = &report.history[2];
        assert!(!second.processed_by.contains(&"enrich".to_owned()));
        assert_eq!(report.history[3].status, EventStatus::Cancelled);
        assert!(report.chains.chains[0].cancelled);
    }
}
