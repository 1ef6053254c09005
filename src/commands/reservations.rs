use std::collections::HashSet;
use std::path::Path;

use chrono::Duration;
use colored::Colorize;
use serde_json::json;

use super::with_workspace;
use crate::agent::require_agent;
use crate::audit::HealthReport;
use crate::error::{Result, ResvError};
use crate::events::LifecycleEvent;
use crate::model::{Purpose, ReservationFilter, ReservationStatus};
use crate::output::{self, Format, humanize_secs};

pub fn list(
    state_dir: &Path,
    status: Option<ReservationStatus>,
    agent: Option<String>,
    prefix: Option<String>,
    format: Format,
) -> Result<()> {
    // Stale is age-derived: the audit service decides it, restricted to live
    // records passing the other filters.
    let stale_only = status == Some(ReservationStatus::Stale);
    let filter = ReservationFilter {
        agent_id: agent,
        status: if stale_only {
            Some(ReservationStatus::Active)
        } else {
            status
        },
        path_prefix: prefix,
    };
    let records = with_workspace(state_dir, |ws| {
        let records = ws.client().list(&filter)?;
        if !stale_only {
            return Ok(records);
        }
        let live: HashSet<String> = records.into_iter().map(|r| r.id).collect();
        let mut stale = ws.audit().list_stale_default()?;
        stale.retain(|r| live.contains(&r.id));
        Ok(stale)
    })?;
    output::print_records(&records, format)
}

pub fn audit_stale(state_dir: &Path, older_than: Option<u64>, format: Format) -> Result<()> {
    let threshold = older_than
        .map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| ResvError::InvalidRequest(format!("--older-than {secs} is out of range")))
        })
        .transpose()?;
    let stale = with_workspace(state_dir, |ws| {
        let audit = ws.audit();
        match threshold {
            Some(age) => audit.list_stale(age),
            None => audit.list_stale_default(),
        }
    })?;
    output::print_records(&stale, format)
}

pub fn audit_health(state_dir: &Path, format: Format) -> Result<()> {
    let report = with_workspace(state_dir, |ws| ws.audit().classify_health())?;
    print_health(&report, format)
}

fn print_health(report: &HealthReport, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(report)?),
        Format::Pretty => {
            println!(
                "{} active, {} expiring soon, {} stale",
                report.active_count.to_string().green().bold(),
                report.expiring_soon_count.to_string().yellow(),
                report.stale_count.to_string().red(),
            );
            for (agent, health) in &report.by_agent {
                println!(
                    "  {} {}",
                    format!("{agent}:").cyan(),
                    format!(
                        "{} active, {} expiring soon, {} stale",
                        health.active, health.expiring_soon, health.stale
                    )
                    .dimmed()
                );
            }
        }
        Format::Minimal => println!(
            "{} {} {}",
            report.active_count, report.expiring_soon_count, report.stale_count
        ),
    }
    Ok(())
}

pub fn events(state_dir: &Path, limit: Option<u32>, format: Format) -> Result<()> {
    let events = with_workspace(state_dir, |ws| ws.db().read_events(limit))?;
    print_events(&events, format)
}

fn print_events(events: &[LifecycleEvent], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(events)?),
        Format::Pretty => {
            if events.is_empty() {
                println!("{}", "No events.".dimmed());
            }
            for e in events {
                let mut line = format!(
                    "{} {} {} {}",
                    e.ts.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    e.kind.as_str().bold(),
                    e.path.cyan(),
                    e.agent_id,
                );
                if let Some(held) = e.held_secs {
                    line.push_str(&format!(" held {}", humanize_secs(held.unsigned_abs())));
                }
                if let Some(ref actor) = e.actor {
                    line.push_str(&format!(" by {actor}"));
                }
                if let Some(ref reason) = e.reason {
                    line.push_str(&format!(" ({reason})"));
                }
                println!("{line}");
            }
        }
        Format::Minimal => {
            for e in events {
                println!("{} {} {}", e.kind, e.path, e.agent_id);
            }
        }
    }
    Ok(())
}

/// Report an operation after the fact. Exits non-zero and files a violation
/// when the agent held no covering reservation.
pub fn verify(
    state_dir: &Path,
    path: &str,
    agent: Option<String>,
    purpose: Purpose,
    format: Format,
) -> Result<()> {
    let agent_id = require_agent(agent, "verify")?;
    with_workspace(state_dir, |ws| ws.client().verify_access(&agent_id, path, purpose))?;

    match format {
        Format::Json => println!(
            "{}",
            json!({"path": path, "agentId": agent_id, "purpose": purpose, "covered": true})
        ),
        Format::Pretty => println!(
            "{} {} by '{}' is covered",
            purpose,
            path.cyan(),
            agent_id.green()
        ),
        Format::Minimal => println!("ok"),
    }
    Ok(())
}
