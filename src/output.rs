use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;

use crate::error::Result;
use crate::model::{HolderSummary, ReservationRecord, ReservationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// First 8 characters of an id, for pretty output.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// "in 4m 10s" / "5s ago" relative to `now`.
pub fn relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (ts - now).num_seconds();
    let span = humanize_secs(secs.unsigned_abs());
    if secs >= 0 {
        format!("in {span}")
    } else {
        format!("{span} ago")
    }
}

pub fn humanize_secs(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

fn colored_status(status: ReservationStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        ReservationStatus::Active => text.green(),
        ReservationStatus::Released => text.dimmed(),
        ReservationStatus::Expired => text.yellow(),
        ReservationStatus::Stale => text.yellow().bold(),
        ReservationStatus::Violated => text.red().bold(),
    }
}

pub fn print_record(record: &ReservationRecord, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(record)?),
        Format::Pretty => print_record_pretty(record, Utc::now()),
        Format::Minimal => print_record_minimal(record),
    }
    Ok(())
}

pub fn print_records(records: &[ReservationRecord], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(records)?),
        Format::Pretty => {
            if records.is_empty() {
                println!("{}", "No reservations.".dimmed());
            }
            let now = Utc::now();
            for record in records {
                print_record_pretty(record, now);
            }
        }
        Format::Minimal => {
            println!(
                "{:8} {:10} {:9} {:8} {:12} PATH",
                "ID", "STATUS", "MODE", "PURPOSE", "AGENT"
            );
            println!("{}", "-".repeat(60));
            for record in records {
                print_record_minimal(record);
            }
        }
    }
    Ok(())
}

fn print_record_pretty(record: &ReservationRecord, now: DateTime<Utc>) {
    println!(
        "{} {} {} [{}]",
        format!("[{}]", short_id(&record.id)).dimmed(),
        record.resource_path.cyan().bold(),
        format!("{} {}", record.mode, record.purpose).dimmed(),
        colored_status(record.status),
    );
    println!("  {} {}", "agent:".dimmed(), record.agent_id);
    match record.released_at {
        Some(at) => println!("  {} {}", "ended:".dimmed(), relative(at, now)),
        None => println!("  {} {}", "expires:".dimmed(), relative(record.expires_at, now)),
    }
    if let Some(ref batch) = record.batch_id {
        println!("  {} {}", "batch:".dimmed(), short_id(batch));
    }
    for (key, value) in &record.metadata {
        let value = value
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| value.to_string());
        println!("  {} {}", format!("{key}:").dimmed(), value);
    }
}

fn print_record_minimal(record: &ReservationRecord) {
    println!(
        "{:8} {:10} {:9} {:8} {:12} {}",
        short_id(&record.id),
        record.status.to_string(),
        record.mode.to_string(),
        record.purpose.to_string(),
        record.agent_id,
        record.resource_path
    );
}

/// One line per holder, indented, for pretty output.
pub fn print_holders_pretty(holders: &[HolderSummary], now: DateTime<Utc>) {
    for h in holders {
        println!(
            "  {} {} {}",
            format!("'{}'", h.agent_id).cyan(),
            format!("{} {}", h.mode, h.purpose).dimmed(),
            format!("expires {}", relative(h.expires_at, now)).dimmed(),
        );
    }
}
