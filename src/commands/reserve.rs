use std::path::Path;

use chrono::Utc;
use colored::Colorize;

use super::with_workspace;
use crate::agent::require_agent;
use crate::api::{BatchOutcome, CheckResponse, ReserveFile, ReserveFiles};
use crate::error::{Result, ResvError};
use crate::model::{Metadata, Mode, Purpose};
use crate::output::{self, Format, print_holders_pretty, relative};

/// Parse one `--meta key=value` argument.
pub fn parse_meta(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

pub fn check(state_dir: &Path, path: &str, format: Format) -> Result<()> {
    let response = with_workspace(state_dir, |ws| ws.client().check_reservation(path))?;
    print_check(&response, format)
}

fn print_check(response: &CheckResponse, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(response)?),
        Format::Pretty => {
            if response.is_available() {
                println!("{} {}", response.path.cyan().bold(), "available".green());
            } else {
                println!("{} {}", response.path.cyan().bold(), "active".yellow());
                print_holders_pretty(&response.holders, Utc::now());
            }
        }
        Format::Minimal => {
            if response.is_available() {
                println!("available");
            } else {
                let agents: Vec<&str> = response.holders.iter().map(|h| h.agent_id.as_str()).collect();
                println!("active {}", agents.join(","));
            }
        }
    }
    Ok(())
}

pub struct ReserveArgs {
    pub paths: Vec<String>,
    pub agent: Option<String>,
    pub purpose: Purpose,
    pub mode: Mode,
    pub expires_in: Option<u64>,
    pub meta: Vec<(String, String)>,
    pub best_effort: bool,
}

pub fn reserve(state_dir: &Path, args: ReserveArgs, format: Format) -> Result<()> {
    if args.paths.is_empty() {
        return Err(ResvError::InvalidRequest("no paths given".into()));
    }
    let agent_id = require_agent(args.agent, "reserve")?;
    let metadata: Metadata = args
        .meta
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    if let [path] = args.paths.as_slice() {
        let record = with_workspace(state_dir, |ws| {
            ws.client().reserve_file(ReserveFile {
                agent_id,
                path: path.clone(),
                purpose: args.purpose,
                mode: args.mode,
                expires_in: args.expires_in,
                metadata,
            })
        })?;
        return match format {
            Format::Pretty => {
                println!(
                    "Reserved {} for '{}' ({} {}, expires {})",
                    record.resource_path.green(),
                    record.agent_id.cyan().bold(),
                    record.mode,
                    record.purpose,
                    relative(record.expires_at, Utc::now()),
                );
                println!("  {} {}", "id:".dimmed(), record.id);
                Ok(())
            }
            Format::Minimal => {
                println!("{}", record.id);
                Ok(())
            }
            Format::Json => output::print_record(&record, format),
        };
    }

    let outcome = with_workspace(state_dir, |ws| {
        ws.client().reserve_files(ReserveFiles {
            agent_id,
            paths: args.paths,
            purpose: args.purpose,
            mode: args.mode,
            expires_in: args.expires_in,
            metadata,
            atomic: !args.best_effort,
        })
    })?;
    print_batch(&outcome, format)
}

fn print_batch(outcome: &BatchOutcome, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(outcome)?),
        Format::Pretty => {
            if let Some(first) = outcome.granted.first() {
                println!("Reserved by '{}':", first.agent_id.cyan().bold());
            }
            for record in &outcome.granted {
                println!(
                    "  {} {}",
                    record.resource_path.green(),
                    format!("[{}]", output::short_id(&record.id)).dimmed()
                );
            }
            let now = Utc::now();
            for conflict in &outcome.conflicts {
                println!("{} {}", "held:".red(), conflict.path.cyan());
                print_holders_pretty(&conflict.holders, now);
            }
        }
        Format::Minimal => {
            for record in &outcome.granted {
                println!("{}", record.id);
            }
        }
    }
    Ok(())
}
