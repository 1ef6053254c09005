use std::path::Path;

use colored::Colorize;
use serde_json::json;

use super::with_workspace;
use crate::agent::require_agent;
use crate::error::{Result, ResvError};
use crate::output::{self, Format};

pub fn release(state_dir: &Path, id: &str, agent: Option<String>, format: Format) -> Result<()> {
    let agent_id = require_agent(agent, "release")?;
    with_workspace(state_dir, |ws| ws.client().release_reservation(id, &agent_id))?;

    match format {
        Format::Json => println!("{}", json!({"released": id, "agentId": agent_id})),
        Format::Pretty => println!("Released {}", id.cyan()),
        Format::Minimal => println!("{id}"),
    }
    Ok(())
}

pub fn release_all(state_dir: &Path, agent: Option<String>, format: Format) -> Result<()> {
    let agent_id = require_agent(agent, "release --all")?;
    let released = with_workspace(state_dir, |ws| ws.client().release_all(&agent_id))?;

    match format {
        Format::Json => println!("{}", serde_json::to_string(&released)?),
        Format::Pretty => {
            if released.is_empty() {
                println!("{}", format!("'{agent_id}' held no reservations.").dimmed());
            } else {
                println!(
                    "Released {} reservations held by '{}':",
                    released.len().to_string().bold(),
                    agent_id.cyan()
                );
                for record in &released {
                    println!("  {}", record.resource_path);
                }
            }
        }
        Format::Minimal => println!("{}", released.len()),
    }
    Ok(())
}

/// Coordinator override. The credential comes from `--token`.
pub fn force(
    state_dir: &Path,
    id: &str,
    token: Option<&str>,
    reason: Option<&str>,
    format: Format,
) -> Result<()> {
    let reason = reason.unwrap_or("forced by coordinator");
    let record = with_workspace(state_dir, |ws| ws.resolver().force_release(id, token, reason))?;

    match format {
        Format::Json => println!(
            "{}",
            json!({
                "released": record.id,
                "forced": true,
                "displacedAgentId": record.agent_id,
                "purpose": record.purpose,
                "path": record.resource_path,
                "reason": reason,
            })
        ),
        Format::Pretty => {
            println!(
                "Force-released {} held by '{}'",
                record.resource_path.cyan().bold(),
                record.agent_id.yellow()
            );
            println!("  {} {}", "reason:".dimmed(), reason);
        }
        Format::Minimal => println!("{}", output::short_id(&record.id)),
    }
    Ok(())
}

pub fn missing_target() -> ResvError {
    ResvError::InvalidRequest("give a reservation id, or --agent <id> --all".into())
}
