use std::path::Path;

use chrono::Utc;
use colored::Colorize;

use super::with_workspace;
use crate::agent::require_agent;
use crate::error::Result;
use crate::output::{self, Format, relative};

pub fn run(
    state_dir: &Path,
    id: &str,
    agent: Option<String>,
    seconds: u64,
    format: Format,
) -> Result<()> {
    let agent_id = require_agent(agent, "extend")?;
    let record = with_workspace(state_dir, |ws| {
        ws.client().extend_reservation(id, &agent_id, seconds)
    })?;

    match format {
        Format::Pretty => {
            println!(
                "Extended {} by {}s, now expires {}",
                record.resource_path.cyan(),
                seconds,
                relative(record.expires_at, Utc::now()).green()
            );
            Ok(())
        }
        Format::Minimal => {
            println!("{}", record.expires_at.to_rfc3339());
            Ok(())
        }
        Format::Json => output::print_record(&record, format),
    }
}
