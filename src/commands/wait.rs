use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use colored::Colorize;
use serde_json::json;

use super::with_workspace;
use crate::error::{Result, ResvError};
use crate::model::HolderSummary;
use crate::output::Format;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Block until nobody holds `path`, giving up after `timeout_secs` or the
/// configured `wait_timeout_secs`. Each poll is a full open/commit cycle so
/// other processes can take the lock in between.
pub fn run(state_dir: &Path, path: &str, timeout_secs: Option<u64>, format: Format) -> Result<()> {
    let started = Instant::now();

    loop {
        let (response, default_timeout) = with_workspace(state_dir, |ws| {
            Ok((ws.client().check_reservation(path)?, ws.config().wait_timeout()))
        })?;

        if response.is_available() {
            print_ready(&response.path, started.elapsed(), format);
            return Ok(());
        }

        let timeout = timeout_secs.map_or(default_timeout, Duration::from_secs);
        if started.elapsed() >= timeout {
            return Err(ResvError::WaitTimeout(format_timeout(
                &response.path,
                started.elapsed(),
                &response.holders,
            )));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn print_ready(path: &str, waited: Duration, format: Format) {
    let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
    match format {
        Format::Json => println!(
            "{}",
            json!({
                "path": path,
                "status": "available",
                "waitedMs": waited_ms
            })
        ),
        Format::Pretty => println!(
            "{} {} {}",
            "Available:".green().bold(),
            path.cyan(),
            format!("(waited {waited_ms}ms)").dimmed()
        ),
        Format::Minimal => println!("{path}"),
    }
}

fn format_timeout(path: &str, waited: Duration, holders: &[HolderSummary]) -> String {
    let waited_ms = waited.as_millis();
    let now = Utc::now();
    match holders {
        [] => format!("'{path}' is still reserved after {waited_ms}ms"),
        [holder] => format!(
            "'{path}' is still reserved by '{}' for {} (expires in {}s) after {waited_ms}ms",
            holder.agent_id,
            holder.purpose,
            (holder.expires_at - now).num_seconds().max(0)
        ),
        _ => {
            let agents = holders
                .iter()
                .map(|h| h.agent_id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            format!("'{path}' is still reserved by [{agents}] after {waited_ms}ms")
        }
    }
}
