use std::path::Path;
use std::thread;

use colored::Colorize;
use tracing::info;

use super::with_workspace;
use crate::error::Result;
use crate::model::ReservationRecord;
use crate::output::{Format, short_id};

/// Expire lapsed leases and trim old history. Opening the workspace already
/// sweeps, so this reports what that pass found. `--watch` repeats on the
/// configured interval until interrupted.
pub fn run(state_dir: &Path, watch: bool, format: Format) -> Result<()> {
    loop {
        let (swept, interval) =
            with_workspace(state_dir, |ws| Ok((ws.swept().to_vec(), ws.config().sweep_interval())))?;

        if !watch {
            return print_swept(&swept, format);
        }
        if !swept.is_empty() {
            print_swept(&swept, format)?;
        }
        info!(expired = swept.len(), "sweep pass done");
        thread::sleep(interval);
    }
}

fn print_swept(swept: &[ReservationRecord], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(swept)?),
        Format::Pretty => {
            if swept.is_empty() {
                println!("{}", "Nothing to sweep.".dimmed());
            }
            for record in swept {
                println!(
                    "{} {} {} {}",
                    "expired".yellow(),
                    record.resource_path.cyan(),
                    record.agent_id,
                    format!("[{}]", short_id(&record.id)).dimmed()
                );
            }
        }
        Format::Minimal => {
            for record in swept {
                println!("{}", record.id);
            }
        }
    }
    Ok(())
}
