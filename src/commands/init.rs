use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::output::Format;
use crate::workspace;

pub fn run(cwd: &Path, format: Format) -> Result<()> {
    let dir = workspace::default_state_dir(cwd);
    workspace::init(&dir)?;

    match format {
        Format::Json => println!("{}", serde_json::json!({"initialized": dir.display().to_string()})),
        Format::Pretty => println!("Initialized {}", dir.display().to_string().cyan()),
        Format::Minimal => println!("{}", dir.display()),
    }
    Ok(())
}
