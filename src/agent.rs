use crate::error::{Result, ResvError};

/// Resolve the agent identity from the environment.
///
/// Reads `RESV_AGENT`. Returns `None` if unset or empty, letting callers
/// decide whether an explicit `--agent` is required.
pub fn resolve_agent() -> Option<String> {
    std::env::var("RESV_AGENT").ok().filter(|s| !s.is_empty())
}

/// `explicit` if given, else the environment, else an error naming `action`.
pub fn require_agent(explicit: Option<String>, action: &str) -> Result<String> {
    let agent = explicit
        .or_else(resolve_agent)
        .ok_or_else(|| ResvError::InvalidRequest(format!("{action} needs --agent or RESV_AGENT")))?;
    validate_agent_id(&agent)?;
    Ok(agent)
}

/// Agent ids are non-empty ASCII alphanumerics plus `-`, `_` and `.`.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.is_empty() {
        return Err(ResvError::InvalidRequest("agent id must be non-empty".into()));
    }
    if let Some(bad) = agent_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ResvError::InvalidRequest(format!(
            "agent id '{agent_id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}
