use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Free-form notes attached to a reservation. Never interpreted by the store.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Exclusive,
    Shared,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum Purpose {
    #[default]
    Edit,
    Read,
    Delete,
    Create,
    Refactor,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Active,
    Released,
    Expired,
    Stale,
    Violated,
}

impl Mode {
    /// Two holders may share a path only when both are shared.
    pub fn compatible_with(self, other: Mode) -> bool {
        matches!((self, other), (Mode::Shared, Mode::Shared))
    }
}

impl Purpose {
    /// Whether the guarded operation changes the resource.
    pub fn is_write(self) -> bool {
        !matches!(self, Purpose::Read)
    }
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edit => write!(f, "edit"),
            Self::Read => write!(f, "read"),
            Self::Delete => write!(f, "delete"),
            Self::Create => write!(f, "create"),
            Self::Refactor => write!(f, "refactor"),
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Released => write!(f, "released"),
            Self::Expired => write!(f, "expired"),
            Self::Stale => write!(f, "stale"),
            Self::Violated => write!(f, "violated"),
        }
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "expired" => Ok(Self::Expired),
            "stale" => Ok(Self::Stale),
            "violated" => Ok(Self::Violated),
            other => Err(format!("unknown reservation status '{other}'")),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(Self::Exclusive),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl std::str::FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edit" => Ok(Self::Edit),
            "read" => Ok(Self::Read),
            "delete" => Ok(Self::Delete),
            "create" => Ok(Self::Create),
            "refactor" => Ok(Self::Refactor),
            other => Err(format!("unknown purpose '{other}'")),
        }
    }
}

/// A time-bounded grant on one resource path, owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRecord {
    pub id: String,
    pub resource_path: String,
    pub agent_id: String,
    pub mode: Mode,
    pub purpose: Purpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl ReservationRecord {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// The lease contract has run out, whether or not a sweep has noticed yet.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Active and not lapsed: the only state that blocks other agents.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && !self.is_lapsed(now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn held_duration(&self, now: DateTime<Utc>) -> Duration {
        self.released_at.unwrap_or(now) - self.created_at
    }

    pub fn holder_summary(&self) -> HolderSummary {
        HolderSummary {
            reservation_id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            purpose: self.purpose,
            mode: self.mode,
            expires_at: self.expires_at,
        }
    }
}

/// One pending `(path, mode, purpose)` item of a reservation set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub resource_path: String,
    pub mode: Mode,
    pub purpose: Purpose,
}

impl ReservationRequest {
    pub fn new(path: impl Into<String>, mode: Mode, purpose: Purpose) -> Self {
        Self {
            resource_path: path.into(),
            mode,
            purpose,
        }
    }
}

/// Who holds a path, as reported to a blocked caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HolderSummary {
    pub reservation_id: String,
    pub agent_id: String,
    pub purpose: Purpose,
    pub mode: Mode,
    pub expires_at: DateTime<Utc>,
}

/// A path that could not be granted and everyone blocking it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub path: String,
    pub holders: Vec<HolderSummary>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let holders = self
            .holders
            .iter()
            .map(|h| {
                format!(
                    "'{}' ({}, {}, expires {})",
                    h.agent_id,
                    h.purpose,
                    h.mode,
                    h.expires_at.to_rfc3339()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "path '{}' is held by {holders}", self.path)
    }
}

/// Result of a read-only availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Active(Vec<HolderSummary>),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    pub fn holders(&self) -> &[HolderSummary] {
        match self {
            Availability::Available => &[],
            Availability::Active(holders) => holders,
        }
    }
}

/// How a wait for a path to free up ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Available,
    /// Still held when the timeout elapsed, by these holders.
    TimedOut(Vec<HolderSummary>),
}

/// Selection criteria for listing records. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub agent_id: Option<String>,
    pub status: Option<ReservationStatus>,
    pub path_prefix: Option<String>,
}

impl ReservationFilter {
    pub fn active() -> Self {
        Self {
            status: Some(ReservationStatus::Active),
            ..Self::default()
        }
    }

    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ReservationRecord) -> bool {
        if let Some(ref agent) = self.agent_id
            && record.agent_id != *agent
        {
            return false;
        }
        if let Some(status) = self.status
            && record.status != status
        {
            return false;
        }
        if let Some(ref prefix) = self.path_prefix
            && !record.resource_path.starts_with(prefix.as_str())
        {
            return false;
        }
        true
    }
}
