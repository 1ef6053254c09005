use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{Result, ResvError};
use crate::model::{Conflict, Mode, Purpose, ReservationRecord, WaitOutcome};
use crate::store::reservations::ReservationStore;

/// Actor name recorded on coordinator overrides.
pub const COORDINATOR: &str = "coordinator";

/// One blocking holder, flattened for a caller deciding what to do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderDescription {
    pub reservation_id: String,
    pub holder_agent_id: String,
    pub holder_purpose: Purpose,
    pub holder_mode: Mode,
    pub expires_at: DateTime<Utc>,
}

/// Actionable view of a conflict: who blocks the path and how long until
/// every current lease would run out on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDescription {
    pub path: String,
    pub holders: Vec<HolderDescription>,
    /// Seconds until the last blocking lease expires. Zero when already due.
    pub wait_estimate_secs: i64,
}

impl ConflictDescription {
    /// The holder whose lease runs longest, i.e. the one that decides the wait.
    pub fn primary(&self) -> Option<&HolderDescription> {
        self.holders.iter().max_by_key(|h| h.expires_at)
    }
}

/// Pure transformation from a store conflict to a description.
pub fn describe_conflict(conflict: &Conflict, now: DateTime<Utc>) -> ConflictDescription {
    let holders: Vec<HolderDescription> = conflict
        .holders
        .iter()
        .map(|h| HolderDescription {
            reservation_id: h.reservation_id.clone(),
            holder_agent_id: h.agent_id.clone(),
            holder_purpose: h.purpose,
            holder_mode: h.mode,
            expires_at: h.expires_at,
        })
        .collect();
    let wait_estimate_secs = holders
        .iter()
        .map(|h| (h.expires_at - now).num_seconds())
        .max()
        .unwrap_or(0)
        .max(0);
    ConflictDescription {
        path: conflict.path.clone(),
        holders,
        wait_estimate_secs,
    }
}

/// Resolution primitives for a failed acquisition. Picks no strategy itself.
pub struct ConflictResolver {
    store: Arc<ReservationStore>,
    coordinator_token: Option<String>,
}

impl ConflictResolver {
    /// With `coordinator_token` unset, every forced release is refused.
    pub fn new(store: Arc<ReservationStore>, coordinator_token: Option<String>) -> Self {
        Self {
            store,
            coordinator_token: coordinator_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn describe(&self, conflict: &Conflict) -> ConflictDescription {
        describe_conflict(conflict, self.store.now())
    }

    pub fn describe_error(&self, err: &ResvError) -> Vec<ConflictDescription> {
        err.conflicts().iter().map(|c| self.describe(c)).collect()
    }

    /// Block until `path` is free, `timeout` passes or `cancel` fires.
    pub fn wait_for_release(
        &self,
        path: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<WaitOutcome> {
        self.store.wait_for_release(path, timeout, cancel)
    }

    pub fn is_authorized(&self, token: Option<&str>) -> bool {
        matches!(
            (self.coordinator_token.as_deref(), token),
            (Some(expected), Some(given)) if expected == given
        )
    }

    /// Coordinator override: release `id` whatever its owner. The displaced
    /// agent, purpose and reason land in the audit trail.
    pub fn force_release(
        &self,
        id: &str,
        token: Option<&str>,
        reason: &str,
    ) -> Result<ReservationRecord> {
        if !self.is_authorized(token) {
            warn!(id, "force release refused: bad coordinator credential");
            return Err(ResvError::Unauthorized);
        }
        let reason = if reason.trim().is_empty() {
            "no reason given"
        } else {
            reason
        };
        self.store.force_release(id, COORDINATOR, reason)
    }
}
