use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::error::Result;
use crate::model::{ReservationFilter, ReservationRecord, ReservationStatus};
use crate::store::reservations::ReservationStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub active: usize,
    pub expiring_soon: usize,
    pub stale: usize,
}

/// Aggregate snapshot of live reservations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub active_count: usize,
    pub expiring_soon_count: usize,
    pub stale_count: usize,
    pub by_agent: BTreeMap<String, AgentHealth>,
}

/// Read-only classification of reservations. Remediation goes through
/// `ConflictResolver::force_release`.
pub struct AuditService {
    store: Arc<ReservationStore>,
    stale_after: Duration,
    expiring_soon: Duration,
}

impl AuditService {
    pub fn new(store: Arc<ReservationStore>, stale_after: Duration, expiring_soon: Duration) -> Self {
        Self {
            store,
            stale_after,
            expiring_soon,
        }
    }

    /// Live records older than `age_threshold`, returned with status `stale`.
    /// Staleness is judged by age alone.
    pub fn list_stale(&self, age_threshold: Duration) -> Result<Vec<ReservationRecord>> {
        let now = self.store.now();
        let stale = self
            .live_records()?
            .into_iter()
            .filter(|r| r.age(now) > age_threshold)
            .map(|mut r| {
                r.status = ReservationStatus::Stale;
                r
            })
            .collect();
        Ok(stale)
    }

    /// `list_stale` with the configured threshold.
    pub fn list_stale_default(&self) -> Result<Vec<ReservationRecord>> {
        self.list_stale(self.stale_after)
    }

    pub fn classify_health(&self) -> Result<HealthReport> {
        let now = self.store.now();
        let mut report = HealthReport::default();
        for record in self.live_records()? {
            let entry = report.by_agent.entry(record.agent_id.clone()).or_default();
            report.active_count += 1;
            entry.active += 1;
            if record.expires_at - now <= self.expiring_soon {
                report.expiring_soon_count += 1;
                entry.expiring_soon += 1;
            }
            if record.age(now) > self.stale_after {
                report.stale_count += 1;
                entry.stale += 1;
            }
        }
        Ok(report)
    }

    fn live_records(&self) -> Result<Vec<ReservationRecord>> {
        let now = self.store.now();
        Ok(self
            .store
            .list(&ReservationFilter::active())?
            .into_iter()
            .filter(|r| r.is_live(now))
            .collect())
    }
}
