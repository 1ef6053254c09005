//! Agent-facing surface over the reservation store.
//!
//! Every input is validated here before it reaches the store: agent ids,
//! resource paths (canonicalized), TTL bounds and extension amounts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::agent::validate_agent_id;
use crate::error::{Result, ResvError};
use crate::model::{
    Availability, Conflict, HolderSummary, Metadata, Mode, Purpose, ReservationFilter,
    ReservationRecord, ReservationRequest,
};
use crate::paths::canonical_resource_path;
use crate::store::reservations::ReservationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Active,
    Available,
}

/// Status query response. With exactly one holder its fields are repeated
/// at the top level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub path: String,
    pub status: CheckStatus,
    pub holders: Vec<HolderSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Purpose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckResponse {
    fn new(path: String, availability: Availability) -> Self {
        let holders = availability.holders().to_vec();
        let single = match holders.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        };
        Self {
            path,
            status: if availability.is_available() {
                CheckStatus::Available
            } else {
                CheckStatus::Active
            },
            agent_id: single.as_ref().map(|h| h.agent_id.clone()),
            purpose: single.as_ref().map(|h| h.purpose),
            mode: single.as_ref().map(|h| h.mode),
            expires_at: single.as_ref().map(|h| h.expires_at),
            holders,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == CheckStatus::Available
    }
}

/// Arguments of `reserve_file`.
#[derive(Debug, Clone, Default)]
pub struct ReserveFile {
    pub agent_id: String,
    pub path: String,
    pub purpose: Purpose,
    pub mode: Mode,
    /// Lease length in seconds; the configured default when `None`.
    pub expires_in: Option<u64>,
    pub metadata: Metadata,
}

/// Arguments of `reserve_files`. All paths share one purpose and mode.
#[derive(Debug, Clone, Default)]
pub struct ReserveFiles {
    pub agent_id: String,
    pub paths: Vec<String>,
    pub purpose: Purpose,
    pub mode: Mode,
    pub expires_in: Option<u64>,
    pub metadata: Metadata,
    /// All-or-nothing when set; otherwise each path is tried on its own.
    pub atomic: bool,
}

/// Outcome of a batch reservation. An atomic batch never has both.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub granted: Vec<ReservationRecord>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlLimits {
    pub default_secs: u64,
    pub max_secs: u64,
}

impl Default for TtlLimits {
    fn default() -> Self {
        Self {
            default_secs: 3600,
            max_secs: 86_400,
        }
    }
}

pub struct ReservationClient {
    store: Arc<ReservationStore>,
    limits: TtlLimits,
}

impl ReservationClient {
    pub fn new(store: Arc<ReservationStore>, limits: TtlLimits) -> Self {
        Self { store, limits }
    }

    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }

    pub fn check_reservation(&self, path: &str) -> Result<CheckResponse> {
        let path = canonical(path)?;
        let availability = self.store.check_availability(&path)?;
        Ok(CheckResponse::new(path, availability))
    }

    pub fn reserve_file(&self, req: ReserveFile) -> Result<ReservationRecord> {
        validate_agent_id(&req.agent_id)?;
        let path = canonical(&req.path)?;
        let ttl = self.ttl(req.expires_in)?;
        self.store
            .try_acquire(&req.agent_id, &path, req.mode, req.purpose, ttl, req.metadata)
    }

    /// Atomic batches fail with `AtomicAcquireFailed` and reserve nothing.
    /// Non-atomic batches keep what they got and report the rest.
    pub fn reserve_files(&self, req: ReserveFiles) -> Result<BatchOutcome> {
        validate_agent_id(&req.agent_id)?;
        if req.paths.is_empty() {
            return Err(ResvError::InvalidRequest("no paths requested".into()));
        }
        let ttl = self.ttl(req.expires_in)?;
        let requests = req
            .paths
            .iter()
            .map(|p| Ok(ReservationRequest::new(canonical(p)?, req.mode, req.purpose)))
            .collect::<Result<Vec<_>>>()?;

        if req.atomic {
            let granted =
                self.store
                    .try_acquire_batch(&req.agent_id, &requests, ttl, req.metadata)?;
            return Ok(BatchOutcome {
                granted,
                conflicts: Vec::new(),
            });
        }

        let mut outcome = BatchOutcome::default();
        for request in requests {
            match self.store.try_acquire(
                &req.agent_id,
                &request.resource_path,
                request.mode,
                request.purpose,
                ttl,
                req.metadata.clone(),
            ) {
                Ok(record) => outcome.granted.push(record),
                Err(ResvError::ResourceUnavailable(conflict)) => outcome.conflicts.push(conflict),
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    /// Hold `req` for the lifetime of the returned guard.
    pub fn reserve_scoped(&self, req: ReserveFile) -> Result<ReservationGuard> {
        let agent_id = req.agent_id.clone();
        let record = self.reserve_file(req)?;
        Ok(ReservationGuard::new(
            Arc::clone(&self.store),
            agent_id,
            vec![record],
        ))
    }

    /// Atomic batch held for the lifetime of the returned guard.
    pub fn reserve_files_scoped(&self, req: ReserveFiles) -> Result<ReservationGuard> {
        let agent_id = req.agent_id.clone();
        let outcome = self.reserve_files(ReserveFiles {
            atomic: true,
            ..req
        })?;
        Ok(ReservationGuard::new(
            Arc::clone(&self.store),
            agent_id,
            outcome.granted,
        ))
    }

    pub fn release_reservation(&self, reservation_id: &str, agent_id: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        self.store.release(reservation_id, agent_id)
    }

    /// Release each id in turn. Every id is attempted; the first failure is
    /// returned after the rest have been tried.
    pub fn release_files(&self, reservation_ids: &[String], agent_id: &str) -> Result<Vec<String>> {
        validate_agent_id(agent_id)?;
        let mut released = Vec::with_capacity(reservation_ids.len());
        let mut first_err = None;
        for id in reservation_ids {
            match self.store.release(id, agent_id) {
                Ok(()) => released.push(id.clone()),
                Err(err) => {
                    warn!(id = %id, code = err.code(), "release failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }

    pub fn release_all(&self, agent_id: &str) -> Result<Vec<ReservationRecord>> {
        validate_agent_id(agent_id)?;
        self.store.release_all(agent_id)
    }

    pub fn extend_reservation(
        &self,
        reservation_id: &str,
        agent_id: &str,
        additional_seconds: u64,
    ) -> Result<ReservationRecord> {
        validate_agent_id(agent_id)?;
        if additional_seconds == 0 {
            return Err(ResvError::InvalidRequest(
                "additional seconds must be positive".into(),
            ));
        }
        if additional_seconds > self.limits.max_secs {
            return Err(ResvError::InvalidRequest(format!(
                "extension of {additional_seconds}s exceeds the {}s maximum",
                self.limits.max_secs
            )));
        }
        self.store
            .extend(reservation_id, agent_id, seconds(additional_seconds)?)
    }

    /// Report that `agent_id` performed `purpose` on `path`. Fails with
    /// `Violation` (and files it) when no live reservation covered it.
    pub fn verify_access(&self, agent_id: &str, path: &str, purpose: Purpose) -> Result<()> {
        validate_agent_id(agent_id)?;
        let path = canonical(path)?;
        self.store.verify_access(agent_id, &path, purpose)
    }

    pub fn list(&self, filter: &ReservationFilter) -> Result<Vec<ReservationRecord>> {
        let mut filter = filter.clone();
        if let Some(ref agent) = filter.agent_id {
            validate_agent_id(agent)?;
        }
        // Prefixes compare against canonical paths
        if let Some(prefix) = filter.path_prefix.take() {
            let trailing = prefix.ends_with('/');
            let mut canonical = canonical(&prefix)?;
            if trailing {
                canonical.push('/');
            }
            filter.path_prefix = Some(canonical);
        }
        self.store.list(&filter)
    }

    fn ttl(&self, expires_in: Option<u64>) -> Result<Duration> {
        let secs = expires_in.unwrap_or(self.limits.default_secs);
        if secs == 0 {
            return Err(ResvError::InvalidRequest("ttl must be positive".into()));
        }
        if secs > self.limits.max_secs {
            return Err(ResvError::InvalidRequest(format!(
                "ttl of {secs}s exceeds the {}s maximum",
                self.limits.max_secs
            )));
        }
        seconds(secs)
    }
}

fn canonical(path: &str) -> Result<String> {
    canonical_resource_path(path)
        .map_err(|err| ResvError::InvalidRequest(format!("invalid path '{path}': {err}")))
}

fn seconds(secs: u64) -> Result<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| ResvError::InvalidRequest(format!("{secs}s is out of range")))
}

// ---------------------------------------------------------------------------
// Scoped cleanup
// ---------------------------------------------------------------------------

/// Releases its reservations when dropped, so work that panics or returns
/// early does not leave leases behind until they time out.
pub struct ReservationGuard {
    store: Arc<ReservationStore>,
    agent_id: String,
    records: Vec<ReservationRecord>,
}

impl ReservationGuard {
    fn new(store: Arc<ReservationStore>, agent_id: String, records: Vec<ReservationRecord>) -> Self {
        Self {
            store,
            agent_id,
            records,
        }
    }

    pub fn records(&self) -> &[ReservationRecord] {
        &self.records
    }

    /// Release now and report the first failure.
    pub fn release(mut self) -> Result<()> {
        let mut first_err = None;
        for record in std::mem::take(&mut self.records) {
            if let Err(err) = self.store.release(&record.id, &self.agent_id) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        for record in std::mem::take(&mut self.records) {
            if let Err(err) = self.store.release(&record.id, &self.agent_id) {
                warn!(id = %record.id, code = err.code(), %err, "scoped release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemoryFeed;

    fn client() -> (Arc<ManualClock>, ReservationClient) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(ReservationStore::new(clock.clone(), Arc::new(MemoryFeed::new())));
        let limits = TtlLimits {
            default_secs: 600,
            max_secs: 3600,
        };
        (clock, ReservationClient::new(store, limits))
    }

    fn file(agent: &str, path: &str) -> ReserveFile {
        ReserveFile {
            agent_id: agent.into(),
            path: path.into(),
            expires_in: Some(10),
            ..ReserveFile::default()
        }
    }

    fn files(agent: &str, paths: &[&str], atomic: bool) -> ReserveFiles {
        ReserveFiles {
            agent_id: agent.into(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            atomic,
            ..ReserveFiles::default()
        }
    }

    #[test]
    fn check_reports_single_holder_at_top_level() {
        let (clock, client) = client();
        client.reserve_file(file("A1", "/src/auth.ts")).unwrap();

        let check = client.check_reservation("/src//auth.ts").unwrap();
        assert_eq!(check.status, CheckStatus::Active);
        assert_eq!(check.agent_id.as_deref(), Some("A1"));
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["agentId"], "A1");
        assert_eq!(json["purpose"], "edit");
        assert_eq!(json["mode"], "exclusive");
        assert!(json.get("expiresAt").is_some());

        clock.advance_secs(11);
        let check = client.check_reservation("/src/auth.ts").unwrap();
        assert!(check.is_available());
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "available");
        assert!(json.get("agentId").is_none());
    }

    #[test]
    fn check_with_many_holders_omits_top_level_fields() {
        let (_clock, client) = client();
        for agent in ["A1", "A2"] {
            client
                .reserve_file(ReserveFile {
                    mode: Mode::Shared,
                    purpose: Purpose::Read,
                    ..file(agent, "x.ts")
                })
                .unwrap();
        }
        let check = client.check_reservation("x.ts").unwrap();
        assert_eq!(check.holders.len(), 2);
        assert!(check.agent_id.is_none());
    }

    #[test]
    fn validation_rejects_bad_input() {
        let (_clock, client) = client();
        let code = |r: Result<ReservationRecord>| r.unwrap_err().code();
        assert_eq!(code(client.reserve_file(file("", "a.rs"))), "invalid_request");
        assert_eq!(code(client.reserve_file(file("bad id", "a.rs"))), "invalid_request");
        assert_eq!(code(client.reserve_file(file("A1", "../up.rs"))), "invalid_request");
        assert_eq!(code(client.reserve_file(file("A1", "  "))), "invalid_request");
        assert_eq!(
            code(client.reserve_file(ReserveFile {
                expires_in: Some(0),
                ..file("A1", "a.rs")
            })),
            "invalid_request"
        );
        assert_eq!(
            code(client.reserve_file(ReserveFile {
                expires_in: Some(3601),
                ..file("A1", "a.rs")
            })),
            "invalid_request"
        );
        let rec = client.reserve_file(file("A1", "a.rs")).unwrap();
        assert_eq!(
            client.extend_reservation(&rec.id, "A1", 0).unwrap_err().code(),
            "invalid_request"
        );
    }

    #[test]
    fn default_ttl_applies_when_unset() {
        let (_clock, client) = client();
        let rec = client
            .reserve_file(ReserveFile {
                expires_in: None,
                ..file("A1", "a.rs")
            })
            .unwrap();
        assert_eq!(rec.expires_at - rec.created_at, Duration::seconds(600));
    }

    #[test]
    fn atomic_batch_reserves_nothing_on_conflict() {
        let (_clock, client) = client();
        client
            .reserve_files(files("A1", &["/a.ts", "/b.ts", "/c.ts"], true))
            .unwrap();
        let err = client
            .reserve_files(files("A2", &["/b.ts", "/d.ts"], true))
            .unwrap_err();
        assert_eq!(err.code(), "atomic_acquire_failed");
        assert!(client.check_reservation("/d.ts").unwrap().is_available());
    }

    #[test]
    fn best_effort_batch_keeps_what_it_got() {
        let (_clock, client) = client();
        client.reserve_file(file("A1", "b.ts")).unwrap();
        let outcome = client
            .reserve_files(files("A2", &["a.ts", "b.ts", "c.ts"], false))
            .unwrap();
        assert_eq!(outcome.granted.len(), 2);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].path, "b.ts");
        assert!(!client.check_reservation("c.ts").unwrap().is_available());
    }

    #[test]
    fn release_files_attempts_every_id() {
        let (_clock, client) = client();
        let a = client.reserve_file(file("A1", "a.rs")).unwrap();
        let b = client.reserve_file(file("A2", "b.rs")).unwrap();
        let c = client.reserve_file(file("A1", "c.rs")).unwrap();

        let err = client
            .release_files(&[a.id.clone(), b.id.clone(), c.id.clone()], "A1")
            .unwrap_err();
        assert_eq!(err.code(), "not_owner");
        assert!(client.check_reservation("a.rs").unwrap().is_available());
        assert!(client.check_reservation("c.rs").unwrap().is_available());
        assert!(!client.check_reservation("b.rs").unwrap().is_available());
    }

    #[test]
    fn guard_releases_on_drop() {
        let (_clock, client) = client();
        {
            let guard = client.reserve_scoped(file("A1", "a.rs")).unwrap();
            assert_eq!(guard.records().len(), 1);
            assert!(!client.check_reservation("a.rs").unwrap().is_available());
        }
        assert!(client.check_reservation("a.rs").unwrap().is_available());

        let guard = client
            .reserve_files_scoped(files("A1", &["x.rs", "y.rs"], false))
            .unwrap();
        assert_eq!(guard.records().len(), 2);
        guard.release().unwrap();
        assert!(client.check_reservation("x.rs").unwrap().is_available());
    }

    #[test]
    fn huge_ttls_are_rejected_not_overflowed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(ReservationStore::new(clock, Arc::new(MemoryFeed::new())));
        let client = ReservationClient::new(
            store,
            TtlLimits {
                default_secs: 60,
                max_secs: u64::MAX,
            },
        );
        for expires_in in [10_000_000_000_000, u64::MAX] {
            let err = client
                .reserve_file(ReserveFile {
                    expires_in: Some(expires_in),
                    ..file("A1", "a.rs")
                })
                .unwrap_err();
            assert_eq!(err.code(), "invalid_request", "expires_in={expires_in}");
        }
        assert!(client.check_reservation("a.rs").unwrap().is_available());

        let rec = client.reserve_file(file("A1", "a.rs")).unwrap();
        let err = client
            .extend_reservation(&rec.id, "A1", 10_000_000_000_000)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn verify_access_canonicalizes_path() {
        let (_clock, client) = client();
        client.reserve_file(file("A1", "src/a.rs")).unwrap();
        client.verify_access("A1", "./src//a.rs", Purpose::Edit).unwrap();
        assert_eq!(
            client
                .verify_access("A2", "src/a.rs", Purpose::Read)
                .unwrap_err()
                .code(),
            "violation"
        );
    }

    #[test]
    fn list_prefix_is_canonicalized() {
        let (_clock, client) = client();
        client.reserve_file(file("A1", "src/a.rs")).unwrap();
        client.reserve_file(file("A1", "docs/b.md")).unwrap();
        let filter = ReservationFilter {
            path_prefix: Some("./src/".into()),
            ..ReservationFilter::default()
        };
        let listed = client.list(&filter).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].resource_path, "src/a.rs");
    }
}
