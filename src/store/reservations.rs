use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::{Result, ResvError};
use crate::events::{EventKind, EventSink, LifecycleEvent};
use crate::model::{
    Availability, Conflict, HolderSummary, Metadata, Mode, Purpose, ReservationFilter,
    ReservationRecord, ReservationRequest, ReservationStatus, WaitOutcome,
};

/// Upper bound on a single condition-variable wait, so lease lapse and
/// cancellation are noticed even when nobody notifies.
const WAIT_SLICE: std::time::Duration = std::time::Duration::from_millis(25);

// ---------------------------------------------------------------------------
// Lock table
// ---------------------------------------------------------------------------

/// Per-path state: the active records on the path and a condition variable
/// signalled whenever one of them leaves `Active`.
#[derive(Debug, Default)]
struct PathSlot {
    holders: Mutex<Vec<ReservationRecord>>,
    changed: Condvar,
}

enum Acquired {
    Granted(Vec<ReservationRecord>),
    Blocked(Conflict),
}

enum ExtendOutcome {
    Extended(ReservationRecord),
    Lapsed(ReservationRecord),
}

enum Access {
    Permitted,
    Retired(ReservationRecord),
    Unreserved,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| {
        error!(lock = what, "reservation store lock poisoned");
        ResvError::StoreCorrupt(format!("{what} lock poisoned by a panicked writer"))
    })
}

/// Drop path guards last-acquired first.
fn release_in_reverse<G>(mut guards: Vec<G>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

/// Remove lapsed records from a holder list, marking them expired.
fn take_lapsed(holders: &mut Vec<ReservationRecord>, now: DateTime<Utc>) -> Vec<ReservationRecord> {
    let (lapsed, kept): (Vec<_>, Vec<_>) = std::mem::take(holders)
        .into_iter()
        .partition(|h| h.is_lapsed(now));
    *holders = kept;
    lapsed
        .into_iter()
        .map(|mut r| {
            r.status = ReservationStatus::Expired;
            r.released_at = Some(now);
            r
        })
        .collect()
}

/// An exclusive holder is alone, and every record filed under `path` is active and for `path`.
fn check_path_invariants(path: &str, holders: &[ReservationRecord]) -> Result<()> {
    let exclusive = holders
        .iter()
        .filter(|h| h.mode == Mode::Exclusive)
        .count();
    if exclusive > 1 || (exclusive == 1 && holders.len() > 1) {
        error!(
            path,
            exclusive,
            holders = holders.len(),
            "mutual exclusion invariant broken"
        );
        return Err(ResvError::StoreCorrupt(format!(
            "path '{path}' has {exclusive} exclusive holder(s) among {} active record(s)",
            holders.len()
        )));
    }
    if let Some(bad) = holders.iter().find(|h| h.resource_path != path || !h.is_active()) {
        error!(path, id = %bad.id, "record filed under the wrong path or state");
        return Err(ResvError::StoreCorrupt(format!(
            "record {} ({}, {}) is filed as active under '{path}'",
            bad.id, bad.resource_path, bad.status
        )));
    }
    Ok(())
}

fn blockers<'r>(
    mode: Mode,
    others: impl Iterator<Item = &'r ReservationRecord>,
) -> Vec<HolderSummary> {
    others
        .filter(|h| !mode.compatible_with(h.mode))
        .map(ReservationRecord::holder_summary)
        .collect()
}

// ---------------------------------------------------------------------------
// ReservationStore
// ---------------------------------------------------------------------------

/// Authoritative table of reservations keyed by canonical resource path.
///
/// Every mutation goes through this type. Lock order is: lock table (brief),
/// path slots in sorted path order, id index, history. No lock is ever held
/// while waiting for another agent.
pub struct ReservationStore {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    slots: Mutex<HashMap<String, Arc<PathSlot>>>,
    /// Active reservation id -> path.
    index: Mutex<HashMap<String, String>>,
    /// Terminal records kept for audit until garbage-collected.
    history: Mutex<HashMap<String, ReservationRecord>>,
}

impl ReservationStore {
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            clock,
            sink,
            slots: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -- checks -------------------------------------------------------------

    /// Read-only, non-blocking view of who holds `path` right now.
    pub fn check_availability(&self, path: &str) -> Result<Availability> {
        let slot = lock(&self.slots, "lock table")?.get(path).cloned();
        let Some(slot) = slot else {
            return Ok(Availability::Available);
        };
        let now = self.clock.now();
        let holders: Vec<HolderSummary> = lock(&slot.holders, "path")?
            .iter()
            .filter(|h| h.is_live(now))
            .map(ReservationRecord::holder_summary)
            .collect();
        if holders.is_empty() {
            Ok(Availability::Available)
        } else {
            Ok(Availability::Active(holders))
        }
    }

    // -- acquisition --------------------------------------------------------

    /// Acquire one path. Fails fast with `ResourceUnavailable` carrying every
    /// blocking holder; never waits.
    pub fn try_acquire(
        &self,
        agent_id: &str,
        path: &str,
        mode: Mode,
        purpose: Purpose,
        ttl: Duration,
        metadata: Metadata,
    ) -> Result<ReservationRecord> {
        let request = ReservationRequest::new(path, mode, purpose);
        Self::validate_acquire(agent_id, std::slice::from_ref(&request), ttl)?;
        match self.acquire(agent_id, &[request], ttl, &metadata, None)? {
            Acquired::Granted(mut records) => records
                .pop()
                .ok_or_else(|| ResvError::StoreCorrupt("acquire granted no record".into())),
            Acquired::Blocked(conflict) => Err(ResvError::ResourceUnavailable(conflict)),
        }
    }

    /// Acquire every request or none. Records share a fresh batch id.
    pub fn try_acquire_batch(
        &self,
        agent_id: &str,
        requests: &[ReservationRequest],
        ttl: Duration,
        metadata: Metadata,
    ) -> Result<Vec<ReservationRecord>> {
        Self::validate_acquire(agent_id, requests, ttl)?;
        let batch_id = Uuid::new_v4().to_string();
        match self.acquire(agent_id, requests, ttl, &metadata, Some(batch_id))? {
            Acquired::Granted(records) => Ok(records),
            Acquired::Blocked(conflict) => Err(ResvError::AtomicAcquireFailed(vec![conflict])),
        }
    }

    fn validate_acquire(agent_id: &str, requests: &[ReservationRequest], ttl: Duration) -> Result<()> {
        if agent_id.trim().is_empty() {
            return Err(ResvError::InvalidRequest("agent id must be non-empty".into()));
        }
        if requests.is_empty() {
            return Err(ResvError::InvalidRequest("no paths requested".into()));
        }
        if requests.iter().any(|r| r.resource_path.is_empty()) {
            return Err(ResvError::InvalidRequest("resource path must be non-empty".into()));
        }
        if ttl <= Duration::zero() {
            return Err(ResvError::InvalidRequest("ttl must be positive".into()));
        }
        Ok(())
    }

    /// Lock the requested paths in sorted order, validate each against live
    /// holders plus earlier items of the same request, then commit all records
    /// or none.
    fn acquire(
        &self,
        agent_id: &str,
        requests: &[ReservationRequest],
        ttl: Duration,
        metadata: &Metadata,
        batch_id: Option<String>,
    ) -> Result<Acquired> {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| ResvError::InvalidRequest(format!("ttl of {ttl} is out of range")))?;

        let mut by_path: BTreeMap<&str, Vec<&ReservationRequest>> = BTreeMap::new();
        for request in requests {
            by_path
                .entry(request.resource_path.as_str())
                .or_default()
                .push(request);
        }
        let paths: Vec<String> = by_path.keys().map(|p| p.to_string()).collect();
        let slots = paths
            .iter()
            .map(|p| self.slot(p))
            .collect::<Result<Vec<_>>>()?;

        let mut guards = Vec::with_capacity(slots.len());
        let mut pending: Vec<Vec<ReservationRecord>> = Vec::with_capacity(slots.len());
        let mut blocked = None;

        for ((path, slot), items) in paths.iter().zip(&slots).zip(by_path.values()) {
            let holders = lock(&slot.holders, "path")?;
            let mut granted_here: Vec<ReservationRecord> = Vec::new();
            for request in items {
                let live = holders.iter().filter(|h| h.is_live(now));
                let blocking = blockers(request.mode, live.chain(granted_here.iter()));
                if !blocking.is_empty() {
                    blocked = Some(Conflict {
                        path: path.clone(),
                        holders: blocking,
                    });
                    break;
                }
                granted_here.push(ReservationRecord {
                    id: Uuid::new_v4().to_string(),
                    resource_path: path.clone(),
                    agent_id: agent_id.to_string(),
                    mode: request.mode,
                    purpose: request.purpose,
                    created_at: now,
                    expires_at,
                    status: ReservationStatus::Active,
                    metadata: metadata.clone(),
                    batch_id: batch_id.clone(),
                    released_at: None,
                });
            }
            guards.push(holders);
            pending.push(granted_here);
            if blocked.is_some() {
                break;
            }
        }

        if let Some(conflict) = blocked {
            release_in_reverse(guards);
            drop(slots);
            self.reclaim(&paths)?;
            info!(
                agent = agent_id,
                path = %conflict.path,
                holders = conflict.holders.len(),
                "reservation conflict"
            );
            return Ok(Acquired::Blocked(conflict));
        }

        // Commit: expire lapsed holders on the touched paths, then publish the
        // new records while every path lock is still held.
        let mut expired = Vec::new();
        let mut granted = Vec::new();
        for ((path, holders), new_records) in paths.iter().zip(guards.iter_mut()).zip(pending) {
            expired.extend(take_lapsed(holders, now));
            holders.extend(new_records.iter().cloned());
            check_path_invariants(path, holders)?;
            granted.extend(new_records);
        }
        {
            let mut index = lock(&self.index, "index")?;
            for record in &expired {
                index.remove(&record.id);
            }
            for record in &granted {
                if index
                    .insert(record.id.clone(), record.resource_path.clone())
                    .is_some()
                {
                    error!(id = %record.id, "duplicate reservation id");
                    return Err(ResvError::StoreCorrupt(format!(
                        "duplicate reservation id {}",
                        record.id
                    )));
                }
            }
        }
        self.archive(&expired)?;
        release_in_reverse(guards);

        for record in &expired {
            self.emit(LifecycleEvent::for_record(EventKind::Expired, record, now).with_actor("store"));
        }
        for record in &granted {
            info!(
                id = %record.id,
                path = %record.resource_path,
                agent = %record.agent_id,
                mode = %record.mode,
                purpose = %record.purpose,
                "reservation acquired"
            );
            self.emit(LifecycleEvent::for_record(EventKind::Acquired, record, now));
        }
        Ok(Acquired::Granted(granted))
    }

    // -- release / extend ---------------------------------------------------

    /// Release a reservation held by `requesting_agent`. Releasing a record
    /// that already left `Active` is `Ok`, including one whose history has
    /// been garbage-collected. Only ids that were never reservation ids are
    /// `NotFound`.
    pub fn release(&self, id: &str, requesting_agent: &str) -> Result<()> {
        let outcome = self.with_active(id, |holders, pos, now| {
            let owner = &holders[pos].agent_id;
            if owner != requesting_agent {
                return Err(ResvError::NotOwner {
                    id: id.to_string(),
                    owner: owner.clone(),
                    requester: requesting_agent.to_string(),
                });
            }
            let status = if holders[pos].is_lapsed(now) {
                ReservationStatus::Expired
            } else {
                ReservationStatus::Released
            };
            Ok((self.retire(holders, pos, status, now)?, now))
        })?;

        match outcome {
            Some((record, now)) => {
                let kind = if record.status == ReservationStatus::Expired {
                    EventKind::Expired
                } else {
                    EventKind::Released
                };
                info!(id, path = %record.resource_path, agent = requesting_agent, "reservation released");
                self.emit(LifecycleEvent::for_record(kind, &record, now));
                Ok(())
            }
            None => match self.history_get(id)? {
                Some(record) if record.agent_id != requesting_agent => Err(ResvError::NotOwner {
                    id: id.to_string(),
                    owner: record.agent_id,
                    requester: requesting_agent.to_string(),
                }),
                Some(_) => Ok(()),
                None if Uuid::parse_str(id).is_ok() => Ok(()),
                None => Err(ResvError::NotFound(id.to_string())),
            },
        }
    }

    /// Release every active reservation of one agent.
    pub fn release_all(&self, agent_id: &str) -> Result<Vec<ReservationRecord>> {
        let held = self.list(&ReservationFilter {
            agent_id: Some(agent_id.to_string()),
            status: Some(ReservationStatus::Active),
            path_prefix: None,
        })?;
        let mut released = Vec::with_capacity(held.len());
        for record in held {
            match self.release(&record.id, agent_id) {
                Ok(()) | Err(ResvError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            if let Some(done) = self.get(&record.id)? {
                released.push(done);
            }
        }
        Ok(released)
    }

    /// Push `expiresAt` forward. Only the owner may extend, and only while the
    /// lease has not lapsed.
    pub fn extend(
        &self,
        id: &str,
        requesting_agent: &str,
        additional: Duration,
    ) -> Result<ReservationRecord> {
        if additional <= Duration::zero() {
            return Err(ResvError::InvalidRequest(
                "extension must be a positive number of seconds".into(),
            ));
        }
        let outcome = self.with_active(id, |holders, pos, now| {
            let owner = &holders[pos].agent_id;
            if owner != requesting_agent {
                return Err(ResvError::NotOwner {
                    id: id.to_string(),
                    owner: owner.clone(),
                    requester: requesting_agent.to_string(),
                });
            }
            if holders[pos].is_lapsed(now) {
                let expired = self.retire(holders, pos, ReservationStatus::Expired, now)?;
                return Ok((ExtendOutcome::Lapsed(expired), now));
            }
            holders[pos].expires_at = holders[pos]
                .expires_at
                .checked_add_signed(additional)
                .ok_or_else(|| {
                    ResvError::InvalidRequest(format!("extension of {additional} is out of range"))
                })?;
            Ok((ExtendOutcome::Extended(holders[pos].clone()), now))
        })?;

        match outcome {
            Some((ExtendOutcome::Extended(record), now)) => {
                info!(id, expires_at = %record.expires_at, "reservation extended");
                self.emit(LifecycleEvent::for_record(EventKind::Extended, &record, now));
                Ok(record)
            }
            Some((ExtendOutcome::Lapsed(record), now)) => {
                self.emit(LifecycleEvent::for_record(EventKind::Expired, &record, now).with_actor("store"));
                Err(ResvError::NotFound(id.to_string()))
            }
            None => match self.history_get(id)? {
                Some(record) if record.agent_id != requesting_agent => Err(ResvError::NotOwner {
                    id: id.to_string(),
                    owner: record.agent_id,
                    requester: requesting_agent.to_string(),
                }),
                _ => Err(ResvError::NotFound(id.to_string())),
            },
        }
    }

    /// Release a reservation regardless of owner. Authorization is the
    /// caller's job; this only records who did it and why.
    pub fn force_release(&self, id: &str, actor: &str, reason: &str) -> Result<ReservationRecord> {
        let outcome = self.with_active(id, |holders, pos, now| {
            Ok((self.retire(holders, pos, ReservationStatus::Released, now)?, now))
        })?;
        match outcome {
            Some((record, now)) => {
                warn!(
                    id,
                    path = %record.resource_path,
                    displaced_agent = %record.agent_id,
                    purpose = %record.purpose,
                    actor,
                    reason,
                    "reservation force-released"
                );
                self.emit(
                    LifecycleEvent::for_record(EventKind::ForceReleased, &record, now)
                        .with_actor(actor)
                        .with_reason(reason),
                );
                Ok(record)
            }
            None => self
                .history_get(id)?
                .ok_or_else(|| ResvError::NotFound(id.to_string())),
        }
    }

    // -- expiry / history ---------------------------------------------------

    /// Transition every lapsed `Active` record to `Expired`.
    pub fn expire_lapsed(&self) -> Result<Vec<ReservationRecord>> {
        let now = self.clock.now();
        let snapshot = self.slot_snapshot()?;
        let mut expired = Vec::new();
        for (_, slot) in &snapshot {
            let lapsed = {
                let mut holders = lock(&slot.holders, "path")?;
                let lapsed = take_lapsed(&mut holders, now);
                if !lapsed.is_empty() {
                    let mut index = lock(&self.index, "index")?;
                    for record in &lapsed {
                        index.remove(&record.id);
                    }
                }
                lapsed
            };
            if !lapsed.is_empty() {
                self.archive(&lapsed)?;
                slot.changed.notify_all();
                expired.extend(lapsed);
            }
        }
        let paths: Vec<String> = snapshot.into_iter().map(|(p, _)| p).collect();
        self.reclaim(&paths)?;

        for record in &expired {
            info!(
                id = %record.id,
                path = %record.resource_path,
                agent = %record.agent_id,
                "reservation expired"
            );
            self.emit(LifecycleEvent::for_record(EventKind::Expired, record, now).with_actor("sweeper"));
        }
        Ok(expired)
    }

    /// Drop terminal records that left `Active` more than `retention` ago.
    pub fn gc_history(&self, retention: Duration) -> Result<usize> {
        // A retention reaching past the earliest representable time keeps everything
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut history = lock(&self.history, "history")?;
        let before = history.len();
        history.retain(|_, r| r.released_at.unwrap_or(r.expires_at) >= cutoff);
        Ok(before - history.len())
    }

    // -- violations ---------------------------------------------------------

    /// Report that `agent_id` performed `purpose` on `path`. Passes when the
    /// agent holds a live reservation whose mode covers the operation;
    /// otherwise the inadequate record (if any) becomes `Violated` and a
    /// violation event is filed for reconciliation.
    pub fn verify_access(&self, agent_id: &str, path: &str, purpose: Purpose) -> Result<()> {
        let slot = self.slot(path)?;
        let now = self.clock.now();
        let access = {
            let mut holders = lock(&slot.holders, "path")?;
            let covered = holders.iter().any(|h| {
                h.agent_id == agent_id
                    && h.is_live(now)
                    && (!purpose.is_write() || h.mode == Mode::Exclusive)
            });
            if covered {
                Access::Permitted
            } else if let Some(pos) = holders
                .iter()
                .position(|h| h.agent_id == agent_id && h.is_live(now))
            {
                Access::Retired(self.retire(&mut holders, pos, ReservationStatus::Violated, now)?)
            } else {
                Access::Unreserved
            }
        };
        if matches!(access, Access::Retired(_)) {
            slot.changed.notify_all();
        }
        drop(slot);
        self.reclaim(&[path.to_string()])?;

        let event = match access {
            Access::Permitted => return Ok(()),
            Access::Retired(record) => {
                LifecycleEvent::for_record(EventKind::Violated, &record, now)
            }
            Access::Unreserved => LifecycleEvent {
                ts: now,
                kind: EventKind::Violated,
                reservation_id: None,
                path: path.to_string(),
                agent_id: agent_id.to_string(),
                purpose: Some(purpose),
                held_secs: None,
                actor: None,
                reason: None,
            },
        };
        warn!(agent = agent_id, path, %purpose, "reservation violation");
        self.emit(event.with_reason(format!("{purpose} without a covering reservation")));
        Err(ResvError::Violation {
            agent: agent_id.to_string(),
            path: path.to_string(),
            purpose: purpose.to_string(),
        })
    }

    // -- waiting ------------------------------------------------------------

    /// Block until `path` has no live holder, `timeout` elapses, or `cancel`
    /// fires. Holds no lock between wake-ups.
    pub fn wait_for_release(
        &self,
        path: &str,
        timeout: std::time::Duration,
        cancel: &CancelToken,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        let slot = self.slot(path)?;
        let outcome = {
            let mut holders = lock(&slot.holders, "path")?;
            loop {
                let now = self.clock.now();
                let live: Vec<HolderSummary> = holders
                    .iter()
                    .filter(|h| h.is_live(now))
                    .map(ReservationRecord::holder_summary)
                    .collect();
                if live.is_empty() {
                    break Ok(WaitOutcome::Available);
                }
                if cancel.is_cancelled() {
                    break Err(ResvError::WaitCancelled(path.to_string()));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break Ok(WaitOutcome::TimedOut(live));
                }
                holders = slot
                    .changed
                    .wait_timeout(holders, remaining.min(WAIT_SLICE))
                    .map(|(guard, _)| guard)
                    .map_err(|_| ResvError::StoreCorrupt("path lock poisoned during wait".into()))?;
            }
        };
        drop(slot);
        self.reclaim(&[path.to_string()])?;
        outcome
    }

    // -- queries ------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Option<ReservationRecord>> {
        let path = lock(&self.index, "index")?.get(id).cloned();
        if let Some(path) = path {
            let slot = lock(&self.slots, "lock table")?.get(&path).cloned();
            if let Some(slot) = slot {
                let holders = lock(&slot.holders, "path")?;
                if let Some(record) = holders.iter().find(|h| h.id == id) {
                    return Ok(Some(record.clone()));
                }
            }
        }
        self.history_get(id)
    }

    /// Records matching `filter`, active and terminal, oldest first.
    pub fn list(&self, filter: &ReservationFilter) -> Result<Vec<ReservationRecord>> {
        let mut out = Vec::new();
        if filter.status.is_none_or(|s| s == ReservationStatus::Active) {
            for (_, slot) in self.slot_snapshot()? {
                out.extend(
                    lock(&slot.holders, "path")?
                        .iter()
                        .filter(|r| filter.matches(r))
                        .cloned(),
                );
            }
        }
        if filter.status.is_none_or(|s| s.is_terminal()) {
            out.extend(
                lock(&self.history, "history")?
                    .values()
                    .filter(|r| filter.matches(r))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Every record the store knows about, for persistence.
    pub fn snapshot(&self) -> Result<Vec<ReservationRecord>> {
        self.list(&ReservationFilter::default())
    }

    // -- restore / integrity ------------------------------------------------

    /// Load previously persisted records into an empty store. A snapshot with
    /// duplicate ids or overlapping exclusive holders is rejected as corrupt.
    pub fn restore(&self, records: Vec<ReservationRecord>) -> Result<()> {
        for record in records {
            if record.expires_at <= record.created_at {
                return Err(ResvError::StoreCorrupt(format!(
                    "record {} expires before it was created",
                    record.id
                )));
            }
            let known = lock(&self.index, "index")?.contains_key(&record.id)
                || lock(&self.history, "history")?.contains_key(&record.id);
            if known {
                error!(id = %record.id, "duplicate reservation id in snapshot");
                return Err(ResvError::StoreCorrupt(format!(
                    "duplicate reservation id {}",
                    record.id
                )));
            }
            if record.is_active() {
                let slot = self.slot(&record.resource_path)?;
                let mut holders = lock(&slot.holders, "path")?;
                lock(&self.index, "index")?.insert(record.id.clone(), record.resource_path.clone());
                holders.push(record);
            } else {
                lock(&self.history, "history")?.insert(record.id.clone(), record);
            }
        }
        self.verify_invariants()
    }

    /// Check every path's holders and that the id index matches the lock table.
    pub fn verify_invariants(&self) -> Result<()> {
        let mut seen = 0usize;
        for (path, slot) in self.slot_snapshot()? {
            let holders = lock(&slot.holders, "path")?;
            check_path_invariants(&path, &holders)?;
            let index = lock(&self.index, "index")?;
            for record in holders.iter() {
                if index.get(&record.id) != Some(&path) {
                    error!(id = %record.id, path = %path, "active record missing from index");
                    return Err(ResvError::StoreCorrupt(format!(
                        "active record {} is not indexed under '{path}'",
                        record.id
                    )));
                }
            }
            seen += holders.len();
        }
        let indexed = lock(&self.index, "index")?.len();
        if indexed != seen {
            error!(indexed, seen, "index out of sync with lock table");
            return Err(ResvError::StoreCorrupt(format!(
                "index lists {indexed} active reservations but the lock table holds {seen}"
            )));
        }
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn slot(&self, path: &str) -> Result<Arc<PathSlot>> {
        let mut slots = lock(&self.slots, "lock table")?;
        Ok(Arc::clone(slots.entry(path.to_string()).or_default()))
    }

    fn slot_snapshot(&self) -> Result<Vec<(String, Arc<PathSlot>)>> {
        let slots = lock(&self.slots, "lock table")?;
        let mut snapshot: Vec<(String, Arc<PathSlot>)> = slots
            .iter()
            .map(|(p, s)| (p.clone(), Arc::clone(s)))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(snapshot)
    }

    /// Drop slots that hold no record and are referenced by nobody else.
    fn reclaim(&self, paths: &[String]) -> Result<()> {
        let mut slots = lock(&self.slots, "lock table")?;
        for path in paths {
            let idle = slots.get(path).is_some_and(|slot| {
                Arc::strong_count(slot) == 1
                    && slot.holders.try_lock().is_ok_and(|h| h.is_empty())
            });
            if idle {
                slots.remove(path);
            }
        }
        Ok(())
    }

    /// Run `f` on the active record `id` while its path is locked. Returns
    /// `None` when `id` is not active.
    fn with_active<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Vec<ReservationRecord>, usize, DateTime<Utc>) -> Result<T>,
    ) -> Result<Option<T>> {
        let Some(path) = lock(&self.index, "index")?.get(id).cloned() else {
            return Ok(None);
        };
        let slot = self.slot(&path)?;
        let outcome = {
            let mut holders = lock(&slot.holders, "path")?;
            match holders.iter().position(|h| h.id == id) {
                Some(pos) => Some(f(&mut holders, pos, self.clock.now())?),
                None => None,
            }
        };
        slot.changed.notify_all();
        drop(slot);
        self.reclaim(&[path])?;
        Ok(outcome)
    }

    /// Move the record at `pos` out of the active set into history. Caller
    /// holds the path lock.
    fn retire(
        &self,
        holders: &mut Vec<ReservationRecord>,
        pos: usize,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<ReservationRecord> {
        let mut record = holders.remove(pos);
        record.status = status;
        record.released_at = Some(now);
        lock(&self.index, "index")?.remove(&record.id);
        self.archive(std::slice::from_ref(&record))?;
        Ok(record)
    }

    fn archive(&self, records: &[ReservationRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut history = lock(&self.history, "history")?;
        for record in records {
            if history.insert(record.id.clone(), record.clone()).is_some() {
                error!(id = %record.id, "reservation retired twice");
                return Err(ResvError::StoreCorrupt(format!(
                    "reservation {} retired twice",
                    record.id
                )));
            }
        }
        Ok(())
    }

    fn history_get(&self, id: &str) -> Result<Option<ReservationRecord>> {
        Ok(lock(&self.history, "history")?.get(id).cloned())
    }

    fn emit(&self, event: LifecycleEvent) {
        self.sink.record(event);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemoryFeed;
    use std::thread;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryFeed>, ReservationStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let feed = Arc::new(MemoryFeed::new());
        let store = ReservationStore::new(clock.clone(), feed.clone());
        (clock, feed, store)
    }

    fn exclusive(store: &ReservationStore, agent: &str, path: &str, ttl: i64) -> Result<ReservationRecord> {
        store.try_acquire(
            agent,
            path,
            Mode::Exclusive,
            Purpose::Edit,
            Duration::seconds(ttl),
            Metadata::new(),
        )
    }

    fn shared(store: &ReservationStore, agent: &str, path: &str) -> Result<ReservationRecord> {
        store.try_acquire(
            agent,
            path,
            Mode::Shared,
            Purpose::Read,
            Duration::seconds(60),
            Metadata::new(),
        )
    }

    fn batch(paths: &[&str], mode: Mode) -> Vec<ReservationRequest> {
        paths
            .iter()
            .map(|p| ReservationRequest::new(*p, mode, Purpose::Edit))
            .collect()
    }

    // -- acquisition --------------------------------------------------------

    #[test]
    fn exclusive_blocks_everyone_else() {
        let (_clock, _feed, store) = setup();
        let held = exclusive(&store, "A1", "src/auth.ts", 10).unwrap();
        assert_eq!(held.status, ReservationStatus::Active);
        assert_eq!(held.expires_at - held.created_at, Duration::seconds(10));

        let err = exclusive(&store, "A2", "src/auth.ts", 10).unwrap_err();
        let ResvError::ResourceUnavailable(conflict) = err else {
            panic!("expected conflict, got {err:?}");
        };
        assert_eq!(conflict.path, "src/auth.ts");
        assert_eq!(conflict.holders[0].agent_id, "A1");
        assert!(shared(&store, "A2", "src/auth.ts").is_err());
        // Same agent cannot stack a second exclusive lease either
        assert!(exclusive(&store, "A1", "src/auth.ts", 10).is_err());
    }

    #[test]
    fn shared_holders_coexist_and_block_exclusive() {
        let (_clock, _feed, store) = setup();
        shared(&store, "A1", "x.ts").unwrap();
        shared(&store, "A2", "x.ts").unwrap();

        let err = exclusive(&store, "A3", "x.ts", 60).unwrap_err();
        let mut agents: Vec<String> = err.conflicts()[0]
            .holders
            .iter()
            .map(|h| h.agent_id.clone())
            .collect();
        agents.sort();
        assert_eq!(agents, vec!["A1", "A2"]);
    }

    #[test]
    fn check_reports_every_shared_holder() {
        let (_clock, _feed, store) = setup();
        assert!(store.check_availability("x.ts").unwrap().is_available());
        shared(&store, "A1", "x.ts").unwrap();
        shared(&store, "A2", "x.ts").unwrap();
        let availability = store.check_availability("x.ts").unwrap();
        assert_eq!(availability.holders().len(), 2);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let (_clock, _feed, store) = setup();
        assert!(matches!(
            exclusive(&store, "", "a.rs", 10),
            Err(ResvError::InvalidRequest(_))
        ));
        assert!(matches!(
            exclusive(&store, "A1", "a.rs", 0),
            Err(ResvError::InvalidRequest(_))
        ));
        assert!(matches!(
            store.try_acquire_batch("A1", &[], Duration::seconds(10), Metadata::new()),
            Err(ResvError::InvalidRequest(_))
        ));
    }

    // -- batches ------------------------------------------------------------

    #[test]
    fn batch_is_all_or_nothing() {
        let (_clock, _feed, store) = setup();
        let held = store
            .try_acquire_batch(
                "A1",
                &batch(&["/a.ts", "/b.ts", "/c.ts"], Mode::Exclusive),
                Duration::seconds(60),
                Metadata::new(),
            )
            .unwrap();
        assert_eq!(held.len(), 3);
        let batch_id = held[0].batch_id.clone().unwrap();
        assert!(held.iter().all(|r| r.batch_id.as_deref() == Some(batch_id.as_str())));

        let err = store
            .try_acquire_batch(
                "A2",
                &batch(&["/d.ts", "/b.ts"], Mode::Exclusive),
                Duration::seconds(60),
                Metadata::new(),
            )
            .unwrap_err();
        let ResvError::AtomicAcquireFailed(conflicts) = err else {
            panic!("expected atomic failure");
        };
        assert_eq!(conflicts[0].path, "/b.ts");
        assert_eq!(conflicts[0].holders[0].agent_id, "A1");

        assert!(store.check_availability("/d.ts").unwrap().is_available());
        assert!(store.list(&ReservationFilter::for_agent("A2")).unwrap().is_empty());
    }

    #[test]
    fn batch_items_see_earlier_items() {
        let (_clock, _feed, store) = setup();
        let requests = vec![
            ReservationRequest::new("a.rs", Mode::Shared, Purpose::Read),
            ReservationRequest::new("a.rs", Mode::Exclusive, Purpose::Edit),
        ];
        let err = store
            .try_acquire_batch("A1", &requests, Duration::seconds(60), Metadata::new())
            .unwrap_err();
        assert_eq!(err.code(), "atomic_acquire_failed");
        assert!(store.check_availability("a.rs").unwrap().is_available());

        let readers = vec![
            ReservationRequest::new("a.rs", Mode::Shared, Purpose::Read),
            ReservationRequest::new("a.rs", Mode::Shared, Purpose::Read),
        ];
        let held = store
            .try_acquire_batch("A1", &readers, Duration::seconds(60), Metadata::new())
            .unwrap();
        assert_eq!(held.len(), 2);
    }

    #[test]
    fn failed_acquire_leaves_no_slots_behind() {
        let (_clock, _feed, store) = setup();
        exclusive(&store, "A1", "b.ts", 60).unwrap();
        let _ = store.try_acquire_batch(
            "A2",
            &batch(&["a.ts", "b.ts", "c.ts"], Mode::Exclusive),
            Duration::seconds(60),
            Metadata::new(),
        );
        assert_eq!(store.slot_count(), 1);
    }

    #[test]
    fn overlapping_batches_in_opposite_order_never_deadlock() {
        let (_clock, _feed, store) = setup();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let agent = format!("agent-{worker}");
                let mut paths = vec!["p1", "p2", "p3", "p4"];
                if worker % 2 == 1 {
                    paths.reverse();
                }
                for _ in 0..200 {
                    if let Ok(records) = store.try_acquire_batch(
                        &agent,
                        &batch(&paths, Mode::Exclusive),
                        Duration::seconds(60),
                        Metadata::new(),
                    ) {
                        assert_eq!(records.len(), 4);
                        for record in records {
                            store.release(&record.id, &agent).unwrap();
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        store.verify_invariants().unwrap();
        assert!(store.list(&ReservationFilter::active()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_exclusive_requests_grant_exactly_one() {
        let (_clock, _feed, store) = setup();
        let store = Arc::new(store);
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    exclusive(&store, &format!("agent-{i}"), "hot.rs", 60).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        store.verify_invariants().unwrap();
    }

    // -- release / extend ---------------------------------------------------

    #[test]
    fn release_is_idempotent_and_owner_checked() {
        let (_clock, feed, store) = setup();
        let rec = exclusive(&store, "A1", "a.rs", 60).unwrap();

        let err = store.release(&rec.id, "A2").unwrap_err();
        assert!(matches!(err, ResvError::NotOwner { .. }));
        assert!(!store.check_availability("a.rs").unwrap().is_available());

        store.release(&rec.id, "A1").unwrap();
        store.release(&rec.id, "A1").unwrap();
        assert!(store.check_availability("a.rs").unwrap().is_available());
        assert_eq!(
            store.get(&rec.id).unwrap().unwrap().status,
            ReservationStatus::Released
        );
        assert_eq!(feed.of_kind(EventKind::Released).len(), 1);
        assert!(matches!(
            store.release("nope", "A1"),
            Err(ResvError::NotFound(_))
        ));
        store.release(&Uuid::new_v4().to_string(), "A1").unwrap();
    }

    #[test]
    fn extend_moves_expiry_from_original_deadline() {
        let (clock, _feed, store) = setup();
        let rec = exclusive(&store, "A1", "/y.ts", 3600).unwrap();
        clock.advance_secs(600);
        let extended = store.extend(&rec.id, "A1", Duration::seconds(1800)).unwrap();
        assert_eq!(extended.expires_at, rec.created_at + Duration::seconds(5400));

        let err = store.extend(&rec.id, "A2", Duration::seconds(10)).unwrap_err();
        assert!(matches!(err, ResvError::NotOwner { .. }));
        assert_eq!(
            store.get(&rec.id).unwrap().unwrap().expires_at,
            extended.expires_at
        );
        assert!(matches!(
            store.extend(&rec.id, "A1", Duration::zero()),
            Err(ResvError::InvalidRequest(_))
        ));
    }

    #[test]
    fn extend_after_lapse_is_not_found() {
        let (clock, feed, store) = setup();
        let rec = exclusive(&store, "A1", "a.rs", 10).unwrap();
        clock.advance_secs(11);
        assert!(matches!(
            store.extend(&rec.id, "A1", Duration::seconds(60)),
            Err(ResvError::NotFound(_))
        ));
        assert_eq!(
            store.get(&rec.id).unwrap().unwrap().status,
            ReservationStatus::Expired
        );
        assert_eq!(feed.of_kind(EventKind::Expired).len(), 1);
    }

    #[test]
    fn extend_after_release_is_not_found() {
        let (_clock, _feed, store) = setup();
        let rec = exclusive(&store, "A1", "a.rs", 10).unwrap();
        store.release(&rec.id, "A1").unwrap();
        assert!(matches!(
            store.extend(&rec.id, "A1", Duration::seconds(60)),
            Err(ResvError::NotFound(_))
        ));
    }

    #[test]
    fn release_all_frees_only_that_agent() {
        let (_clock, _feed, store) = setup();
        exclusive(&store, "A1", "a.rs", 60).unwrap();
        exclusive(&store, "A1", "b.rs", 60).unwrap();
        exclusive(&store, "A2", "c.rs", 60).unwrap();
        let released = store.release_all("A1").unwrap();
        assert_eq!(released.len(), 2);
        assert!(store.check_availability("a.rs").unwrap().is_available());
        assert!(!store.check_availability("c.rs").unwrap().is_available());
    }

    // -- expiry -------------------------------------------------------------

    #[test]
    fn lapsed_lease_stops_blocking_before_sweep() {
        let (clock, _feed, store) = setup();
        exclusive(&store, "A1", "a.rs", 10).unwrap();
        clock.advance_secs(10);
        assert!(!store.check_availability("a.rs").unwrap().is_available());
        clock.advance_secs(1);
        assert!(store.check_availability("a.rs").unwrap().is_available());

        let rec = exclusive(&store, "A2", "a.rs", 10).unwrap();
        assert_eq!(rec.agent_id, "A2");
        let expired = store
            .list(&ReservationFilter {
                status: Some(ReservationStatus::Expired),
                ..ReservationFilter::default()
            })
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].agent_id, "A1");
        store.verify_invariants().unwrap();
    }

    #[test]
    fn expire_lapsed_emits_one_event_per_record() {
        let (clock, feed, store) = setup();
        exclusive(&store, "A1", "a.rs", 10).unwrap();
        exclusive(&store, "A1", "b.rs", 100).unwrap();
        clock.advance_secs(11);
        let expired = store.expire_lapsed().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].resource_path, "a.rs");

        let events = feed.of_kind(EventKind::Expired);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].held_secs, Some(11));
        assert_eq!(events[0].actor.as_deref(), Some("sweeper"));
        assert_eq!(store.slot_count(), 1);
    }

    #[test]
    fn gc_history_drops_old_terminal_records() {
        let (clock, _feed, store) = setup();
        let rec = exclusive(&store, "A1", "a.rs", 10).unwrap();
        store.release(&rec.id, "A1").unwrap();
        clock.advance_secs(100);
        assert_eq!(store.gc_history(Duration::seconds(1000)).unwrap(), 0);
        assert_eq!(store.gc_history(Duration::seconds(50)).unwrap(), 1);
        assert!(store.get(&rec.id).unwrap().is_none());
        // Still idempotent once the history entry is gone
        store.release(&rec.id, "A1").unwrap();
        assert!(matches!(
            store.extend(&rec.id, "A1", Duration::seconds(5)),
            Err(ResvError::NotFound(_))
        ));
    }

    #[test]
    fn gc_history_with_unbounded_retention_keeps_everything() {
        let (clock, _feed, store) = setup();
        let rec = exclusive(&store, "A1", "a.rs", 10).unwrap();
        store.release(&rec.id, "A1").unwrap();
        clock.advance_secs(100);
        assert_eq!(store.gc_history(Duration::MAX).unwrap(), 0);
        assert!(store.get(&rec.id).unwrap().is_some());
    }

    #[test]
    fn out_of_range_durations_are_invalid_requests() {
        let (_clock, feed, store) = setup();
        let err = store
            .try_acquire("A1", "a.rs", Mode::Exclusive, Purpose::Edit, Duration::MAX, Metadata::new())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(store.slot_count(), 0);
        let err = store
            .try_acquire_batch("A1", &batch(&["a.rs", "b.rs"], Mode::Exclusive), Duration::MAX, Metadata::new())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let rec = exclusive(&store, "A1", "a.rs", 60).unwrap();
        let err = store.extend(&rec.id, "A1", Duration::MAX).unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(store.get(&rec.id).unwrap().unwrap().expires_at, rec.expires_at);
        assert!(feed.of_kind(EventKind::Extended).is_empty());
        store.verify_invariants().unwrap();
    }

    // -- force release / violations -----------------------------------------

    #[test]
    fn force_release_bypasses_owner_and_logs_reason() {
        let (_clock, feed, store) = setup();
        let rec = exclusive(&store, "A1", "a.rs", 60).unwrap();
        let released = store.force_release(&rec.id, "coordinator", "holder crashed").unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        assert!(store.check_availability("a.rs").unwrap().is_available());

        let events = feed.of_kind(EventKind::ForceReleased);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, "A1");
        assert_eq!(events[0].reason.as_deref(), Some("holder crashed"));
        assert!(matches!(
            store.force_release("missing", "coordinator", "x"),
            Err(ResvError::NotFound(_))
        ));
    }

    #[test]
    fn verify_access_flags_uncovered_operations() {
        let (_clock, feed, store) = setup();
        exclusive(&store, "A1", "a.rs", 60).unwrap();
        store.verify_access("A1", "a.rs", Purpose::Edit).unwrap();

        let err = store.verify_access("A2", "a.rs", Purpose::Edit).unwrap_err();
        assert_eq!(err.code(), "violation");

        let reader = shared(&store, "A3", "r.rs").unwrap();
        store.verify_access("A3", "r.rs", Purpose::Read).unwrap();
        assert!(store.verify_access("A3", "r.rs", Purpose::Delete).is_err());
        assert_eq!(
            store.get(&reader.id).unwrap().unwrap().status,
            ReservationStatus::Violated
        );
        assert!(store.check_availability("r.rs").unwrap().is_available());
        assert_eq!(feed.of_kind(EventKind::Violated).len(), 2);
    }

    // -- waiting ------------------------------------------------------------

    #[test]
    fn wait_returns_when_holder_releases() {
        let (_clock, _feed, store) = setup();
        let store = Arc::new(store);
        let rec = exclusive(&store, "A1", "a.rs", 60).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store.wait_for_release("a.rs", std::time::Duration::from_secs(5), &CancelToken::new())
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));
        store.release(&rec.id, "A1").unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::Available);
    }

    #[test]
    fn wait_times_out_with_holders() {
        let (_clock, _feed, store) = setup();
        exclusive(&store, "A1", "a.rs", 60).unwrap();
        let outcome = store
            .wait_for_release("a.rs", std::time::Duration::from_millis(60), &CancelToken::new())
            .unwrap();
        let WaitOutcome::TimedOut(holders) = outcome else {
            panic!("expected timeout");
        };
        assert_eq!(holders[0].agent_id, "A1");
    }

    #[test]
    fn wait_aborts_on_cancel() {
        let (_clock, _feed, store) = setup();
        exclusive(&store, "A1", "a.rs", 60).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        let err = store
            .wait_for_release("a.rs", std::time::Duration::from_secs(30), &token)
            .unwrap_err();
        assert_eq!(err.code(), "wait_cancelled");
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    // -- restore ------------------------------------------------------------

    #[test]
    fn restore_round_trips_snapshot() {
        let (_clock, _feed, store) = setup();
        let a = exclusive(&store, "A1", "a.rs", 60).unwrap();
        let b = exclusive(&store, "A1", "b.rs", 60).unwrap();
        store.release(&b.id, "A1").unwrap();

        let (_clock2, _feed2, restored) = setup();
        restored.restore(store.snapshot().unwrap()).unwrap();
        assert_eq!(restored.get(&a.id).unwrap().unwrap().status, ReservationStatus::Active);
        assert_eq!(restored.get(&b.id).unwrap().unwrap().status, ReservationStatus::Released);
        assert!(!restored.check_availability("a.rs").unwrap().is_available());
    }

    #[test]
    fn restore_rejects_conflicting_snapshot() {
        let (_clock, _feed, store) = setup();
        let a = exclusive(&store, "A1", "a.rs", 60).unwrap();
        let mut twin = a.clone();
        twin.id = "other".into();
        twin.agent_id = "A2".into();

        let (_clock2, _feed2, restored) = setup();
        let err = restored.restore(vec![a.clone(), twin]).unwrap_err();
        assert_eq!(err.code(), "store_corrupt");

        let (_clock3, _feed3, dup) = setup();
        let err = dup.restore(vec![a.clone(), a]).unwrap_err();
        assert_eq!(err.code(), "store_corrupt");
    }
}
