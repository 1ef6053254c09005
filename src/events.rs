use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Purpose, ReservationRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "reservation.acquired")]
    Acquired,
    #[serde(rename = "reservation.released")]
    Released,
    #[serde(rename = "reservation.extended")]
    Extended,
    #[serde(rename = "reservation.expired")]
    Expired,
    #[serde(rename = "reservation.force_released")]
    ForceReleased,
    #[serde(rename = "reservation.violated")]
    Violated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "reservation.acquired",
            Self::Released => "reservation.released",
            Self::Extended => "reservation.extended",
            Self::Expired => "reservation.expired",
            Self::ForceReleased => "reservation.force_released",
            Self::Violated => "reservation.violated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reservation.acquired" => Ok(Self::Acquired),
            "reservation.released" => Ok(Self::Released),
            "reservation.extended" => Ok(Self::Extended),
            "reservation.expired" => Ok(Self::Expired),
            "reservation.force_released" => Ok(Self::ForceReleased),
            "reservation.violated" => Ok(Self::Violated),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

/// One entry of the reservation audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    pub path: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Purpose>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_secs: Option<i64>,
    /// Who caused the transition when it was not the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LifecycleEvent {
    pub fn for_record(kind: EventKind, record: &ReservationRecord, ts: DateTime<Utc>) -> Self {
        let held_secs = match kind {
            EventKind::Acquired | EventKind::Extended => None,
            _ => Some(record.held_duration(ts).num_seconds().max(0)),
        };
        Self {
            ts,
            kind,
            reservation_id: Some(record.id.clone()),
            path: record.resource_path.clone(),
            agent_id: record.agent_id.clone(),
            purpose: Some(record.purpose),
            held_secs,
            actor: None,
            reason: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Destination for lifecycle events. The store emits exactly one event per
/// state transition and never reads them back.
pub trait EventSink: Send + Sync {
    fn record(&self, event: LifecycleEvent);
}

/// Keeps events in memory until drained.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn drain(&self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

impl EventSink for MemoryFeed {
    fn record(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, Mode, ReservationStatus};
    use chrono::Duration;

    #[test]
    fn event_uses_dotted_type_name() {
        let now = Utc::now();
        let record = ReservationRecord {
            id: "r-1".into(),
            resource_path: "src/a.rs".into(),
            agent_id: "A1".into(),
            mode: Mode::Exclusive,
            purpose: Purpose::Edit,
            created_at: now - Duration::seconds(30),
            expires_at: now + Duration::seconds(30),
            status: ReservationStatus::Expired,
            metadata: Metadata::new(),
            batch_id: None,
            released_at: Some(now),
        };
        let event = LifecycleEvent::for_record(EventKind::Expired, &record, now).with_actor("sweeper");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reservation.expired");
        assert_eq!(json["heldSecs"], 30);
        assert_eq!(json["actor"], "sweeper");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn memory_feed_drains() {
        let feed = MemoryFeed::new();
        feed.record(LifecycleEvent {
            ts: Utc::now(),
            kind: EventKind::Violated,
            reservation_id: None,
            path: "x".into(),
            agent_id: "A1".into(),
            purpose: None,
            held_secs: None,
            actor: None,
            reason: None,
        });
        assert_eq!(feed.of_kind(EventKind::Violated).len(), 1);
        assert_eq!(feed.drain().len(), 1);
        assert!(feed.events().is_empty());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [EventKind::Acquired, EventKind::ForceReleased] {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
    }
}
