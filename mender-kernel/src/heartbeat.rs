/**
 * HEARTBEAT TRACKER - Last-seen table fed by the heartbeat channel
 *
 * A `Heartbeat` payload upserts the sender's last-seen time, an `Exit` payload
 * removes it. Presence in the table is the only "alive since last departure"
 * signal the liveness evaluator relies on.
 *
 * The recorded time is the coordinator's receive time, not the timestamp
 * written by the worker, so that worker clock skew cannot mark an instance
 * fresh or stale.
 */

use crate::logline::LogLine;
use crate::models::InstanceId;
use crate::state::{new_state, Shared};
use std::collections::HashMap;
use time::OffsetDateTime;

pub type SharedHeartbeats = Shared<HeartbeatTracker>;

/// What a heartbeat-channel line did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Recorded,
    Departed,
    /// `Exit` for an id that was not tracked.
    AlreadyGone,
    /// Payload was neither `Heartbeat` nor `Exit`.
    Ignored(String),
}

#[derive(Debug, Default, Clone)]
pub struct HeartbeatTracker {
    last_seen: HashMap<InstanceId, OffsetDateTime>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedHeartbeats {
        new_state(Self::new())
    }

    /// Applies one parsed heartbeat-channel line.
    pub fn record(&mut self, line: &LogLine, received_at: OffsetDateTime) -> HeartbeatOutcome {
        let payload = line.message.trim();
        if payload.eq_ignore_ascii_case("heartbeat") {
            self.beat(&line.tag, received_at);
            HeartbeatOutcome::Recorded
        } else if payload.eq_ignore_ascii_case("exit") {
            if self.depart(&line.tag) {
                HeartbeatOutcome::Departed
            } else {
                HeartbeatOutcome::AlreadyGone
            }
        } else {
            HeartbeatOutcome::Ignored(payload.to_string())
        }
    }

    pub fn beat(&mut self, id: &str, at: OffsetDateTime) {
        self.last_seen.insert(id.to_string(), at);
    }

    /// Removes `id`; returns false when it was not tracked.
    pub fn depart(&mut self, id: &str) -> bool {
        self.last_seen.remove(id).is_some()
    }

    pub fn last_seen(&self, id: &str) -> Option<OffsetDateTime> {
        self.last_seen.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
