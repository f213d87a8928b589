//! Participant registry: who is in the session, and over which connection.
//!
//! The registry is the presenter's in-memory table of registered
//! participants.  Each entry tracks:
//!
//! - The participant's identity, display name, address and status tag.
//! - When the last heartbeat arrived, which drives the liveness view and
//!   timeout eviction.
//! - The one live connection that belongs to it, plus the connection number
//!   assigned at accept time.
//!
//! # Participant lifecycle
//!
//! ```text
//! Unregistered ──► Registered ──► Active ⇄ Stale ──► Closed
//! ```
//!
//! - `Registered`: admitted by [`ParticipantRegistry::admit`].
//! - `Active` / `Stale`: derived from heartbeat age, see [`Liveness`].
//! - `Closed`: removed by disconnect, eviction, or replacement.
//!
//! # Connection numbers
//!
//! When the same machine reconnects, the new connection replaces the old one
//! under the same identity.  The old connection's task is still winding
//! down, and its cleanup must not remove the *new* entry.  Every mutating
//! call from a connection task therefore carries the connection number, and
//! the call is ignored if the entry has since been taken over.
//!
//! The registry is generic over the connection handle `C` so it can be
//! exercised without sockets.  It performs no I/O; callers hold its lock only
//! for the duration of one call.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use classlink_core::{ParticipantId, ParticipantStatus};
use thiserror::Error;

/// Why a registration was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("session full ({capacity} participants)")]
    SessionFull { capacity: usize },
}

/// Liveness derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Heartbeats are arriving on schedule.
    Active,
    /// Heartbeats are late but the timeout has not yet expired.
    Stale,
}

/// Server-side state for one registered participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub name: String,
    pub machine_id: String,
    pub address: SocketAddr,
    pub status: ParticipantStatus,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
}

impl ParticipantRecord {
    /// Creates a record for a participant that has just registered.
    pub fn new(id: ParticipantId, name: String, machine_id: String, address: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            machine_id,
            address,
            status: ParticipantStatus::Online,
            connected_at: now,
            last_heartbeat: now,
        }
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn liveness(&self, now: Instant, stale_after: Duration) -> Liveness {
        if self.heartbeat_age(now) > stale_after {
            Liveness::Stale
        } else {
            Liveness::Active
        }
    }
}

/// A record plus its liveness at the time the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSummary {
    pub record: ParticipantRecord,
    pub liveness: Liveness,
}

#[derive(Debug)]
struct Slot<C> {
    record: ParticipantRecord,
    connection: C,
    connection_id: u64,
}

/// In-memory registry of registered participants.
#[derive(Debug)]
pub struct ParticipantRegistry<C> {
    slots: HashMap<ParticipantId, Slot<C>>,
    capacity: usize,
}

impl<C: Clone> ParticipantRegistry<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity,
        }
    }

    /// Admits a newly registered participant.
    ///
    /// If the identity is already present its entry is replaced and the
    /// displaced connection is returned so the caller can close it.  A
    /// replacement never counts against the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`AdmitError::SessionFull`] when a new identity would exceed
    /// the capacity.
    pub fn admit(
        &mut self,
        record: ParticipantRecord,
        connection: C,
        connection_id: u64,
    ) -> Result<Option<C>, AdmitError> {
        if !self.slots.contains_key(&record.id) && self.slots.len() >= self.capacity {
            return Err(AdmitError::SessionFull {
                capacity: self.capacity,
            });
        }

        let slot = Slot {
            record,
            connection,
            connection_id,
        };
        Ok(self
            .slots
            .insert(slot.record.id.clone(), slot)
            .map(|old| old.connection))
    }

    /// Records a heartbeat.  Returns `false` if `connection_id` no longer
    /// owns the entry.
    pub fn touch(&mut self, id: &ParticipantId, connection_id: u64, now: Instant) -> bool {
        match self.current_slot_mut(id, connection_id) {
            Some(slot) => {
                slot.record.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Applies a participant-supplied name/status update.
    pub fn update_info(
        &mut self,
        id: &ParticipantId,
        connection_id: u64,
        name: Option<String>,
        status: Option<ParticipantStatus>,
    ) -> bool {
        let Some(slot) = self.current_slot_mut(id, connection_id) else {
            return false;
        };
        if let Some(name) = name {
            slot.record.name = name;
        }
        if let Some(status) = status {
            slot.record.status = status;
        }
        true
    }

    /// Sets the status tag on behalf of a collaborator.
    pub fn set_status(&mut self, id: &ParticipantId, status: ParticipantStatus) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) => {
                slot.record.status = status;
                true
            }
            None => false,
        }
    }

    /// Removes the entry only if it still belongs to `connection_id`.
    pub fn remove_if_current(
        &mut self,
        id: &ParticipantId,
        connection_id: u64,
    ) -> Option<(ParticipantRecord, C)> {
        self.current_slot_mut(id, connection_id)?;
        self.slots
            .remove(id)
            .map(|slot| (slot.record, slot.connection))
    }

    /// Removes the entry regardless of which connection owns it.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<(ParticipantRecord, C)> {
        self.slots
            .remove(id)
            .map(|slot| (slot.record, slot.connection))
    }

    /// Removes and returns every participant whose last heartbeat is older
    /// than `timeout`.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(ParticipantRecord, C)> {
        let expired: Vec<ParticipantId> = self
            .slots
            .values()
            .filter(|slot| slot.record.heartbeat_age(now) > timeout)
            .map(|slot| slot.record.id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    pub fn connection(&self, id: &ParticipantId) -> Option<C> {
        self.slots.get(id).map(|slot| slot.connection.clone())
    }

    /// Connections of every participant not in `exclude`.
    pub fn connections_except(&self, exclude: &HashSet<ParticipantId>) -> Vec<(ParticipantId, C)> {
        self.slots
            .iter()
            .filter(|(id, _)| !exclude.contains(*id))
            .map(|(id, slot)| (id.clone(), slot.connection.clone()))
            .collect()
    }

    /// All connections, e.g. for shutdown.
    pub fn all_connections(&self) -> Vec<C> {
        self.slots.values().map(|slot| slot.connection.clone()).collect()
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&ParticipantRecord> {
        self.slots.get(id).map(|slot| &slot.record)
    }

    /// Snapshot of all participants, sorted by name for display.
    pub fn summaries(&self, now: Instant, stale_after: Duration) -> Vec<ParticipantSummary> {
        let mut all: Vec<ParticipantSummary> = self
            .slots
            .values()
            .map(|slot| ParticipantSummary {
                liveness: slot.record.liveness(now, stale_after),
                record: slot.record.clone(),
            })
            .collect();
        all.sort_by(|a, b| {
            a.record
                .name
                .cmp(&b.record.name)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn current_slot_mut(&mut self, id: &ParticipantId, connection_id: u64) -> Option<&mut Slot<C>> {
        self.slots
            .get_mut(id)
            .filter(|slot| slot.connection_id == connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in connection handle: just a label.
    type Conn = &'static str;

    fn record(machine: &str, name: &str) -> ParticipantRecord {
        let address: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        ParticipantRecord::new(
            ParticipantId::derive(machine, address.ip()),
            name.to_string(),
            machine.to_string(),
            address,
        )
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry: ParticipantRegistry<Conn> = ParticipantRegistry::new(50);
        assert!(registry.is_empty());
        assert_eq!(registry.capacity(), 50);
    }

    #[test]
    fn test_admit_adds_participant() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let r = record("m1", "Alice");
        let id = r.id.clone();

        // Act
        let displaced = registry.admit(r, "conn-a", 1).unwrap();

        // Assert
        assert!(displaced.is_none());
        assert_eq!(registry.get(&id).unwrap().name, "Alice");
        assert_eq!(registry.connection(&id), Some("conn-a"));
    }

    #[test]
    fn test_admit_same_identity_returns_displaced_connection() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        registry.admit(record("m1", "Alice"), "old", 1).unwrap();

        // Act
        let displaced = registry.admit(record("m1", "Alice again"), "new", 2).unwrap();

        // Assert
        assert_eq!(displaced, Some("old"));
        assert_eq!(registry.len(), 1, "one identity, one entry");
        let id = record("m1", "").id;
        assert_eq!(registry.connection(&id), Some("new"));
    }

    #[test]
    fn test_stale_connection_cannot_remove_replacement() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let id = record("m1", "").id;
        registry.admit(record("m1", "Alice"), "old", 1).unwrap();
        registry.admit(record("m1", "Alice"), "new", 2).unwrap();

        // Act – the old connection's cleanup runs late
        let removed = registry.remove_if_current(&id, 1);

        // Assert
        assert!(removed.is_none());
        assert_eq!(registry.connection(&id), Some("new"));
    }

    #[test]
    fn test_remove_if_current_removes_own_entry() {
        let mut registry = ParticipantRegistry::new(50);
        let id = record("m1", "").id;
        registry.admit(record("m1", "Alice"), "c", 7).unwrap();

        let removed = registry.remove_if_current(&id, 7);

        assert_eq!(removed.map(|(r, c)| (r.name, c)), Some(("Alice".to_string(), "c")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_admit_rejects_new_identity_when_full() {
        // Arrange
        let mut registry = ParticipantRegistry::new(2);
        registry.admit(record("m1", "A"), "a", 1).unwrap();
        registry.admit(record("m2", "B"), "b", 2).unwrap();

        // Act
        let third = registry.admit(record("m3", "C"), "c", 3);
        let replacement = registry.admit(record("m1", "A"), "a2", 4);

        // Assert
        assert_eq!(third, Err(AdmitError::SessionFull { capacity: 2 }));
        assert_eq!(replacement, Ok(Some("a")));
    }

    #[test]
    fn test_touch_refreshes_heartbeat_only_for_owner() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let id = record("m1", "").id;
        registry.admit(record("m1", "A"), "c", 1).unwrap();
        let later = Instant::now() + Duration::from_secs(5);

        // Act
        let wrong = registry.touch(&id, 99, later);
        let right = registry.touch(&id, 1, later);

        // Assert
        assert!(!wrong);
        assert!(right);
        assert_eq!(registry.get(&id).unwrap().last_heartbeat, later);
    }

    #[test]
    fn test_take_expired_removes_only_timed_out_participants() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let fresh = record("fresh", "F");
        let fresh_id = fresh.id.clone();
        registry.admit(fresh, "f", 1).unwrap();
        let mut old = record("old", "O");
        old.last_heartbeat = Instant::now() - Duration::from_secs(20);
        registry.admit(old, "o", 2).unwrap();

        // Act
        let expired = registry.take_expired(Instant::now(), Duration::from_secs(15));
        let again = registry.take_expired(Instant::now(), Duration::from_secs(15));

        // Assert
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, "o");
        assert!(again.is_empty(), "an eviction is reported once");
        assert!(registry.get(&fresh_id).is_some());
    }

    #[test]
    fn test_summaries_report_liveness_and_sort_by_name() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let mut late = record("m1", "Zed");
        late.last_heartbeat = Instant::now() - Duration::from_secs(8);
        registry.admit(late, "z", 1).unwrap();
        registry.admit(record("m2", "Amy"), "a", 2).unwrap();

        // Act
        let all = registry.summaries(Instant::now(), Duration::from_secs(6));

        // Assert
        assert_eq!(all[0].record.name, "Amy");
        assert_eq!(all[0].liveness, Liveness::Active);
        assert_eq!(all[1].record.name, "Zed");
        assert_eq!(all[1].liveness, Liveness::Stale);
    }

    #[test]
    fn test_update_info_and_set_status() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let id = record("m1", "").id;
        registry.admit(record("m1", "A"), "c", 1).unwrap();

        // Act
        registry.update_info(&id, 1, Some("Alice".to_string()), Some(ParticipantStatus::Busy));
        let after_info = registry.get(&id).unwrap().clone();
        registry.set_status(&id, ParticipantStatus::ScreenLocked);

        // Assert
        assert_eq!(after_info.name, "Alice");
        assert_eq!(after_info.status, ParticipantStatus::Busy);
        assert_eq!(registry.get(&id).unwrap().status, ParticipantStatus::ScreenLocked);
        assert!(!registry.set_status(&ParticipantId::new("ghost"), ParticipantStatus::Busy));
    }

    #[test]
    fn test_connections_except_skips_excluded() {
        // Arrange
        let mut registry = ParticipantRegistry::new(50);
        let a = record("a", "A");
        let a_id = a.id.clone();
        registry.admit(a, "ca", 1).unwrap();
        registry.admit(record("b", "B"), "cb", 2).unwrap();

        // Act
        let targets = registry.connections_except(&HashSet::from([a_id]));

        // Assert
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].1, "cb");
    }
}
