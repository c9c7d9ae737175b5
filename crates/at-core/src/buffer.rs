//! Audit Buffer
//!
//! Collects change events raised while a unit of work is open. Events are
//! only written when the unit of work flushes, inside the same transaction
//! as the entity changes that produced them.
//!
//! Newly created entities often get their key from the database during the
//! save. Their events are buffered against a [`PendingKey`] and the key is
//! assigned once it is known; flushing with unassigned keys is an error.

use std::fmt;

use at_common::{AuditIdentity, ChangeEvent};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{AuditError, Result};

/// Placeholder for a source key the store has not generated yet
#[derive(Debug, PartialEq, Eq)]
pub struct PendingKey {
    id: usize,
    source_type: String,
}

impl PendingKey {
    pub fn source_type(&self) -> &str {
        &self.source_type
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#<pending {}>", self.source_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BufferedKey {
    Resolved(String),
    Pending(usize),
}

#[derive(Debug)]
struct BufferedEvent {
    source_type: String,
    key: BufferedKey,
    event: ChangeEvent,
}

/// Events raised in one unit of work, in the order they were raised
#[derive(Debug, Default)]
pub struct AuditBuffer {
    events: Vec<BufferedEvent>,
    next_pending: usize,
}

impl AuditBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an event for an entity whose key is known
    pub fn push(&mut self, identity: AuditIdentity, event: ChangeEvent) {
        self.events.push(BufferedEvent {
            source_type: identity.source_type,
            key: BufferedKey::Resolved(identity.source_key),
            event,
        });
    }

    /// Buffer an event for an entity whose key is not generated yet
    pub fn defer(&mut self, source_type: impl Into<String>, event: ChangeEvent) -> PendingKey {
        let id = self.next_pending;
        self.next_pending += 1;
        let source_type = source_type.into();
        debug!(source_type = %source_type, pending = id, "Buffered audit event with pending key");

        self.events.push(BufferedEvent {
            source_type: source_type.clone(),
            key: BufferedKey::Pending(id),
            event,
        });
        PendingKey { id, source_type }
    }

    /// Buffer a further event for the same not-yet-keyed entity
    pub fn push_pending(&mut self, key: &PendingKey, event: ChangeEvent) {
        self.events.push(BufferedEvent {
            source_type: key.source_type.clone(),
            key: BufferedKey::Pending(key.id),
            event,
        });
    }

    /// Assign the generated key to every event buffered against `key`
    pub fn assign_key(&mut self, key: PendingKey, source_key: impl Into<String>) {
        let source_key = source_key.into();
        for buffered in &mut self.events {
            if buffered.key == BufferedKey::Pending(key.id) {
                buffered.key = BufferedKey::Resolved(source_key.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events still waiting for a key
    pub fn pending_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.key, BufferedKey::Pending(_)))
            .count()
    }

    /// Group events by identity, keeping first-appearance order of identities
    /// and raise order of events within each identity
    pub fn into_grouped(self) -> Result<Vec<(AuditIdentity, Vec<ChangeEvent>)>> {
        if let Some(first) = self
            .events
            .iter()
            .find(|e| matches!(e.key, BufferedKey::Pending(_)))
        {
            let source_type = first.source_type.clone();
            return Err(AuditError::UnresolvedKey {
                count: self.pending_count(),
                source_type,
            });
        }

        let mut groups: IndexMap<AuditIdentity, Vec<ChangeEvent>> = IndexMap::new();
        for buffered in self.events {
            if let BufferedKey::Resolved(source_key) = buffered.key {
                groups
                    .entry(AuditIdentity::new(buffered.source_type, source_key))
                    .or_default()
                    .push(buffered.event);
            }
        }
        Ok(groups.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use at_common::AuditAction;
    use chrono::Utc;

    fn event(action: AuditAction) -> ChangeEvent {
        ChangeEvent::new(action, "admin", Utc::now())
    }

    #[test]
    fn test_grouping_keeps_order() {
        let mut buffer = AuditBuffer::new();
        buffer.push(AuditIdentity::new("Product", "1"), event(AuditAction::Updated));
        buffer.push(AuditIdentity::new("Order", "7"), event(AuditAction::Created));
        buffer.push(AuditIdentity::new("Product", "1"), event(AuditAction::Added));

        let groups = buffer.into_grouped().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, AuditIdentity::new("Product", "1"));
        let actions: Vec<_> = groups[0].1.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Updated, AuditAction::Added]);
        assert_eq!(groups[1].0.source_type, "Order");
    }

    #[test]
    fn test_pending_key_is_assigned_to_all_its_events() {
        let mut buffer = AuditBuffer::new();
        let key = buffer.defer("Product", event(AuditAction::Created));
        buffer.push_pending(&key, event(AuditAction::Added));
        assert_eq!(buffer.pending_count(), 2);

        buffer.assign_key(key, "99");
        assert_eq!(buffer.pending_count(), 0);

        let groups = buffer.into_grouped().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, AuditIdentity::new("Product", "99"));
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn test_unassigned_key_fails_the_flush() {
        let mut buffer = AuditBuffer::new();
        let _key = buffer.defer("Product", event(AuditAction::Created));
        let err = buffer.into_grouped().unwrap_err();
        assert!(matches!(err, AuditError::UnresolvedKey { count: 1, .. }));
    }
}
