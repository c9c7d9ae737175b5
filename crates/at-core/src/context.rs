//! Audit Context
//!
//! Who made a change and when. Captured once per tracked change so every
//! event raised by one save shares the same actor and time source.

use chrono::{DateTime, Utc};

/// Supplies the current actor identity
pub trait ActorProvider: Send + Sync {
    fn current_actor(&self) -> String;
}

/// Source of event timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant, for replays and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Actor that never changes, e.g. a batch job's service principal
#[derive(Debug, Clone)]
pub struct StaticActor(pub String);

impl StaticActor {
    pub fn new(actor: impl Into<String>) -> Self {
        Self(actor.into())
    }
}

impl ActorProvider for StaticActor {
    fn current_actor(&self) -> String {
        self.0.clone()
    }
}

impl<F> ActorProvider for F
where
    F: Fn() -> String + Send + Sync,
{
    fn current_actor(&self) -> String {
        self()
    }
}

/// Actor and time stamped onto change events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditContext {
    /// Context for `actor` at the current wall-clock time
    pub fn new(actor: impl Into<String>) -> Self {
        Self::at(actor, Utc::now())
    }

    pub fn at(actor: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            actor: actor.into(),
            timestamp,
        }
    }

    /// Capture the current actor and time from the providers
    pub fn capture(actor: &dyn ActorProvider, clock: &dyn Clock) -> Self {
        Self::at(actor.current_actor(), clock.now())
    }
}
