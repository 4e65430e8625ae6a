//! Document-store boundary.
//!
//! The engine only talks to storage through [`DocumentStore`] and
//! [`UserDirectory`]. [`WalStore`] is the bundled implementation: in-memory
//! documents made durable by a write-ahead log.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::availability::AvailabilityStore;
use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// Transient outage; the caller may retry.
    Unavailable(String),
    Io(std::io::Error),
    Corrupt(String),
    /// The background writer has shut down.
    Closed,
    LimitExceeded(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            StoreError::Io(e) => write!(f, "io: {e}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt document: {msg}"),
            StoreError::Closed => write!(f, "store writer shut down"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn location(&self, id: Ulid) -> Result<Option<Location>, StoreError>;

    /// Every user with at least one document.
    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError>;

    /// A user's availability; empty if they never declared any.
    async fn availability(&self, user: UserId) -> Result<AvailabilityStore, StoreError>;

    async fn appointment(
        &self,
        user: UserId,
        partition: Partition,
        id: Ulid,
    ) -> Result<Option<Appointment>, StoreError>;

    async fn appointments(
        &self,
        user: UserId,
        partition: Partition,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Locate any copy of an appointment by id, active partition first.
    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    /// Past appointments ordered by `clockOut.sentTimestamp`. Records without a
    /// clock-out are excluded.
    async fn past_by_clock_out(
        &self,
        user: UserId,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// The user's aggregate fields; defaults if never written.
    async fn hours(&self, user: UserId) -> Result<ServiceHours, StoreError>;

    /// Apply every write or none of them.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError>;
}

/// Read-only lookup of user profiles.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, id: UserId) -> Result<Option<UserProfile>, StoreError>;

    async fn profiles(&self) -> Result<Vec<UserProfile>, StoreError>;
}
