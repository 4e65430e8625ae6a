mod aggregate;
mod batch;
mod error;
mod mutations;
mod queries;
mod reconcile;
#[cfg(test)]
mod tests;

pub use batch::{next_delay, BatchControl, BatchReport, Progress, RetryPolicy, UnitFailure};
pub use error::EngineError;

use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::store::{DocumentStore, UserDirectory};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Concurrent units in a reconcile or aggregate batch.
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Offset used to turn clock-out timestamps into report dates.
    pub utc_offset: FixedOffset,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            retry: RetryPolicy::default(),
            utc_offset: Utc.fix(),
        }
    }
}

/// Drives availability, appointments and service hours against a
/// [`DocumentStore`]. Holds no documents itself; every operation reads what it
/// needs under the owning users' locks and commits the result in one write.
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    directory: Arc<dyn UserDirectory>,
    pub notify: Arc<NotifyHub>,
    settings: EngineSettings,
    /// Serializes read-modify-write cycles per user.
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn UserDirectory>,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            directory,
            notify,
            settings,
            user_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Acquire the locks of `users` in sorted order to prevent deadlocks.
    pub(super) async fn lock_users(&self, users: &[UserId]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = users.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.user_locks.entry(id).or_default().value().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    pub(super) async fn require_location(&self, id: Ulid) -> Result<Location, EngineError> {
        self.store
            .location(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) async fn require_profile(&self, id: UserId) -> Result<UserProfile, EngineError> {
        self.directory
            .profile(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Any copy of the appointment, to learn its attendees before locking them.
    pub(super) async fn locate_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.store
            .find_appointment(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Re-read the `from` copy once the attendees are locked.
    pub(super) async fn reload(
        &self,
        located: &Appointment,
        partition: Partition,
    ) -> Result<Appointment, EngineError> {
        self.store
            .appointment(located.attendees.from.id, partition, located.id)
            .await?
            .ok_or(EngineError::NotFound(located.id))
    }

    pub(super) fn notify_other(&self, appt: &Appointment, actor: UserId, title: &str, body: String) {
        if let Some(other) = appt.attendees.other(actor) {
            self.notify
                .send(Notification::new(other.id, title, body).about(appt.id));
        }
    }
}

/// Puts of both attendee copies into `partition`.
pub(super) fn put_copies(appt: &Appointment, partition: Partition) -> Vec<Write> {
    appt.attendees
        .ids()
        .into_iter()
        .map(|user| Write::PutAppointment {
            user,
            partition,
            appointment: appt.clone(),
        })
        .collect()
}

/// Deletes of both attendee copies from `partition`.
pub(super) fn delete_copies(appt: &Appointment, partition: Partition) -> Vec<Write> {
    appt.attendees
        .ids()
        .into_iter()
        .map(|user| Write::DeleteAppointment {
            user,
            partition,
            id: appt.id,
        })
        .collect()
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}
