use crate::model::*;

use super::{BatchControl, BatchReport, Engine, EngineError};

impl Engine {
    /// Re-derive one user's booked flags from their full appointment history
    /// (active and past). Writes only if something changed.
    pub async fn reconcile_user(&self, user: UserId) -> Result<bool, EngineError> {
        let _guards = self.lock_users(&[user]).await;
        let mut history = self.store.appointments(user, Partition::Active).await?;
        history.extend(self.store.appointments(user, Partition::Past).await?);

        let mut availability = self.store.availability(user).await?;
        let changed = availability.reconcile(user, &history);
        if changed {
            tracing::debug!(
                %user,
                windows = availability.len(),
                booked = availability.booked_count(),
                "availability reconciled"
            );
            self.store
                .commit(vec![Write::PutAvailability { user, availability }])
                .await?;
        }
        Ok(changed)
    }

    pub async fn reconcile_all(&self, users: &[UserId], control: &BatchControl) -> BatchReport {
        self.run_batch("reconcile", users, control, |user| self.reconcile_user(user))
            .await
    }

    /// Reconcile every user the store knows about.
    pub async fn reconcile_everyone(&self, control: &BatchControl) -> Result<BatchReport, EngineError> {
        let users = self.store.user_ids().await?;
        Ok(self.reconcile_all(&users, control).await)
    }
}
