use std::collections::HashMap;

use crate::hours::Tally;
use crate::model::*;
use crate::store::Order;

use super::{BatchControl, BatchReport, Engine, EngineError};

impl Engine {
    /// Recompute one user's service hours from their past appointments and write
    /// the aggregate document. Tutors accumulate `seconds_tutored`, pupils
    /// `seconds_pupiled`. Supervisors are left as they are.
    pub async fn refresh_hours(&self, user: UserId) -> Result<ServiceHours, EngineError> {
        let profile = self.require_profile(user).await?;
        if profile.kind == UserKind::Supervisor {
            tracing::warn!(%user, "supervisors accrue no service hours, skipping refresh");
            return Ok(self.store.hours(user).await?);
        }
        let _guards = self.lock_users(&[user]).await;
        let past = self
            .store
            .past_by_clock_out(user, Order::Ascending, None)
            .await?;

        let mut policies: HashMap<ulid::Ulid, RoundingPolicy> = HashMap::new();
        for appt in &past {
            let location = appt.time.location.id;
            if policies.contains_key(&location) {
                continue;
            }
            // A deleted location still counts, at the default policy
            if let Some(loc) = self.store.location(location).await? {
                policies.insert(location, loc.rounding);
            }
        }

        let hours = Tally::from_past(&past, &policies).into_hours(profile.kind, self.settings.utc_offset);
        if self.store.hours(user).await? != hours {
            tracing::debug!(
                %user,
                sessions = hours.sessions,
                seconds_tutored = hours.seconds_tutored,
                seconds_pupiled = hours.seconds_pupiled,
                "service hours updated"
            );
            self.store
                .commit(vec![Write::PutHours {
                    user,
                    hours: hours.clone(),
                }])
                .await?;
        }
        Ok(hours)
    }

    pub async fn refresh_hours_all(&self, users: &[UserId], control: &BatchControl) -> BatchReport {
        self.run_batch("hours", users, control, |user| async move {
            let before = self.store.hours(user).await?;
            Ok::<_, EngineError>(self.refresh_hours(user).await? != before)
        })
        .await
    }

    /// Refresh every user with a profile.
    pub async fn refresh_hours_everyone(
        &self,
        control: &BatchControl,
    ) -> Result<BatchReport, EngineError> {
        let mut users: Vec<UserId> = self
            .directory
            .profiles()
            .await?
            .into_iter()
            .filter(|p| p.kind != UserKind::Supervisor)
            .map(|p| p.id)
            .collect();
        users.sort();
        Ok(self.refresh_hours_all(&users, control).await)
    }
}
