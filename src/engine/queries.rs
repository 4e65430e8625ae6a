use ulid::Ulid;

use crate::availability::AvailabilityStore;
use crate::model::*;
use crate::report::ReportRow;

use super::{Engine, EngineError};

impl Engine {
    pub async fn location(&self, id: Ulid) -> Result<Location, EngineError> {
        self.require_location(id).await
    }

    pub async fn profile(&self, id: UserId) -> Result<UserProfile, EngineError> {
        self.require_profile(id).await
    }

    pub async fn availability(&self, user: UserId) -> Result<AvailabilityStore, EngineError> {
        Ok(self.store.availability(user).await?)
    }

    /// Unbooked windows of `user`, optionally at one location.
    pub async fn open_windows(
        &self,
        user: UserId,
        location: Option<Ulid>,
    ) -> Result<Vec<TimeWindow>, EngineError> {
        let availability = self.store.availability(user).await?;
        Ok(availability
            .windows()
            .iter()
            .filter(|w| !w.booked)
            .filter(|w| location.is_none_or(|id| w.slot.location.id == id))
            .cloned()
            .collect())
    }

    /// Any copy of an appointment, active partition first.
    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.locate_appointment(id).await
    }

    pub async fn appointments(
        &self,
        user: UserId,
        partition: Partition,
    ) -> Result<Vec<Appointment>, EngineError> {
        let mut appts = self.store.appointments(user, partition).await?;
        appts.sort_by_key(|a| (a.created_at, a.id));
        Ok(appts)
    }

    /// The stored aggregate; defaults if never computed.
    pub async fn hours(&self, user: UserId) -> Result<ServiceHours, EngineError> {
        Ok(self.store.hours(user).await?)
    }

    /// Rows for every tutor (optionally at one location), ordered by name.
    pub async fn service_hour_report(
        &self,
        location: Option<Ulid>,
    ) -> Result<Vec<ReportRow>, EngineError> {
        let mut tutors: Vec<UserProfile> = self
            .directory
            .profiles()
            .await?
            .into_iter()
            .filter(|p| p.kind == UserKind::Tutor)
            .filter(|p| location.is_none() || p.location == location)
            .collect();
        tutors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let mut rows = Vec::with_capacity(tutors.len());
        for tutor in &tutors {
            let hours = self.store.hours(tutor.id).await?;
            rows.push(ReportRow::new(tutor, &hours));
        }
        Ok(rows)
    }
}
