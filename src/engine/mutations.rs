use std::future::Future;

use tracing::{info, warn};
use ulid::Ulid;

use crate::hours;
use crate::lifecycle::{self, Transition};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{record_transition, OVERRIDES_TOTAL};

use super::{delete_copies, put_copies, Engine, EngineError};

/// Await a transition and count its outcome.
async fn observed<T>(
    transition: Transition,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let result = fut.await;
    record_transition(transition, result.is_ok());
    if let Err(e) = &result {
        tracing::debug!(transition = transition.as_str(), error = %e, "transition rejected");
    }
    result
}

/// The attendee's own reference, or `UnauthorizedActor` for anyone else.
fn attendee_ref(appt: &Appointment, user: UserId) -> Result<UserRef, EngineError> {
    [&appt.attendees.from, &appt.attendees.to]
        .into_iter()
        .find(|r| r.id == user)
        .cloned()
        .ok_or(EngineError::UnauthorizedActor(user))
}

fn name_of(appt: &Appointment, user: UserId) -> String {
    attendee_ref(appt, user).map(|r| r.name).unwrap_or_default()
}

/// Re-rank `slot` against the location's current periods and validate it.
fn anchor(location: &Location, slot: &Slot) -> Result<Slot, EngineError> {
    let resolved = location.resolve(slot).ok_or_else(|| {
        EngineError::InvalidWindow(format!("{slot}: period not defined at {}", location.name))
    })?;
    resolved
        .validate()
        .map_err(|msg| EngineError::InvalidWindow(format!("{resolved}: {msg}")))?;
    Ok(resolved)
}

impl Engine {
    // ── Locations, profiles, availability ────────────────────

    pub async fn put_location(&self, mut location: Location) -> Result<(), EngineError> {
        if location.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("location name too long"));
        }
        if location.periods.len() > MAX_PERIODS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many periods"));
        }
        if location.supervisors.len() > MAX_SUPERVISORS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many supervisors"));
        }
        if let Some(slot) = location.hours.iter().find(|s| s.location.id != location.id) {
            return Err(EngineError::InvalidWindow(format!(
                "{slot}: operating hours belong to another location"
            )));
        }
        location.hours = location
            .hours
            .iter()
            .map(|slot| anchor(&location, slot))
            .collect::<Result<_, _>>()?;
        info!(location = %location.id, name = %location.name, "location saved");
        self.store.commit(vec![Write::PutLocation(location)]).await?;
        Ok(())
    }

    pub async fn put_profile(&self, profile: UserProfile) -> Result<(), EngineError> {
        if profile.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if let Some(location) = profile.location {
            self.require_location(location).await?;
        }
        self.store.commit(vec![Write::PutProfile(profile)]).await?;
        Ok(())
    }

    /// Declare (or redeclare) a weekly window the user is available in.
    pub async fn declare_window(&self, user: UserId, slot: Slot) -> Result<(), EngineError> {
        let location = self.require_location(slot.location.id).await?;
        let slot = anchor(&location, &slot)?;
        let _guards = self.lock_users(&[user]).await;
        let before = self.store.availability(user).await?;
        let mut availability = before.clone();
        availability.upsert(TimeWindow::unbooked(slot))?;
        if availability != before {
            self.store
                .commit(vec![Write::PutAvailability { user, availability }])
                .await?;
        }
        Ok(())
    }

    /// Withdraw an unbooked window.
    pub async fn remove_window(&self, user: UserId, slot: &Slot) -> Result<TimeWindow, EngineError> {
        let _guards = self.lock_users(&[user]).await;
        let mut availability = self.store.availability(user).await?;
        let removed = availability.remove(slot)?;
        self.store
            .commit(vec![Write::PutAvailability { user, availability }])
            .await?;
        Ok(removed)
    }

    // ── Appointment lifecycle ────────────────────────────────

    /// Book `slot` from the tutor's (`to`) availability. Both attendees' windows are
    /// marked booked and both appointment copies are written in one commit.
    pub async fn request_appointment(
        &self,
        id: Ulid,
        from: UserId,
        to: UserId,
        slot: Slot,
        subject: String,
        now: Ms,
    ) -> Result<Appointment, EngineError> {
        observed(Transition::Request, async {
            if from == to {
                return Err(EngineError::UnauthorizedActor(from));
            }
            if subject.len() > MAX_SUBJECT_LEN {
                return Err(EngineError::LimitExceeded("subject too long"));
            }
            let location = self.require_location(slot.location.id).await?;
            let slot = anchor(&location, &slot)?;
            let pupil = self.require_profile(from).await?;
            let tutor = self.require_profile(to).await?;

            let _guards = self.lock_users(&[from, to]).await;
            if self.store.find_appointment(id).await?.is_some() {
                return Err(EngineError::InvalidTransition {
                    state: AppointmentState::Requested,
                    transition: Transition::Request,
                });
            }
            let mut tutor_availability = self.store.availability(to).await?;
            match tutor_availability.get(&slot) {
                None => return Err(EngineError::SlotUnavailable(slot.to_string())),
                Some(w) if w.booked => return Err(EngineError::WindowBooked(slot.to_string())),
                Some(_) => {}
            }
            let mut pupil_availability = self.store.availability(from).await?;
            tutor_availability.set_booked(&slot, true);
            pupil_availability.set_booked(&slot, true);

            let appt = Appointment::requested(
                id,
                Attendees {
                    from: pupil.to_ref(),
                    to: tutor.to_ref(),
                },
                slot,
                subject,
                now,
            );
            let mut writes = vec![
                Write::PutAvailability {
                    user: to,
                    availability: tutor_availability,
                },
                Write::PutAvailability {
                    user: from,
                    availability: pupil_availability,
                },
            ];
            writes.extend(put_copies(&appt, Partition::Active));
            self.store.commit(writes).await?;

            info!(appointment = %id, pupil = %from, tutor = %to, slot = %appt.time, "appointment requested");
            self.notify.send(
                Notification::new(
                    to,
                    "New Appointment Request",
                    format!("{} requested {} on {}", pupil.name, appt.subject, appt.time),
                )
                .about(id),
            );
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    /// Lock both attendees, re-read the active copy, apply `apply` and write both
    /// copies back.
    async fn update_active(
        &self,
        id: Ulid,
        transition: Transition,
        apply: impl FnOnce(&mut Appointment) -> Result<(), EngineError>,
    ) -> Result<Appointment, EngineError> {
        let located = self.locate_appointment(id).await?;
        let _guards = self.lock_users(&located.attendees.ids()).await;
        let mut appt = self.load_active(&located, transition).await?;
        apply(&mut appt)?;
        self.store.commit(put_copies(&appt, Partition::Active)).await?;
        Ok(appt)
    }

    async fn load_active(
        &self,
        located: &Appointment,
        transition: Transition,
    ) -> Result<Appointment, EngineError> {
        match self.reload(located, Partition::Active).await {
            Err(EngineError::NotFound(_)) if located.state == AppointmentState::Past => {
                Err(EngineError::InvalidTransition {
                    state: AppointmentState::Past,
                    transition,
                })
            }
            other => other,
        }
    }

    pub async fn clock_in(&self, id: Ulid, actor: UserId, at: Ms) -> Result<Appointment, EngineError> {
        observed(Transition::ClockIn, async {
            let appt = self
                .update_active(id, Transition::ClockIn, |appt| {
                    let actor = attendee_ref(appt, actor)?;
                    lifecycle::clock_in(appt, &actor, at)
                })
                .await?;
            info!(appointment = %id, user = %actor, "clocked in");
            self.notify_other(
                &appt,
                actor,
                "Clock In",
                format!("{} clocked in for {}", name_of(&appt, actor), appt.subject),
            );
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    pub async fn approve_clock_in(
        &self,
        id: Ulid,
        approver: UserId,
        at: Ms,
    ) -> Result<Appointment, EngineError> {
        observed(Transition::ApproveClockIn, async {
            let appt = self
                .update_active(id, Transition::ApproveClockIn, |appt| {
                    let approver = attendee_ref(appt, approver)?;
                    lifecycle::approve_clock_in(appt, &approver, at)
                })
                .await?;
            self.notify_other(
                &appt,
                approver,
                "Clock In Approved",
                format!("{} approved your clock-in", name_of(&appt, approver)),
            );
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    pub async fn clock_out(&self, id: Ulid, actor: UserId, at: Ms) -> Result<Appointment, EngineError> {
        observed(Transition::ClockOut, async {
            let appt = self
                .update_active(id, Transition::ClockOut, |appt| {
                    let actor = attendee_ref(appt, actor)?;
                    lifecycle::clock_out(appt, &actor, at)
                })
                .await?;
            info!(appointment = %id, user = %actor, "clocked out, awaiting approval");
            self.notify_other(
                &appt,
                actor,
                "Clock Out",
                format!(
                    "{} clocked out of {}; please approve",
                    name_of(&appt, actor),
                    appt.subject
                ),
            );
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    /// Drop a pending clock-out; the appointment stays active.
    pub async fn reject_clock_out(&self, id: Ulid, actor: UserId) -> Result<Appointment, EngineError> {
        observed(Transition::RejectClockOut, async {
            let mut rejected = None;
            let appt = self
                .update_active(id, Transition::RejectClockOut, |appt| {
                    let actor = attendee_ref(appt, actor)?;
                    rejected = Some(lifecycle::reject_clock_out(appt, &actor)?);
                    Ok(())
                })
                .await?;
            if let Some(event) = rejected {
                self.notify.send(
                    Notification::new(
                        event.sent_by.id,
                        "Clock Out Rejected",
                        format!("{} rejected your clock-out", name_of(&appt, actor)),
                    )
                    .about(id),
                );
            }
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    /// `Active → Past`: the non-sender approves the clock-out and both copies move
    /// to the past partition in one commit.
    pub async fn approve_clock_out(
        &self,
        id: Ulid,
        approver: UserId,
        at: Ms,
    ) -> Result<Appointment, EngineError> {
        observed(Transition::ApproveClockOut, async {
            let appt = {
                let located = self.locate_appointment(id).await?;
                let _guards = self.lock_users(&located.attendees.ids()).await;
                let mut appt = self.load_active(&located, Transition::ApproveClockOut).await?;
                let approver_ref = attendee_ref(&appt, approver)?;
                let duration = lifecycle::approve_clock_out(&mut appt, &approver_ref, at)?;
                self.archive(&appt).await?;
                info!(appointment = %id, duration_secs = duration / 1000, "appointment archived");
                appt
            };
            for user in appt.attendees.ids() {
                self.notify.send(
                    Notification::new(
                        user,
                        "Appointment Completed",
                        format!("{} on {} is complete", appt.subject, appt.time),
                    )
                    .about(id),
                );
            }
            self.refresh_attendee_hours(&appt).await;
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    /// Supervisor override: archive an active appointment without approval.
    pub async fn force_archive(
        &self,
        id: Ulid,
        supervisor: UserId,
        at: Ms,
    ) -> Result<Appointment, EngineError> {
        observed(Transition::ForceArchive, async {
            let located = self.locate_appointment(id).await?;
            let location = self.require_location(located.time.location.id).await?;
            if !location.is_supervisor(supervisor) {
                return Err(EngineError::UnauthorizedActor(supervisor));
            }
            let supervisor_ref = self.require_profile(supervisor).await?.to_ref();
            let appt = {
                let _guards = self.lock_users(&located.attendees.ids()).await;
                let mut appt = self.load_active(&located, Transition::ForceArchive).await?;
                lifecycle::force_archive(&mut appt, &supervisor_ref, at)?;
                self.archive(&appt).await?;
                appt
            };
            warn!(
                appointment = %id,
                supervisor = %supervisor,
                "supervisor archived appointment without attendee approval"
            );
            metrics::counter!(OVERRIDES_TOTAL, "kind" => Transition::ForceArchive.as_str())
                .increment(1);
            for user in appt.attendees.ids() {
                self.notify.send(
                    Notification::new(
                        user,
                        "Appointment Archived",
                        format!("{} archived {} on {}", supervisor_ref.name, appt.subject, appt.time),
                    )
                    .about(id),
                );
            }
            self.refresh_attendee_hours(&appt).await;
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    /// Delete a requested appointment before clock-in and release its slot for
    /// each attendee that no other appointment still holds it for.
    pub async fn cancel(&self, id: Ulid, actor: UserId) -> Result<(), EngineError> {
        observed(Transition::Cancel, async {
            let located = self.locate_appointment(id).await?;
            let _guards = self.lock_users(&located.attendees.ids()).await;
            let appt = self.load_active(&located, Transition::Cancel).await?;
            let actor_ref = attendee_ref(&appt, actor)?;
            lifecycle::ensure_cancellable(&appt, &actor_ref)?;

            let mut writes = delete_copies(&appt, Partition::Active);
            for user in appt.attendees.ids() {
                if self.slot_still_held(user, &appt).await? {
                    continue;
                }
                let mut availability = self.store.availability(user).await?;
                if availability.set_booked(&appt.time, false) {
                    writes.push(Write::PutAvailability { user, availability });
                }
            }
            self.store.commit(writes).await?;

            info!(appointment = %id, user = %actor, "appointment cancelled");
            self.notify_other(
                &appt,
                actor,
                "Appointment Cancelled",
                format!("{} cancelled {} on {}", actor_ref.name, appt.subject, appt.time),
            );
            Ok::<_, EngineError>(())
        })
        .await
    }

    /// Supervisor correction: snap a past appointment's clock times to the
    /// location's rounding policy on both copies, then refresh both totals.
    pub async fn round_past_appointment(
        &self,
        id: Ulid,
        supervisor: UserId,
    ) -> Result<Appointment, EngineError> {
        observed(Transition::Correct, async {
            let located = self.locate_appointment(id).await?;
            if located.state != AppointmentState::Past {
                return Err(EngineError::InvalidTransition {
                    state: located.state,
                    transition: Transition::Correct,
                });
            }
            let location = self.require_location(located.time.location.id).await?;
            if !location.is_supervisor(supervisor) {
                return Err(EngineError::UnauthorizedActor(supervisor));
            }
            let supervisor_ref = self.require_profile(supervisor).await?.to_ref();
            let appt = {
                let _guards = self.lock_users(&located.attendees.ids()).await;
                let mut appt = self.reload(&located, Partition::Past).await?;
                if !hours::round_clock_times(&mut appt, &location.rounding) {
                    return Err(EngineError::InvalidTransition {
                        state: appt.state,
                        transition: Transition::Correct,
                    });
                }
                appt.override_by = Some(supervisor_ref);
                self.store.commit(put_copies(&appt, Partition::Past)).await?;
                appt
            };
            info!(appointment = %id, supervisor = %supervisor, "clock times rounded");
            metrics::counter!(OVERRIDES_TOTAL, "kind" => Transition::Correct.as_str()).increment(1);
            self.refresh_attendee_hours(&appt).await;
            Ok::<_, EngineError>(appt)
        })
        .await
    }

    // ── Helpers ──────────────────────────────────────────────

    /// Move both copies from active to past in one commit, then read both back.
    async fn archive(&self, appt: &Appointment) -> Result<(), EngineError> {
        let mut writes = delete_copies(appt, Partition::Active);
        writes.extend(put_copies(appt, Partition::Past));
        self.store.commit(writes).await?;

        let mut disagree = Vec::new();
        for user in appt.attendees.ids() {
            let past = self.store.appointment(user, Partition::Past, appt.id).await?;
            let active = self.store.appointment(user, Partition::Active, appt.id).await?;
            if past.as_ref() != Some(appt) || active.is_some() {
                disagree.push(user);
            }
        }
        if disagree.is_empty() {
            return Ok(());
        }
        tracing::error!(appointment = %appt.id, users = ?disagree, "archival read-back mismatch");
        Err(EngineError::PartialArchival {
            appointment: appt.id,
            users: disagree,
        })
    }

    /// Whether another live or past appointment of `user` sits on the same slot.
    async fn slot_still_held(&self, user: UserId, appt: &Appointment) -> Result<bool, EngineError> {
        for partition in [Partition::Active, Partition::Past] {
            let held = self
                .store
                .appointments(user, partition)
                .await?
                .iter()
                .any(|a| a.id != appt.id && a.time.equals(&appt.time));
            if held {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Totals are derived data; a failed refresh is logged and left to the sweeper.
    async fn refresh_attendee_hours(&self, appt: &Appointment) {
        for user in appt.attendees.ids() {
            if let Err(e) = self.refresh_hours(user).await {
                warn!(user = %user, appointment = %appt.id, error = %e, "hours refresh failed");
            }
        }
    }
}
