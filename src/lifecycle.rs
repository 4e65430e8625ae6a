//! Appointment state machine: `Requested → Active → Past`.
//!
//! These functions only validate and mutate an in-memory [`Appointment`];
//! persisting both attendee copies is the engine's job.

use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Request,
    ClockIn,
    ApproveClockIn,
    ClockOut,
    RejectClockOut,
    ApproveClockOut,
    Cancel,
    ForceArchive,
    Correct,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Request => "request",
            Transition::ClockIn => "clock_in",
            Transition::ApproveClockIn => "approve_clock_in",
            Transition::ClockOut => "clock_out",
            Transition::RejectClockOut => "reject_clock_out",
            Transition::ApproveClockOut => "approve_clock_out",
            Transition::Cancel => "cancel",
            Transition::ForceArchive => "force_archive",
            Transition::Correct => "correct",
        }
    }
}

fn invalid(appt: &Appointment, transition: Transition) -> EngineError {
    EngineError::InvalidTransition {
        state: appt.state,
        transition,
    }
}

fn ensure_attendee(appt: &Appointment, actor: &UserRef) -> Result<(), EngineError> {
    if appt.attendees.contains(actor.id) {
        Ok(())
    } else {
        Err(EngineError::UnauthorizedActor(actor.id))
    }
}

fn positive_duration(start: Ms, end: Ms) -> Result<Ms, EngineError> {
    let duration = end - start;
    if duration <= 0 {
        return Err(EngineError::NegativeDuration(duration));
    }
    Ok(duration)
}

/// `Requested → Active`.
pub fn clock_in(appt: &mut Appointment, actor: &UserRef, at: Ms) -> Result<(), EngineError> {
    ensure_attendee(appt, actor)?;
    if appt.state != AppointmentState::Requested || appt.clock_in.is_some() {
        return Err(invalid(appt, Transition::ClockIn));
    }
    appt.clock_in = Some(ClockEvent::sent(actor, at));
    appt.state = AppointmentState::Active;
    Ok(())
}

/// Counter-approve a clock-in. Advisory: the appointment is already active.
pub fn approve_clock_in(appt: &mut Appointment, approver: &UserRef, at: Ms) -> Result<(), EngineError> {
    ensure_attendee(appt, approver)?;
    if appt.state != AppointmentState::Active {
        return Err(invalid(appt, Transition::ApproveClockIn));
    }
    match &appt.clock_in {
        Some(cin) if cin.is_approved() => return Err(invalid(appt, Transition::ApproveClockIn)),
        Some(cin) if cin.sent_by.id == approver.id => {
            return Err(EngineError::SelfApproval(approver.id));
        }
        Some(_) => {}
        None => return Err(invalid(appt, Transition::ApproveClockIn)),
    }
    if let Some(cin) = appt.clock_in.as_mut() {
        cin.approved_by = Some(approver.clone());
        cin.approved_timestamp = Some(at);
    }
    Ok(())
}

/// Record a clock-out. The appointment stays active until the other attendee approves.
pub fn clock_out(appt: &mut Appointment, actor: &UserRef, at: Ms) -> Result<(), EngineError> {
    ensure_attendee(appt, actor)?;
    if appt.state != AppointmentState::Active || appt.clock_out.is_some() {
        return Err(invalid(appt, Transition::ClockOut));
    }
    let Some(clock_in) = &appt.clock_in else {
        return Err(invalid(appt, Transition::ClockOut));
    };
    positive_duration(clock_in.sent_timestamp, at)?;
    appt.clock_out = Some(ClockEvent::sent(actor, at));
    Ok(())
}

/// Drop a pending clock-out. Only the attendee who did not send it may reject it.
pub fn reject_clock_out(appt: &mut Appointment, actor: &UserRef) -> Result<ClockEvent, EngineError> {
    ensure_attendee(appt, actor)?;
    if appt.state != AppointmentState::Active {
        return Err(invalid(appt, Transition::RejectClockOut));
    }
    if let Some(cout) = &appt.clock_out
        && cout.sent_by.id == actor.id
    {
        return Err(EngineError::SelfApproval(actor.id));
    }
    appt.clock_out
        .take()
        .ok_or_else(|| invalid(appt, Transition::RejectClockOut))
}

/// `Active → Past`. Returns the session duration in ms.
pub fn approve_clock_out(appt: &mut Appointment, approver: &UserRef, at: Ms) -> Result<Ms, EngineError> {
    ensure_attendee(appt, approver)?;
    if appt.state != AppointmentState::Active {
        return Err(invalid(appt, Transition::ApproveClockOut));
    }
    let (Some(cin), Some(cout)) = (&appt.clock_in, &appt.clock_out) else {
        return Err(invalid(appt, Transition::ApproveClockOut));
    };
    if cout.sent_by.id == approver.id {
        return Err(EngineError::SelfApproval(approver.id));
    }
    let duration = positive_duration(cin.sent_timestamp, cout.sent_timestamp)?;
    if let Some(cout) = appt.clock_out.as_mut() {
        cout.approved_by = Some(approver.clone());
        cout.approved_timestamp = Some(at);
    }
    appt.state = AppointmentState::Past;
    Ok(duration)
}

/// Supervisor override: archive an active appointment without the attendees'
/// approval. A missing clock-out is recorded at `at` on the supervisor's behalf.
/// Authorization against the location's supervisors happens in the engine.
pub fn force_archive(appt: &mut Appointment, supervisor: &UserRef, at: Ms) -> Result<Ms, EngineError> {
    if appt.state != AppointmentState::Active {
        return Err(invalid(appt, Transition::ForceArchive));
    }
    let Some(cin) = &appt.clock_in else {
        return Err(invalid(appt, Transition::ForceArchive));
    };
    let clock_out_at = appt
        .clock_out
        .as_ref()
        .map_or(at, |c| c.sent_timestamp);
    let duration = positive_duration(cin.sent_timestamp, clock_out_at)?;
    let cout = appt
        .clock_out
        .get_or_insert_with(|| ClockEvent::sent(supervisor, at));
    cout.approved_by = Some(supervisor.clone());
    cout.approved_timestamp = Some(at);
    appt.override_by = Some(supervisor.clone());
    appt.state = AppointmentState::Past;
    Ok(duration)
}

/// Any attendee may cancel before clock-in.
pub fn ensure_cancellable(appt: &Appointment, actor: &UserRef) -> Result<(), EngineError> {
    ensure_attendee(appt, actor)?;
    if appt.state != AppointmentState::Requested || appt.clock_in.is_some() {
        return Err(invalid(appt, Transition::Cancel));
    }
    Ok(())
}
