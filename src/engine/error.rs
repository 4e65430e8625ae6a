use ulid::Ulid;

use crate::lifecycle::Transition;
use crate::model::{AppointmentState, Ms, UserId};
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    InvalidWindow(String),
    WindowBooked(String),
    /// The slot is not part of the tutor's declared availability.
    SlotUnavailable(String),
    UnauthorizedActor(UserId),
    SelfApproval(UserId),
    NegativeDuration(Ms),
    InvalidTransition {
        state: AppointmentState,
        transition: Transition,
    },
    /// One attendee's copy was archived and the other was not.
    PartialArchival {
        appointment: Ulid,
        users: Vec<UserId>,
    },
    ExternalStoreUnavailable(String),
    LimitExceeded(&'static str),
    Store(String),
}

impl EngineError {
    /// Only store outages are worth retrying; everything else is a guard violation
    /// or a permanent store fault.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::ExternalStoreUnavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidWindow(msg) => write!(f, "invalid window: {msg}"),
            EngineError::WindowBooked(slot) => write!(f, "window is booked: {slot}"),
            EngineError::SlotUnavailable(slot) => {
                write!(f, "slot is not in the tutor's availability: {slot}")
            }
            EngineError::UnauthorizedActor(id) => {
                write!(f, "user {id} is not allowed to act on this appointment")
            }
            EngineError::SelfApproval(id) => {
                write!(f, "user {id} cannot approve their own clock event")
            }
            EngineError::NegativeDuration(ms) => {
                write!(f, "session duration must be positive, got {ms}ms")
            }
            EngineError::InvalidTransition { state, transition } => {
                write!(f, "cannot {} an appointment that is {state}", transition.as_str())
            }
            EngineError::PartialArchival { appointment, users } => write!(
                f,
                "appointment {appointment} archived inconsistently; copies of {users:?} disagree"
            ),
            EngineError::ExternalStoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => EngineError::ExternalStoreUnavailable(msg),
            other => EngineError::Store(other.to_string()),
        }
    }
}
