use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::MAX_WINDOWS_PER_USER;
use crate::model::*;

/// A user's declared weekly availability.
///
/// Windows are deduplicated by slot identity and kept sorted by it, so two stores
/// holding the same windows serialize to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityStore {
    windows: Vec<TimeWindow>,
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.windows
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn position(&self, slot: &Slot) -> Result<usize, usize> {
        self.windows
            .binary_search_by(|w| w.slot.cmp_identity(slot))
    }

    pub fn get(&self, slot: &Slot) -> Option<&TimeWindow> {
        self.position(slot).ok().map(|i| &self.windows[i])
    }

    pub fn booked_count(&self) -> usize {
        self.windows.iter().filter(|w| w.booked).count()
    }

    /// Insert or replace by identity. A replaced window keeps its current `booked`
    /// flag: that flag is derived from appointment history, not edited by hand.
    pub fn upsert(&mut self, window: TimeWindow) -> Result<(), EngineError> {
        window
            .slot
            .validate()
            .map_err(|msg| EngineError::InvalidWindow(format!("{}: {msg}", window.slot)))?;
        match self.position(&window.slot) {
            Ok(i) => {
                let booked = self.windows[i].booked;
                self.windows[i] = TimeWindow { booked, ..window };
            }
            Err(i) => {
                if self.windows.len() >= MAX_WINDOWS_PER_USER {
                    return Err(EngineError::LimitExceeded("too many availability windows"));
                }
                self.windows.insert(i, window);
            }
        }
        Ok(())
    }

    /// Remove an unbooked window.
    pub fn remove(&mut self, slot: &Slot) -> Result<TimeWindow, EngineError> {
        let i = self
            .position(slot)
            .map_err(|_| EngineError::SlotUnavailable(slot.to_string()))?;
        if self.windows[i].booked {
            return Err(EngineError::WindowBooked(slot.to_string()));
        }
        Ok(self.windows.remove(i))
    }

    /// Set the booked flag on a slot, creating the window if it is missing.
    /// Returns true if the store changed.
    pub fn set_booked(&mut self, slot: &Slot, booked: bool) -> bool {
        match self.position(slot) {
            Ok(i) => {
                let changed = self.windows[i].booked != booked;
                self.windows[i].booked = booked;
                changed
            }
            Err(_) if !booked => false,
            Err(i) => {
                self.windows.insert(
                    i,
                    TimeWindow {
                        slot: slot.clone(),
                        booked: true,
                    },
                );
                true
            }
        }
    }

    /// Recompute booked flags from `user`'s appointment history.
    ///
    /// Every slot of an appointment `user` attends ends up present and booked
    /// (history slots missing from declared availability are added); every other
    /// window is unbooked. Windows are never deleted. Returns true if the store changed.
    pub fn reconcile<'a, I>(&mut self, user: UserId, appointments: I) -> bool
    where
        I: IntoIterator<Item = &'a Appointment>,
    {
        let mut booked: Vec<&Slot> = appointments
            .into_iter()
            .filter(|a| a.attendees.contains(user))
            .map(|a| &a.time)
            .collect();
        booked.sort_by(|a, b| a.cmp_identity(b));
        booked.dedup_by(|a, b| a.equals(b));

        let mut changed = false;
        for slot in &booked {
            if let Err(i) = self.position(slot) {
                self.windows.insert(
                    i,
                    TimeWindow {
                        slot: (*slot).clone(),
                        booked: true,
                    },
                );
                changed = true;
            }
        }

        for window in &mut self.windows {
            let should_be_booked = booked
                .binary_search_by(|s| s.cmp_identity(&window.slot))
                .is_ok();
            if window.booked != should_be_booked {
                window.booked = should_be_booked;
                changed = true;
            }
        }
        changed
    }
}
