use log::debug;

use crate::driver::ReaderDriver;
use crate::types::{LockEvent, Presence, Status, Uid};

/// Tracks a single locked card across polling iterations.
///
/// Exactly one card can be locked at a time; any other card entering the
/// field while one is locked stays invisible until the locked card's
/// selection fails. That single-slot policy is deliberate.
pub struct LockController<D: ReaderDriver> {
    driver: D,
    locked: bool,
    uid: Uid,
}

impl<D: ReaderDriver> LockController<D> {
    /// Create a controller in the unlocked state with an empty identifier.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            locked: false,
            uid: Uid::default(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Identifier of the locked card; empty while unlocked.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run one polling iteration, returning a transition event if the lock
    /// state changed.
    ///
    /// While unlocked, a cheap wakeup probe gates the expensive selection
    /// procedure: no card in the field means the tick ends immediately.
    /// While locked, selection against the held identifier is the
    /// authoritative removal check and runs unconditionally. Whenever a
    /// selection was attempted, the addressed card is halted afterwards,
    /// whatever the outcome.
    pub fn tick(&mut self) -> Option<LockEvent> {
        if !self.locked && self.driver.probe_any_card() == Presence::Absent {
            return None;
        }

        let known_bits = self.uid.known_bits();
        let status = self.driver.select_card(&mut self.uid, known_bits);

        let event = match (self.locked, status) {
            (false, Status::Ok) => {
                self.locked = true;
                debug!("locked onto card {}", crate::types::hex_dump(self.uid.as_bytes()));
                Some(LockEvent::Locked { uid: self.uid })
            }
            (true, status) if !status.is_ok() => {
                self.locked = false;
                self.uid.clear();
                debug!("card left the field: {}", status.reason_text());
                Some(LockEvent::Unlocked {
                    reason: status.reason_text(),
                })
            }
            (false, status) if !status.is_ok() => {
                // The failed attempt may have written a partial identifier;
                // start the next probe from a clean slate.
                self.uid.clear();
                None
            }
            // Still locked to the same card.
            _ => None,
        };

        self.driver.halt_card();
        event
    }
}
