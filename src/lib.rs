//! Lock-state tracking for contactless cards (PICCs) on an MFRC522 reader.
//!
//! The controller polls the reader for card presence, locks onto the first
//! card it can select and reports lock/unlock transitions together with the
//! card's NUID. The reader chip sits behind the [`ReaderDriver`] trait.
//!
//! # Features
//!
//! - `rpi` - SPI reader backend for Raspberry Pi using the rppal crate
//!
//! # Example
//!
//! ```ignore
//! use picc_lock::{LockController, Mfrc522Reader};
//! use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
//!
//! let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_000_000, Mode::Mode0)?;
//! let mut reader = Mfrc522Reader::new(spi);
//! reader.init()?;
//!
//! let mut controller = LockController::new(reader);
//! loop {
//!     if let Some(event) = controller.tick() {
//!         println!("{}", event);
//!     }
//! }
//! ```

mod controller;
mod driver;
mod types;

#[cfg(feature = "rpi")]
mod mfrc522;

// Re-exports
pub use controller::LockController;
pub use driver::ReaderDriver;
pub use types::{LockEvent, Presence, Status, Uid, MAX_UID_BYTES};

#[cfg(feature = "rpi")]
pub use mfrc522::{Mfrc522Error, Mfrc522Reader};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted outcome for one `select_card` call
    enum SelectScript {
        /// Selection succeeds and writes this identifier
        Ok(&'static [u8]),
        /// Selection fails cleanly
        Fail(Status),
        /// Selection fails after writing a partial identifier
        FailWithGarbage(Status, &'static [u8]),
    }

    /// Mock driver that replays scripted outcomes and records every call
    struct MockDriver {
        probes: VecDeque<Presence>,
        selects: VecDeque<SelectScript>,
        probe_calls: usize,
        select_known_bits: Vec<u8>,
        halt_calls: usize,
        reset_calls: usize,
    }

    impl MockDriver {
        fn new(probes: &[Presence], selects: Vec<SelectScript>) -> Self {
            Self {
                probes: probes.iter().copied().collect(),
                selects: selects.into_iter().collect(),
                probe_calls: 0,
                select_known_bits: Vec::new(),
                halt_calls: 0,
                reset_calls: 0,
            }
        }
    }

    impl ReaderDriver for MockDriver {
        fn reset_transceiver_defaults(&mut self) {
            self.reset_calls += 1;
        }

        fn probe_any_card(&mut self) -> Presence {
            self.probe_calls += 1;
            self.probes.pop_front().unwrap_or(Presence::Absent)
        }

        fn select_card(&mut self, uid: &mut Uid, known_bits: u8) -> Status {
            self.select_known_bits.push(known_bits);
            match self.selects.pop_front().unwrap_or(SelectScript::Fail(Status::Timeout)) {
                SelectScript::Ok(bytes) => {
                    uid.set(bytes);
                    Status::Ok
                }
                SelectScript::Fail(status) => status,
                SelectScript::FailWithGarbage(status, junk) => {
                    uid.set(junk);
                    status
                }
            }
        }

        fn halt_card(&mut self) {
            self.halt_calls += 1;
        }
    }

    const NUID: &[u8] = &[0x04, 0xA2, 0x3B, 0x9C];

    // ===================
    // tick scenario tests
    // ===================

    #[test]
    fn test_empty_field_is_a_quiet_tick() {
        let driver = MockDriver::new(&[Presence::Absent], vec![]);
        let mut controller = LockController::new(driver);

        assert_eq!(controller.tick(), None);
        assert!(!controller.is_locked());
        assert!(controller.uid().is_empty());
        // The expensive selection procedure and the halt were skipped
        assert!(controller.driver().select_known_bits.is_empty());
        assert_eq!(controller.driver().halt_calls, 0);
    }

    #[test]
    fn test_new_card_locks_and_reports_uid() {
        let driver = MockDriver::new(&[Presence::Present], vec![SelectScript::Ok(NUID)]);
        let mut controller = LockController::new(driver);

        let event = controller.tick().unwrap();
        assert_eq!(event.to_string(), "locked! NUID tag: 04 A2 3B 9C ");
        assert!(controller.is_locked());
        assert_eq!(controller.uid().as_bytes(), NUID);
        assert_eq!(controller.driver().halt_calls, 1);
    }

    #[test]
    fn test_seven_byte_uid_hex_dump_in_event() {
        let uid: &[u8] = &[0x04, 0xA2, 0x3B, 0x9C, 0x11, 0x22, 0x33];
        let driver = MockDriver::new(&[Presence::Present], vec![SelectScript::Ok(uid)]);
        let mut controller = LockController::new(driver);

        let event = controller.tick().unwrap();
        assert_eq!(event.to_string(), "locked! NUID tag: 04 A2 3B 9C 11 22 33 ");
    }

    #[test]
    fn test_removed_card_unlocks_with_reason() {
        let driver = MockDriver::new(
            &[Presence::Present],
            vec![SelectScript::Ok(NUID), SelectScript::Fail(Status::Timeout)],
        );
        let mut controller = LockController::new(driver);

        controller.tick();
        let event = controller.tick().unwrap();
        assert_eq!(
            event.to_string(),
            "unlocked! Reason for unlocking: Timeout in communication"
        );
        assert!(!controller.is_locked());
        assert!(controller.uid().is_empty());
    }

    #[test]
    fn test_failed_select_while_unlocked_clears_partial_uid() {
        let driver = MockDriver::new(
            &[Presence::Present],
            vec![SelectScript::FailWithGarbage(
                Status::CrcWrong,
                &[0xDE, 0xAD],
            )],
        );
        let mut controller = LockController::new(driver);

        assert_eq!(controller.tick(), None);
        assert!(!controller.is_locked());
        // The garbage bytes written during the failed attempt are gone
        assert!(controller.uid().is_empty());
        assert_eq!(controller.uid().as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn test_locked_reselect_is_idempotent() {
        let driver = MockDriver::new(
            &[Presence::Present],
            vec![
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
            ],
        );
        let mut controller = LockController::new(driver);

        assert!(controller.tick().is_some());
        for _ in 0..3 {
            assert_eq!(controller.tick(), None);
            assert!(controller.is_locked());
            assert_eq!(controller.uid().as_bytes(), NUID);
        }
    }

    #[test]
    fn test_second_card_invisible_while_locked() {
        // While locked, the driver keeps reconfirming the locked card; a
        // second card in the field never reaches the controller
        let driver = MockDriver::new(
            &[Presence::Present],
            vec![
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
            ],
        );
        let mut controller = LockController::new(driver);

        controller.tick();
        controller.tick();
        controller.tick();
        assert!(controller.is_locked());
        assert_eq!(controller.uid().as_bytes(), NUID);
        // The presence probe only ran on the initial unlocked tick
        assert_eq!(controller.driver().probe_calls, 1);
    }

    #[test]
    fn test_known_bits_track_uid_length() {
        let driver = MockDriver::new(
            &[Presence::Present, Presence::Present],
            vec![
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
                SelectScript::Fail(Status::Timeout),
                SelectScript::Fail(Status::Error),
            ],
        );
        let mut controller = LockController::new(driver);

        controller.tick(); // locks, selected with nothing known
        controller.tick(); // reconfirms all 32 bits
        controller.tick(); // removal check still passes the full identifier
        controller.tick(); // back to selecting any card
        assert_eq!(controller.driver().select_known_bits, vec![0, 32, 32, 0]);
    }

    #[test]
    fn test_halt_follows_every_select_attempt() {
        let driver = MockDriver::new(
            &[Presence::Absent, Presence::Present, Presence::Absent],
            vec![
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
                SelectScript::Fail(Status::Timeout),
            ],
        );
        let mut controller = LockController::new(driver);

        controller.tick(); // empty field, no select, no halt
        controller.tick(); // locks
        controller.tick(); // still locked
        controller.tick(); // unlocks, halt still issued after the transition
        controller.tick(); // empty field again
        assert_eq!(controller.driver().select_known_bits.len(), 3);
        assert_eq!(controller.driver().halt_calls, 3);
    }

    #[test]
    fn test_uid_nonempty_only_while_locked() {
        let driver = MockDriver::new(
            &[
                Presence::Absent,
                Presence::Present,
                Presence::Present,
                Presence::Present,
            ],
            vec![
                SelectScript::FailWithGarbage(Status::Collision, &[0x01]),
                SelectScript::Ok(NUID),
                SelectScript::Fail(Status::Timeout),
                SelectScript::Ok(NUID),
                SelectScript::Ok(NUID),
            ],
        );
        let mut controller = LockController::new(driver);

        for _ in 0..6 {
            controller.tick();
            assert_eq!(controller.uid().is_empty(), !controller.is_locked());
        }
    }

    #[test]
    fn test_probe_resets_are_left_to_the_driver() {
        // The controller never calls reset_transceiver_defaults directly;
        // that ordering belongs to the driver's probe implementation
        let driver = MockDriver::new(&[Presence::Absent], vec![]);
        let mut controller = LockController::new(driver);

        controller.tick();
        assert_eq!(controller.driver().reset_calls, 0);
    }

    // ===================
    // Uid tests
    // ===================

    #[test]
    fn test_uid_set_and_clear() {
        let mut uid = Uid::from_bytes(NUID);
        assert_eq!(uid.len(), 4);
        assert_eq!(uid.known_bits(), 32);

        uid.clear();
        assert!(uid.is_empty());
        assert_eq!(uid.known_bits(), 0);
        assert_eq!(uid.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn test_uid_set_truncates_overlong_input() {
        let uid = Uid::from_bytes(&[0xAB; 12]);
        assert_eq!(uid.len(), MAX_UID_BYTES);
    }

    #[test]
    fn test_uid_set_drops_stale_tail() {
        let mut uid = Uid::from_bytes(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]);
        uid.set(NUID);
        assert_eq!(uid.as_bytes(), NUID);
    }

    // ===================
    // Status tests
    // ===================

    #[test]
    fn test_status_partition() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Timeout.is_ok());
        assert!(!Status::Collision.is_ok());
        assert!(!Status::Error.is_ok());
    }

    #[test]
    fn test_status_reason_text() {
        assert_eq!(Status::Timeout.reason_text(), "Timeout in communication");
        assert_eq!(Status::CrcWrong.reason_text(), "The CRC_A does not match");
        assert_eq!(
            Status::MifareNack.reason_text(),
            "A MIFARE PICC responded with NAK"
        );
        assert_eq!(Status::Collision.reason_text(), "Collision detected");
    }

    // ===================
    // LockEvent tests
    // ===================

    #[test]
    fn test_event_display_shapes() {
        let locked = LockEvent::Locked {
            uid: Uid::from_bytes(&[0x00, 0x0A, 0xFF]),
        };
        assert_eq!(locked.to_string(), "locked! NUID tag: 00 0A FF ");

        let unlocked = LockEvent::Unlocked {
            reason: Status::Error.reason_text(),
        };
        assert_eq!(
            unlocked.to_string(),
            "unlocked! Reason for unlocking: Error in communication"
        );
    }
}
