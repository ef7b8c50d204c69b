use crate::types::{Presence, Status, Uid};

/// Capability surface of the reader-chip driver consumed by the controller.
/// Implement this trait for different reader backends (SPI chip, mock, etc.)
pub trait ReaderDriver {
    /// Restore the transceiver baud-rate and modulation-width registers to
    /// their defaults (transmit/receive mode 0x00, modulation width 0x26).
    ///
    /// Prior anticollision activity can leave the transceiver in a
    /// non-default state that causes false negatives on the next probe, so
    /// this must run before every wakeup.
    fn reset_transceiver_defaults(&mut self);

    /// Issue a wakeup-class command and report whether any card answered.
    /// A collision still means a card is present.
    fn probe_any_card(&mut self) -> Presence;

    /// Perform anticollision/selection. With `known_bits == 0` any card is
    /// selected and its identifier written through `uid`; otherwise the given
    /// identifier is reconfirmed. On failure `uid` may be left holding
    /// partial data; callers are expected to clear it.
    fn select_card(&mut self, uid: &mut Uid, known_bits: u8) -> Status;

    /// Halt the currently addressed card, returning it to the idle state.
    fn halt_card(&mut self);
}
