//! Types for PICC lock tracking

use std::fmt;

/// Maximum identifier length for ISO 14443-3 type A cards (triple-size UID).
pub const MAX_UID_BYTES: usize = 10;

/// Unique identifier of a PICC, 4, 7 or 10 bytes for this chip family.
///
/// Logically empty (`len() == 0`) whenever no card is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uid {
    bytes: [u8; MAX_UID_BYTES],
    len: usize,
}

impl Uid {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut uid = Self::default();
        uid.set(bytes);
        uid
    }

    /// Overwrite the identifier. Input longer than [`MAX_UID_BYTES`] is truncated.
    pub fn set(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(MAX_UID_BYTES);
        self.bytes[..n].copy_from_slice(&bytes[..n]);
        self.bytes[n..].fill(0);
        self.len = n;
    }

    /// Reset to the empty identifier, zeroing any stale bytes.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
        self.len = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of identifier bits already confirmed by a successful selection.
    pub fn known_bits(&self) -> u8 {
        (self.len * 8) as u8
    }
}

/// Whether a wakeup probe found any card in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

/// Outcome of a selection attempt, as reported by the reader driver.
///
/// The controller only cares about the [`is_ok`](Status::is_ok) partition;
/// the full taxonomy exists so failure reasons stay observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Generic communication error.
    Error,
    Collision,
    Timeout,
    /// A buffer was too small for the card's response.
    NoRoom,
    Invalid,
    CrcWrong,
    MifareNack,
    Internal,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Human-readable diagnostic name for this status.
    pub fn reason_text(self) -> &'static str {
        match self {
            Status::Ok => "Success",
            Status::Error => "Error in communication",
            Status::Collision => "Collision detected",
            Status::Timeout => "Timeout in communication",
            Status::NoRoom => "A buffer is not big enough",
            Status::Invalid => "Invalid argument",
            Status::CrcWrong => "The CRC_A does not match",
            Status::MifareNack => "A MIFARE PICC responded with NAK",
            Status::Internal => "Internal error in the code",
        }
    }
}

/// A lock-state transition reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// A card was selected and is now locked.
    Locked { uid: Uid },
    /// The locked card stopped answering and was released.
    Unlocked { reason: &'static str },
}

impl fmt::Display for LockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockEvent::Locked { uid } => {
                write!(f, "locked! NUID tag: {}", hex_dump(uid.as_bytes()))
            }
            LockEvent::Unlocked { reason } => {
                write!(f, "unlocked! Reason for unlocking: {}", reason)
            }
        }
    }
}

/// Render bytes as uppercase two-digit hex, each byte followed by a space.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X} ", b)).collect()
}
