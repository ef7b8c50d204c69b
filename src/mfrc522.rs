//! MFRC522 reader backend over SPI using the rppal crate

use std::time::{Duration, Instant};

use log::{debug, warn};
use rppal::spi::Spi;
use thiserror::Error;

use crate::driver::ReaderDriver;
use crate::types::{Presence, Status, Uid};

// Upper bound on any single bus transaction, in case the chip timer never fires
const SAFETY_TIMEOUT: Duration = Duration::from_millis(50);
// Largest frame the selection procedure ever reads back
const MAX_RX_BYTES: usize = 8;

// ComIrqReg bits (section 9.3.1.5 of the datasheet)
const RX_IRQ: u8 = 0x20;
const IDLE_IRQ: u8 = 0x10;
const ERR_IRQ: u8 = 0x02;
const TIMER_IRQ: u8 = 0x01;
// DivIrqReg bit
const CRC_IRQ: u8 = 0x04;
// CommandReg bit
const POWER_DOWN: u8 = 0x10;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Register {
    CommandReg = 0x01,
    ComIrqReg = 0x04,
    DivIrqReg = 0x05,
    ErrorReg = 0x06,
    FifoDataReg = 0x09,
    FifoLevelReg = 0x0A,
    ControlReg = 0x0C,
    BitFramingReg = 0x0D,
    CollReg = 0x0E,
    ModeReg = 0x11,
    TxModeReg = 0x12,
    RxModeReg = 0x13,
    TxControlReg = 0x14,
    TxAskReg = 0x15,
    CrcResultRegHigh = 0x21,
    CrcResultRegLow = 0x22,
    ModWidthReg = 0x24,
    TModeReg = 0x2A,
    TPrescalerReg = 0x2B,
    TReloadRegHigh = 0x2C,
    TReloadRegLow = 0x2D,
    VersionReg = 0x37,
}

#[derive(Clone, Copy)]
#[repr(u8)]
enum Command {
    Idle = 0x00,
    CalcCrc = 0x03,
    Transceive = 0x0C,
    SoftReset = 0x0F,
}

/// ISO 14443-3 type A card commands
mod picc {
    pub const WUPA: u8 = 0x52;
    pub const CASCADE_TAG: u8 = 0x88;
    pub const SEL_CL1: u8 = 0x93;
    pub const SEL_CL2: u8 = 0x95;
    pub const SEL_CL3: u8 = 0x97;
    pub const HLTA: u8 = 0x50;
}

/// Errors raised by the MFRC522 register-level driver
#[derive(Debug, Error)]
pub enum Mfrc522Error {
    #[error("SPI bus error: {0}")]
    Spi(#[from] rppal::spi::Error),
    #[error("timeout waiting for the card")]
    Timeout,
    #[error("bit collision during anticollision")]
    Collision,
    #[error("CRC check failed")]
    Crc,
    #[error("parity error on the RF interface")]
    Parity,
    #[error("SOF or protocol error on the RF interface")]
    Protocol,
    #[error("FIFO buffer overflow")]
    BufferOverflow,
    #[error("card answered NAK")]
    Nak,
    #[error("truncated frame from the card")]
    IncompleteFrame,
    #[error("selection cascade ran out of levels")]
    Internal,
}

impl From<Mfrc522Error> for Status {
    fn from(err: Mfrc522Error) -> Self {
        match err {
            Mfrc522Error::Timeout => Status::Timeout,
            Mfrc522Error::Collision => Status::Collision,
            Mfrc522Error::Crc => Status::CrcWrong,
            Mfrc522Error::Nak => Status::MifareNack,
            Mfrc522Error::BufferOverflow => Status::NoRoom,
            Mfrc522Error::Internal => Status::Internal,
            Mfrc522Error::Spi(_)
            | Mfrc522Error::Parity
            | Mfrc522Error::Protocol
            | Mfrc522Error::IncompleteFrame => Status::Error,
        }
    }
}

/// Received frame pulled out of the chip FIFO
#[derive(Default)]
struct FifoData {
    buffer: [u8; MAX_RX_BYTES],
    /// Number of valid bytes in `buffer`
    valid_bytes: usize,
    /// Number of valid bits in the last byte, 0 meaning all 8
    valid_bits: usize,
}

impl FifoData {
    /// Append received bits to a partially filled destination buffer,
    /// assuming the chip aligned the first received bit to the current
    /// known-bit position (RxAlign).
    fn copy_bits_to(&self, dst: &mut [u8], dst_valid_bits: u8) {
        if self.valid_bytes == 0 {
            return;
        }
        let dst_valid_last_bits = dst_valid_bits % 8;
        let mask: u8 = 0xFF << dst_valid_last_bits;
        let mut idx = (dst_valid_bits / 8) as usize;
        dst[idx] = (self.buffer[0] & mask) | (dst[idx] & !mask);
        idx += 1;
        let len = (self.valid_bytes - 1).min(dst.len().saturating_sub(idx));
        if len > 0 {
            dst[idx..idx + len].copy_from_slice(&self.buffer[1..=len]);
        }
    }
}

/// MFRC522 driver over a configured SPI bus.
///
/// Call [`init`](Mfrc522Reader::init) once before the first card operation.
pub struct Mfrc522Reader {
    spi: Spi,
}

impl Mfrc522Reader {
    pub fn new(spi: Spi) -> Self {
        Self { spi }
    }

    /// Soft-reset the chip and configure the timeout timer, modulation and
    /// antenna. Register values follow sections 9.3.2 and 9.3.3 of the
    /// datasheet.
    pub fn init(&mut self) -> Result<(), Mfrc522Error> {
        self.command(Command::SoftReset)?;
        let deadline = Instant::now() + SAFETY_TIMEOUT;
        // The PowerDown bit clears once the oscillator is back up
        while self.read(Register::CommandReg)? & POWER_DOWN != 0 {
            if Instant::now() > deadline {
                return Err(Mfrc522Error::Timeout);
            }
        }

        // Timer starts automatically at the end of every transmission;
        // prescaler 0xA9 gives a 40kHz tick, reload 0x3E8 a 25ms timeout
        self.write(Register::TModeReg, 0x80)?;
        self.write(Register::TPrescalerReg, 0xA9)?;
        self.write(Register::TReloadRegHigh, 0x03)?;
        self.write(Register::TReloadRegLow, 0xE8)?;

        // Force 100% ASK modulation
        self.write(Register::TxAskReg, 0x40)?;
        // CRC coprocessor preset 0x6363 per ISO 14443-3 part 6.2.4
        self.write(Register::ModeReg, 0x3D)?;
        // Output the 13.56MHz carrier on TX1 and TX2
        self.rmw(Register::TxControlReg, |b| b | 0x03)?;
        Ok(())
    }

    /// Chip version as reported by VersionReg, expected 0x91 or 0x92.
    pub fn version(&mut self) -> Result<u8, Mfrc522Error> {
        self.read(Register::VersionReg)
    }

    fn restore_defaults(&mut self) -> Result<(), Mfrc522Error> {
        self.write(Register::TxModeReg, 0x00)?;
        self.write(Register::RxModeReg, 0x00)?;
        self.write(Register::ModWidthReg, 0x26)?;
        Ok(())
    }

    /// Wake Up type A, a 7-bit short frame. Returns the ATQA on success.
    fn wupa(&mut self) -> Result<[u8; 2], Mfrc522Error> {
        let fifo = self.transceive(&[picc::WUPA], 7, 0, 2)?;
        if fifo.valid_bytes != 2 || fifo.valid_bits != 0 {
            return Err(Mfrc522Error::IncompleteFrame);
        }
        Ok([fifo.buffer[0], fifo.buffer[1]])
    }

    /// Halt type A. The standard says any response within 1ms is a NAK, so
    /// only a timeout counts as success here.
    fn hlta(&mut self) -> Result<(), Mfrc522Error> {
        let mut tx = [picc::HLTA, 0x00, 0, 0];
        let crc = self.calculate_crc(&tx[..2])?;
        tx[2..].copy_from_slice(&crc);

        match self.transceive(&tx, 0, 0, 0) {
            Err(Mfrc522Error::Timeout) => Ok(()),
            Ok(_) => Err(Mfrc522Error::Nak),
            Err(e) => Err(e),
        }
    }

    /// Anticollision/selection cascade. Confirmed identifier bytes are
    /// written through `uid` as each cascade level completes, so a failure
    /// partway can leave partial data behind.
    fn select_inner(&mut self, uid: &mut Uid, known_bits: u8) -> Result<(), Mfrc522Error> {
        // Accept all received bits after a collision (ValuesAfterColl=0)
        self.rmw(Register::CollReg, |b| b & !0x80)?;

        let known = uid.as_bytes().to_vec();
        let use_known = known_bits > 0;

        let mut uid_bytes = [0u8; crate::types::MAX_UID_BYTES];
        let mut uid_len = 0usize;
        let mut cascade = 0u8;

        loop {
            let sel_cmd = match cascade {
                0 => picc::SEL_CL1,
                1 => picc::SEL_CL2,
                2 => picc::SEL_CL3,
                _ => return Err(Mfrc522Error::Internal),
            };

            // tx holds SEL, NVB, 4 identifier bytes, BCC, CRC_A
            let mut tx = [0u8; 9];
            tx[0] = sel_cmd;

            // If the identifier bytes for this level are already known,
            // skip straight to the SELECT; levels below the last carry a
            // cascade tag in place of the first byte.
            let level = if use_known && known.len() > uid_len {
                let remaining = &known[uid_len..];
                if remaining.len() > 4 {
                    Some([picc::CASCADE_TAG, remaining[0], remaining[1], remaining[2]])
                } else if remaining.len() == 4 {
                    Some([remaining[0], remaining[1], remaining[2], remaining[3]])
                } else {
                    None
                }
            } else {
                None
            };

            if let Some(level) = level {
                tx[2..6].copy_from_slice(&level);
            } else {
                self.anticollision(&mut tx)?;
            }

            // SELECT: NVB says 7 whole bytes, then BCC and CRC_A
            tx[1] = 0x70;
            tx[6] = tx[2] ^ tx[3] ^ tx[4] ^ tx[5];
            let crc = self.calculate_crc(&tx[..7])?;
            tx[7..].copy_from_slice(&crc);

            let rx = self.transceive(&tx, 0, 0, 3)?;
            if rx.valid_bytes != 3 || rx.valid_bits != 0 {
                return Err(Mfrc522Error::IncompleteFrame);
            }
            let sak = rx.buffer[0];
            let crc_verify = self.calculate_crc(&rx.buffer[..1])?;
            if rx.buffer[1..3] != crc_verify {
                return Err(Mfrc522Error::Crc);
            }

            if sak & 0x04 != 0 {
                // Cascade bit set: tx[2] was the cascade tag, three more
                // identifier bytes confirmed, at least one level to go
                uid_bytes[uid_len..uid_len + 3].copy_from_slice(&tx[3..6]);
                uid_len += 3;
                uid.set(&uid_bytes[..uid_len]);
                cascade += 1;
            } else {
                uid_bytes[uid_len..uid_len + 4].copy_from_slice(&tx[2..6]);
                uid_len += 4;
                uid.set(&uid_bytes[..uid_len]);
                return Ok(());
            }
        }
    }

    /// Run the anticollision loop for one cascade level, filling `tx[2..7]`
    /// with the level's 4 identifier bytes plus BCC. The loop only
    /// continues while each collision advances the known-bit count.
    fn anticollision(&mut self, tx: &mut [u8; 9]) -> Result<(), Mfrc522Error> {
        let mut level_bits: u8 = 0;

        // ISO 14443-3 bounds the loop at 32 iterations per level
        for _ in 0..32 {
            let tx_last_bits = level_bits % 8;
            let tx_bytes = 2 + level_bits / 8;
            let end = tx_bytes as usize + usize::from(tx_last_bits > 0);
            tx[1] = (tx_bytes << 4) + tx_last_bits;

            // Send only `tx_last_bits` of the last byte and have the chip
            // align the first received bit right after them, so the
            // response can be merged straight into tx
            match self.transceive(&tx[..end], tx_last_bits, tx_last_bits, 5) {
                Ok(fifo) => {
                    fifo.copy_bits_to(&mut tx[2..=6], level_bits);
                    return Ok(());
                }
                Err(Mfrc522Error::Collision) => {
                    let coll = self.read(Register::CollReg)?;
                    let Some(coll_pos) = collision_position(coll, level_bits) else {
                        return Err(Mfrc522Error::Collision);
                    };
                    let fifo = self.fifo_data(5)?;
                    fifo.copy_bits_to(&mut tx[2..=6], level_bits);
                    level_bits = coll_pos;

                    // Continue with the colliding bit forced to 1
                    let check_bit = (level_bits - 1) % 8;
                    let index =
                        1 + (level_bits / 8) as usize + usize::from(level_bits % 8 != 0);
                    tx[index] |= 1 << check_bit;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Mfrc522Error::Collision)
    }

    /// Transmit `tx` and receive the card's response through the FIFO.
    fn transceive(
        &mut self,
        tx: &[u8],
        tx_last_bits: u8,
        rx_align_bits: u8,
        max_rx: usize,
    ) -> Result<FifoData, Mfrc522Error> {
        self.command(Command::Idle)?;
        // Clear all interrupt flags and flush the FIFO
        self.write(Register::ComIrqReg, 0x7F)?;
        self.write(Register::FifoLevelReg, 0x80)?;
        for &b in tx {
            self.write(Register::FifoDataReg, b)?;
        }
        self.command(Command::Transceive)?;
        // StartSend plus framing for partial bytes
        self.write(
            Register::BitFramingReg,
            0x80 | ((rx_align_bits & 0x07) << 4) | (tx_last_bits & 0x07),
        )?;

        let deadline = Instant::now() + SAFETY_TIMEOUT;
        loop {
            let irq = self.read(Register::ComIrqReg)?;
            if irq & (RX_IRQ | IDLE_IRQ | ERR_IRQ) != 0 {
                break;
            }
            if irq & TIMER_IRQ != 0 || Instant::now() > deadline {
                return Err(Mfrc522Error::Timeout);
            }
        }

        self.check_error_register()?;
        self.fifo_data(max_rx)
    }

    fn fifo_data(&mut self, max_rx: usize) -> Result<FifoData, Mfrc522Error> {
        let mut data = FifoData::default();
        if max_rx == 0 {
            return Ok(data);
        }
        let level = self.read(Register::FifoLevelReg)? as usize;
        if level > max_rx || level > data.buffer.len() {
            return Err(Mfrc522Error::BufferOverflow);
        }
        for slot in &mut data.buffer[..level] {
            *slot = self.read(Register::FifoDataReg)?;
        }
        data.valid_bytes = level;
        data.valid_bits = (self.read(Register::ControlReg)? & 0x07) as usize;
        Ok(data)
    }

    fn check_error_register(&mut self) -> Result<(), Mfrc522Error> {
        let err = self.read(Register::ErrorReg)?;
        if err & 0x08 != 0 {
            Err(Mfrc522Error::Collision)
        } else if err & 0x04 != 0 {
            Err(Mfrc522Error::Crc)
        } else if err & 0x02 != 0 {
            Err(Mfrc522Error::Parity)
        } else if err & 0x01 != 0 {
            Err(Mfrc522Error::Protocol)
        } else if err & 0x10 != 0 {
            Err(Mfrc522Error::BufferOverflow)
        } else {
            Ok(())
        }
    }

    /// Run the chip's CRC coprocessor over `data`, returning CRC_A low byte
    /// first, as it goes on the wire.
    fn calculate_crc(&mut self, data: &[u8]) -> Result<[u8; 2], Mfrc522Error> {
        self.command(Command::Idle)?;
        self.write(Register::DivIrqReg, CRC_IRQ)?;
        self.write(Register::FifoLevelReg, 0x80)?;
        for &b in data {
            self.write(Register::FifoDataReg, b)?;
        }
        self.command(Command::CalcCrc)?;

        let deadline = Instant::now() + SAFETY_TIMEOUT;
        while Instant::now() < deadline {
            if self.read(Register::DivIrqReg)? & CRC_IRQ != 0 {
                self.command(Command::Idle)?;
                return Ok([
                    self.read(Register::CrcResultRegLow)?,
                    self.read(Register::CrcResultRegHigh)?,
                ]);
            }
        }
        Err(Mfrc522Error::Timeout)
    }

    fn command(&mut self, cmd: Command) -> Result<(), Mfrc522Error> {
        self.write(Register::CommandReg, cmd as u8)
    }

    fn rmw(
        &mut self,
        reg: Register,
        func: impl FnOnce(u8) -> u8,
    ) -> Result<(), Mfrc522Error> {
        let value = self.read(reg)?;
        self.write(reg, func(value))
    }

    // Register access over SPI per section 8.1.2 of the datasheet: the
    // address byte carries the register in bits 6..1, MSB set for reads

    fn write(&mut self, reg: Register, value: u8) -> Result<(), Mfrc522Error> {
        self.spi.write(&[((reg as u8) << 1) & 0x7E, value])?;
        Ok(())
    }

    fn read(&mut self, reg: Register) -> Result<u8, Mfrc522Error> {
        let tx = [(((reg as u8) << 1) & 0x7E) | 0x80, 0];
        let mut rx = [0u8; 2];
        self.spi.transfer(&mut rx, &tx)?;
        Ok(rx[1])
    }
}

/// Decode CollReg after a collision: the new known-bit count for the
/// level, or None when the position is invalid or would not advance past
/// the bits already resolved.
fn collision_position(coll: u8, level_bits: u8) -> Option<u8> {
    if coll & (1 << 5) != 0 {
        // CollPosNotValid
        return None;
    }
    let mut coll_pos = coll & 0x1F;
    if coll_pos == 0 {
        coll_pos = 32;
    }
    if coll_pos <= level_bits {
        return None;
    }
    Some(coll_pos)
}

impl ReaderDriver for Mfrc522Reader {
    fn reset_transceiver_defaults(&mut self) {
        if let Err(e) = self.restore_defaults() {
            warn!("failed to restore transceiver defaults: {}", e);
        }
    }

    fn probe_any_card(&mut self) -> Presence {
        self.reset_transceiver_defaults();
        match self.wupa() {
            Ok(_) | Err(Mfrc522Error::Collision) => Presence::Present,
            Err(e) => {
                debug!("wakeup probe: {}", e);
                Presence::Absent
            }
        }
    }

    fn select_card(&mut self, uid: &mut Uid, known_bits: u8) -> Status {
        match self.select_inner(uid, known_bits) {
            Ok(()) => Status::Ok,
            Err(e) => {
                debug!("selection failed: {}", e);
                e.into()
            }
        }
    }

    fn halt_card(&mut self) {
        if let Err(e) = self.hlta() {
            debug!("halt: {}", e);
        }
    }
}
