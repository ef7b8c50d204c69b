use std::error::Error;
use std::thread;
use std::time::Duration;

use log::info;
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use picc_lock::{LockController, Mfrc522Reader};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_000_000, Mode::Mode0)?;
    let mut reader = Mfrc522Reader::new(spi);
    reader.init()?;
    info!("reader chip version: {:#04x}", reader.version()?);

    let mut controller = LockController::new(reader);
    loop {
        if let Some(event) = controller.tick() {
            println!("{}", event);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
