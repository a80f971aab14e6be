/// Credential vault logics
///
/// The flash area splits into a reserved pad region (PIN indirection, see
/// secrets) and a data region of encrypted one-record blocks (see db).
/// Vault ties the flash driver, the secret manager, the PIN guard and the
/// database together; nothing here is global state.
pub use flash_driver;
use anyhow::anyhow;
use flash_driver::FlashDriver;
use log::*;

pub mod block;
pub mod crypt;
pub mod db;
pub mod error;
pub mod otp;
pub mod pin;
pub mod secrets;
pub mod settings;
pub mod span;

pub use db::{Db, DbEntry, DbField, DbStats, FieldType, MAX_NAME_LEN, MAX_SECRET_LEN, MAX_STRING_LEN};
pub use error::{Error, Result};
pub use settings::Settings;

pub use flash_driver::BLOCK_SIZE;
/// Nonce bytes at the start of every block
pub const NONCE_SIZE: usize = 24;
/// Poly1305 tag at the end of the ciphertext
pub const TAG_SIZE: usize = 16;
/// Type, reserved and sequence bytes of the content cleartext
pub const HEADER_SIZE: usize = 4;
/// Cleartext bytes sealed into one block
pub const CONTENT_SIZE: usize = BLOCK_SIZE - NONCE_SIZE - TAG_SIZE;
/// Record payload capacity
pub const PAYLOAD_SIZE: usize = CONTENT_SIZE - HEADER_SIZE;

pub const MASTER_SECRET_BYTES: usize = 32;
/// Erase groups reserved for pad blocks at the start of the flash
pub const PAD_GROUPS: usize = 2;

/// Modular comparison of 16-bit sequence numbers: `new` wins iff
/// (new - old) mod 2^16 lies in [1, 2^15).
pub fn seq_newer(new: u16, old: u16) -> bool {
    let d = new.wrapping_sub(old);
    d >= 1 && d < 0x8000
}

use crypt::DbCrypt;
use pin::PinGuard;
use secrets::Secrets;

/// One handle owning the whole stack: flash, secrets, PIN state, database.
pub struct Vault {
    driver: Box<dyn FlashDriver>,
    secrets: Secrets,
    pin: PinGuard,
    pub db: Db,
}

impl Vault {
    pub fn new(driver: Box<dyn FlashDriver>, device_secret: [u8; MASTER_SECRET_BYTES]) -> Self {
        Self {
            driver,
            secrets: Secrets::new(device_secret),
            pin: PinGuard::new(),
            db: Db::new(),
        }
    }

    pub fn open_storage(&mut self, path: &str) -> Result<()> {
        self.driver.open(path).map_err(Error::Io)
    }

    /// True while no block of the flash has ever been programmed.
    pub fn is_erased(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        for n in 0..self.driver.block_count() {
            self.driver.read_block(n, &mut buf)?;
            if buf.iter().any(|b| *b != 0xff) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// First-time setup: create the pad for `pin` around a fresh random
    /// master key. Existing pads are wiped; the data region is untouched.
    pub fn set_pin(&mut self, pin: u32) -> Result<()> {
        self.secrets.init_new(self.driver.as_mut(), pin)?;
        self.pin.success();
        Ok(())
    }

    /// Derive the master key from the PIN via the pad. Wrong PINs count
    /// toward the cooldown; nothing reveals how close a guess was.
    pub fn login(&mut self, pin: u32) -> Result<()> {
        self.pin.check()?;
        match self.secrets.setup(self.driver.as_mut(), pin) {
            Ok(()) => {
                self.pin.success();
                Ok(())
            }
            Err(e) => {
                self.pin.fail();
                if !self.pin.cooldown().is_zero() {
                    info!("PIN cooldown: {} s", self.pin.cooldown().as_secs());
                }
                Err(e)
            }
        }
    }

    /// Atomic PIN change; the master key and the database stay as they are.
    pub fn change_pin(&mut self, old_pin: u32, new_pin: u32) -> Result<()> {
        self.pin.check()?;
        match self.secrets.change(self.driver.as_mut(), old_pin, new_pin) {
            Ok(()) => {
                self.pin.success();
                Ok(())
            }
            Err(Error::Crypto) => {
                self.pin.fail();
                Err(Error::Crypto)
            }
            Err(e) => Err(e),
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.pin.attempts()
    }

    pub fn cooldown(&self) -> std::time::Duration {
        self.pin.cooldown()
    }

    pub fn open(&mut self) -> Result<()> {
        let crypt = DbCrypt::new(self.secrets.master()?);
        let reserved = Secrets::reserved_blocks(self.driver.as_ref());
        self.db.open(self.driver.as_mut(), crypt, reserved, None)
    }

    /// Like `open`, reporting progress per scanned block for a UI.
    pub fn open_progress<F>(&mut self, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let crypt = DbCrypt::new(self.secrets.master()?);
        let reserved = Secrets::reserved_blocks(self.driver.as_ref());
        let progress: &mut dyn FnMut(usize, usize) = &mut progress;
        self.db
            .open(self.driver.as_mut(), crypt, reserved, Some(progress))
    }

    pub fn close(&mut self) {
        self.db.close();
        self.secrets.forget();
    }

    /// Erase the entire flash, pads included. A partial wipe would leave
    /// old records behind, so a block count that does not split into erase
    /// groups is refused rather than rounded down.
    pub fn erase_all(&mut self) -> Result<()> {
        self.close();
        let group = self.driver.erase_group_size();
        let total = self.driver.block_count();
        if total % group != 0 {
            return Err(Error::Io(anyhow!(
                "{} blocks do not split into erase groups of {}",
                total,
                group
            )));
        }
        self.driver.erase_blocks(0, total)?;
        Ok(())
    }

    // --- record API, exposed to the UI and remote control ---

    pub fn new_entry(&mut self, name: &str) -> Result<usize> {
        self.db.new_entry(self.driver.as_mut(), name)
    }

    pub fn mkdir(&mut self, name: &str) -> Result<usize> {
        self.db.mkdir(self.driver.as_mut(), name)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.db.find(name)
    }

    pub fn entry(&self, idx: usize) -> Option<&DbEntry> {
        self.db.entry(idx)
    }

    pub fn change_field(&mut self, idx: usize, ft: FieldType, data: &[u8]) -> Result<()> {
        self.db.change_field(self.driver.as_mut(), idx, ft, data)
    }

    pub fn delete_field(&mut self, idx: usize, ft: FieldType) -> Result<()> {
        self.db.delete_field(self.driver.as_mut(), idx, ft)
    }

    pub fn delete_entry(&mut self, idx: usize) -> Result<()> {
        self.db.delete_entry(self.driver.as_mut(), idx)
    }

    pub fn rename(&mut self, idx: usize, name: &str) -> Result<()> {
        self.db.rename(self.driver.as_mut(), idx, name)
    }

    pub fn move_after(&mut self, idx: usize, after: Option<usize>) -> Result<()> {
        self.db.move_after(self.driver.as_mut(), idx, after)
    }

    pub fn move_before(&mut self, idx: usize, before: Option<usize>) -> Result<()> {
        self.db.move_before(self.driver.as_mut(), idx, before)
    }

    pub fn defer_update(&mut self, idx: usize, defer: bool) -> Result<()> {
        self.db.defer_update(self.driver.as_mut(), idx, defer)
    }

    pub fn iterate<F>(&self, f: F) -> bool
    where
        F: FnMut(&DbEntry) -> bool,
    {
        self.db.iterate(f)
    }

    pub fn field_find(&self, idx: usize, ft: FieldType) -> Option<&DbField> {
        self.db.field_find(idx, ft)
    }

    pub fn stats(&self) -> DbStats {
        self.db.stats()
    }

    pub fn generation(&self) -> u64 {
        self.db.generation()
    }

    pub fn settings(&self) -> Settings {
        self.db.settings()
    }

    pub fn update_settings(&mut self, settings: Settings) -> Result<()> {
        self.db.update_settings(self.driver.as_mut(), settings)
    }
}
