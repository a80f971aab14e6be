/// Master secret and related secrets
///
/// device_secret is stored in the device such that it cannot be retrieved by
/// an attacker and does not leak.
///
/// master_pattern is obtained by hashing the device secret with the PIN.
///
/// master_key is obtained by XOR-ing the master pattern with a (non-secret)
/// pad. The pad is recalculated each time the PIN - and thus the pattern -
/// changes, so that the master key remains the same and the database never
/// needs re-encryption.
use flash_driver::FlashDriver;
use log::*;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::x25519;
use zeroize::{Zeroize, Zeroizing};

use super::error::{Error, Result};
use super::{seq_newer, BLOCK_SIZE, MASTER_SECRET_BYTES, PAD_GROUPS};

/// Pad block layout: 16-bit sequence (LE) at offset 0, header padded with
/// 0xff up to offset 32, then (id[32], pad[32]) slots; the tail stays 0xff.
const SLOT_BASE: usize = MASTER_SECRET_BYTES;
const SLOT_SIZE: usize = 2 * MASTER_SECRET_BYTES;

#[derive(Zeroize)]
#[zeroize(drop)]
pub struct Secrets {
    device_secret: [u8; MASTER_SECRET_BYTES],
    master: [u8; MASTER_SECRET_BYTES],
    have_master: bool,
    pad_block: Option<usize>,
    pad_seq: u16,
}

fn hash(parts: &[&[u8]]) -> Zeroizing<[u8; 32]> {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    Zeroizing::new(h.finalize().into())
}

/// Scalar multiplication on Curve25519. Neither this nor the hash
/// concatenations commute; orderings follow the key derivation exactly.
fn mult(n: &[u8; 32], p: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(x25519(*n, *p))
}

/// Find the slot whose id matches, returning its byte offset.
fn find_slot(buf: &[u8], id: &[u8; 32]) -> Option<usize> {
    (SLOT_BASE..)
        .step_by(SLOT_SIZE)
        .take_while(|off| off + SLOT_SIZE <= BLOCK_SIZE)
        .find(|off| &buf[*off..off + 32] == id)
}

fn find_erased_slot(buf: &[u8]) -> Option<usize> {
    (SLOT_BASE..)
        .step_by(SLOT_SIZE)
        .take_while(|off| off + SLOT_SIZE <= BLOCK_SIZE)
        .find(|off| buf[*off..off + SLOT_SIZE].iter().all(|b| *b == 0xff))
}

impl Secrets {
    pub fn new(device_secret: [u8; MASTER_SECRET_BYTES]) -> Self {
        Self {
            device_secret,
            master: [0; MASTER_SECRET_BYTES],
            have_master: false,
            pad_block: None,
            pad_seq: 0,
        }
    }

    /// Number of leading blocks reserved for the pad region.
    pub fn reserved_blocks(driver: &dyn FlashDriver) -> usize {
        PAD_GROUPS * driver.erase_group_size()
    }

    fn pad_bases(driver: &dyn FlashDriver) -> Vec<usize> {
        let group = driver.erase_group_size();
        (0..PAD_GROUPS).map(|g| g * group).collect()
    }

    pub fn have_master(&self) -> bool {
        self.have_master
    }

    pub fn master(&self) -> Result<&[u8; MASTER_SECRET_BYTES]> {
        if self.have_master {
            Ok(&self.master)
        } else {
            Err(Error::Crypto)
        }
    }

    /// Drop the master key from memory.
    pub fn forget(&mut self) {
        self.master.zeroize();
        self.have_master = false;
        self.pad_block = None;
        self.pad_seq = 0;
    }

    /// master_pattern = f(device_secret, PIN):
    ///   A = H(pin)
    ///   B = H(device_secret + A)
    ///   C = H(A + device_secret)
    ///   pattern = H(B * C)
    fn master_hash(&self, pin: u32) -> Zeroizing<[u8; 32]> {
        let pin_bytes = pin.to_le_bytes();
        let a = hash(&[&pin_bytes]);
        let b = hash(&[&self.device_secret, &a[..]]);
        let c = hash(&[&a[..], &self.device_secret]);
        let m = mult(&b, &c);
        hash(&[&m[..]])
    }

    /// Pad slot id = f(device_secret, PIN):
    ///   A = H(pin)
    ///   B = H(device_secret + pin)
    ///   C = A * B
    ///   D = B * A
    ///   id = H(H(C + D) + C)
    fn id_hash(&self, pin: u32) -> Zeroizing<[u8; 32]> {
        let pin_bytes = pin.to_le_bytes();
        let a = hash(&[&pin_bytes]);
        let b = hash(&[&self.device_secret, &pin_bytes]);
        let c = mult(&a, &b);
        let d = mult(&b, &a);
        let e = hash(&[&c[..], &d[..]]);
        hash(&[&e[..], &c[..]])
    }

    /// Scan the pad region for a slot matching the PIN and recover the
    /// master key. The active pad is the one with the newest sequence.
    pub fn setup(&mut self, driver: &mut dyn FlashDriver, pin: u32) -> Result<()> {
        let pattern = self.master_hash(pin);
        let id = self.id_hash(pin);
        let mut master = Zeroizing::new([0u8; MASTER_SECRET_BYTES]);
        let mut buf = Zeroizing::new(vec![0u8; BLOCK_SIZE]);
        let mut found = false;
        for base in Self::pad_bases(driver) {
            if driver.read_block(base, &mut buf).is_err() {
                warn!("pad block {} unreadable", base);
                continue;
            }
            let seq = u16::from_le_bytes([buf[0], buf[1]]);
            if found && !seq_newer(seq, self.pad_seq) {
                continue;
            }
            if let Some(off) = find_slot(&buf, &id) {
                for i in 0..MASTER_SECRET_BYTES {
                    master[i] = pattern[i] ^ buf[off + 32 + i];
                }
                self.pad_seq = seq;
                self.pad_block = Some(base);
                found = true;
            }
        }
        if !found {
            return Err(Error::Crypto);
        }
        self.master = *master;
        self.have_master = true;
        debug!("pad: block {:?} seq {}", self.pad_block, self.pad_seq);
        Ok(())
    }

    /// First-time setup: wipe the pad region, draw a fresh random master
    /// key and store the single pad slot for `pin` with sequence 1.
    pub fn init_new(&mut self, driver: &mut dyn FlashDriver, pin: u32) -> Result<()> {
        let group = driver.erase_group_size();
        for base in Self::pad_bases(driver) {
            driver.erase_blocks(base, group)?;
        }
        let mut master = Zeroizing::new([0u8; MASTER_SECRET_BYTES]);
        OsRng.fill_bytes(&mut master[..]);
        let pattern = self.master_hash(pin);
        let id = self.id_hash(pin);
        let mut buf = Zeroizing::new(vec![0xffu8; BLOCK_SIZE]);
        buf[0..2].copy_from_slice(&1u16.to_le_bytes());
        buf[SLOT_BASE..SLOT_BASE + 32].copy_from_slice(&id[..]);
        for i in 0..MASTER_SECRET_BYTES {
            buf[SLOT_BASE + 32 + i] = pattern[i] ^ master[i];
        }
        driver.write_block(0, &buf)?;
        self.master = *master;
        self.have_master = true;
        self.pad_block = Some(0);
        self.pad_seq = 1;
        Ok(())
    }

    /// Change the PIN without changing the master key.
    ///
    /// A second pad block is written with the new slot and an incremented
    /// sequence, then the previous one is erased. A crash before the write
    /// leaves the old pad authoritative; a crash before the erase leaves two
    /// valid pads of which the newer sequence wins. The old PIN stops
    /// working the moment the erase completes.
    pub fn change(&mut self, driver: &mut dyn FlashDriver, old_pin: u32, new_pin: u32) -> Result<()> {
        if old_pin == new_pin {
            return Err(Error::InvalidInput("new PIN equals old PIN"));
        }
        let active = self.pad_block.ok_or(Error::Crypto)?;
        if !self.have_master {
            return Err(Error::Crypto);
        }
        let group = driver.erase_group_size();

        // revalidate the old PIN against the active pad before any change
        let old_id = self.id_hash(old_pin);
        let mut buf = Zeroizing::new(vec![0u8; BLOCK_SIZE]);
        driver.read_block(active, &mut buf)?;
        if find_slot(&buf, &old_id).is_none() {
            return Err(Error::Crypto);
        }

        // pick the new pad block: an already-erased group if there is one,
        // else the one with the lowest sequence, erased now
        let mut probe = Zeroizing::new(vec![0u8; BLOCK_SIZE]);
        let mut erased = None;
        let mut victim: Option<(usize, u16)> = None;
        for base in Self::pad_bases(driver) {
            if base == active || driver.read_block(base, &mut probe).is_err() {
                continue;
            }
            if probe.iter().all(|b| *b == 0xff) {
                erased = Some(base);
                break;
            }
            let seq = u16::from_le_bytes([probe[0], probe[1]]);
            if victim.map_or(true, |(_, vseq)| seq_newer(vseq, seq)) {
                victim = Some((base, seq));
            }
        }
        let new_block = match erased {
            Some(base) => base,
            None => {
                let (base, _) = victim.ok_or(Error::OutOfSpace)?;
                driver.erase_blocks(base, group)?;
                base
            }
        };

        // new slot material
        let pattern_new = self.master_hash(new_pin);
        let id_new = self.id_hash(new_pin);
        let mut pad_new = Zeroizing::new([0u8; MASTER_SECRET_BYTES]);
        for i in 0..MASTER_SECRET_BYTES {
            pad_new[i] = pattern_new[i] ^ self.master[i];
        }

        // replace the old slot, or take a free one
        let off = match find_slot(&buf, &old_id).or_else(|| find_erased_slot(&buf)) {
            Some(off) => off,
            None => return Err(Error::InvalidInput("pad block has no free slot")),
        };
        buf[off..off + 32].copy_from_slice(&id_new[..]);
        buf[off + 32..off + SLOT_SIZE].copy_from_slice(&pad_new[..]);
        let new_seq = self.pad_seq.wrapping_add(1);
        buf[0..SLOT_BASE].fill(0xff);
        buf[0..2].copy_from_slice(&new_seq.to_le_bytes());

        driver.write_block(new_block, &buf)?;
        // both PINs stay valid until the old pad is gone
        driver.erase_blocks(active, group)?;

        self.pad_block = Some(new_block);
        self.pad_seq = new_seq;
        info!("pad moved to block {}, seq {}", new_block, new_seq);
        Ok(())
    }
}
