use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use sunela::flash_driver::memory::MemFlashDriver;
use sunela::flash_driver::{FlashDriver, BLOCK_SIZE};
use sunela::pin::pin_encode;
use sunela::{Error, FieldType, Vault, MASTER_SECRET_BYTES, NONCE_SIZE};

/// Flash shared between consecutive "boots", with optional write-failure
/// injection to emulate power loss between two block writes.
#[derive(Clone)]
struct SharedFlash {
    mem: Rc<RefCell<MemFlashDriver>>,
    fail_writes_after: Rc<RefCell<Option<u32>>>,
}

impl SharedFlash {
    fn new(blocks: usize, erase_group: usize) -> Self {
        Self {
            mem: Rc::new(RefCell::new(MemFlashDriver::new(blocks, erase_group))),
            fail_writes_after: Rc::new(RefCell::new(None)),
        }
    }

    fn fail_after(&self, writes: u32) {
        *self.fail_writes_after.borrow_mut() = Some(writes);
    }

    fn heal(&self) {
        *self.fail_writes_after.borrow_mut() = None;
    }

    fn raw(&self, block: usize) -> Vec<u8> {
        self.mem.borrow().mem[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE].to_vec()
    }

    fn patch(&self, block: usize, offset: usize, value: u8) {
        self.mem.borrow_mut().mem[block * BLOCK_SIZE + offset] = value;
    }
}

impl FlashDriver for SharedFlash {
    fn open(&mut self, path: &str) -> anyhow::Result<()> {
        self.mem.borrow_mut().open(path)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.mem.borrow_mut().close()
    }

    fn block_count(&self) -> usize {
        self.mem.borrow().block_count()
    }

    fn erase_group_size(&self) -> usize {
        self.mem.borrow().erase_group_size()
    }

    fn read_block(&mut self, n: usize, buf: &mut [u8]) -> anyhow::Result<()> {
        self.mem.borrow_mut().read_block(n, buf)
    }

    fn write_block(&mut self, n: usize, buf: &[u8]) -> anyhow::Result<()> {
        if let Some(left) = self.fail_writes_after.borrow_mut().as_mut() {
            if *left == 0 {
                bail!("injected write failure at block {}", n);
            }
            *left -= 1;
        }
        self.mem.borrow_mut().write_block(n, buf)
    }

    fn erase_blocks(&mut self, n: usize, count: usize) -> anyhow::Result<()> {
        self.mem.borrow_mut().erase_blocks(n, count)
    }
}

const RESERVED: usize = 8; // two pad erase groups of four blocks

fn pin(s: &str) -> u32 {
    pin_encode(s).unwrap()
}

fn vault(flash: &SharedFlash) -> Vault {
    Vault::new(Box::new(flash.clone()), [0x42; MASTER_SECRET_BYTES])
}

fn reboot(flash: &SharedFlash, pin_str: &str) -> Vault {
    let mut v = vault(flash);
    v.login(pin(pin_str)).unwrap();
    v.open().unwrap();
    v
}

fn check_partition(v: &Vault) {
    let stats = v.stats();
    assert_eq!(
        stats.total,
        stats.erased + stats.deleted + stats.empty + stats.invalid + stats.error
            + stats.data + stats.special
    );
}

#[test]
fn fresh_device_setup() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    assert!(v.is_erased().unwrap());
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();

    // the pad block carries sequence 1 and exactly one populated slot
    let pad = flash.raw(0);
    assert_eq!(u16::from_le_bytes([pad[0], pad[1]]), 1);
    assert!(pad[2..32].iter().all(|b| *b == 0xff));
    assert!(pad[32..96].iter().any(|b| *b != 0xff));
    assert!(pad[96..].iter().all(|b| *b == 0xff));
    // the spare pad group and the data region stay erased
    assert!(flash.raw(4).iter().all(|b| *b == 0xff));

    let stats = v.stats();
    assert_eq!(stats.total, 64 - RESERVED);
    assert_eq!(stats.erased, stats.total);
    check_partition(&v);
}

#[test]
fn write_reboot_read() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    let idx = v.new_entry("demo").unwrap();
    v.change_field(idx, FieldType::User, b"alice").unwrap();
    let block = v.entry(idx).unwrap().block;
    drop(v);

    let v = reboot(&flash, "1234");
    let idx = v.find("demo").unwrap();
    let entry = v.entry(idx).unwrap();
    assert_eq!(v.field_find(idx, FieldType::User).unwrap().data, b"alice");
    assert_eq!(entry.block, block);
    let stats = v.stats();
    assert_eq!(stats.data, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.erased, stats.total - stats.data - stats.deleted);
    check_partition(&v);
}

#[test]
fn pin_change_preserves_data() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    for name in ["a", "b", "c"] {
        let idx = v.new_entry(name).unwrap();
        v.change_field(idx, FieldType::Pw, name.as_bytes()).unwrap();
    }
    let seqs: Vec<u16> = ["a", "b", "c"]
        .iter()
        .map(|n| v.entry(v.find(n).unwrap()).unwrap().seq)
        .collect();
    v.change_pin(pin("1234"), pin("954770")).unwrap();
    drop(v);

    let v = reboot(&flash, "954770");
    for (name, seq) in ["a", "b", "c"].iter().zip(&seqs) {
        let idx = v.find(name).unwrap();
        assert_eq!(v.entry(idx).unwrap().seq, *seq);
        assert_eq!(v.field_find(idx, FieldType::Pw).unwrap().data, name.as_bytes());
    }
    drop(v);

    let mut old = vault(&flash);
    assert!(matches!(old.login(pin("1234")), Err(Error::Crypto)));
    assert_eq!(old.failed_attempts(), 1);
}

#[test]
fn power_loss_mid_write() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    let idx = v.new_entry("demo").unwrap();
    v.change_field(idx, FieldType::User, b"old").unwrap();

    // the record write goes through, the delete of the old block does not
    flash.fail_after(1);
    v.change_field(idx, FieldType::User, b"new").unwrap();
    flash.heal();
    drop(v);

    // both versions are on flash now; the newer sequence wins
    let v = reboot(&flash, "1234");
    let idx = v.find("demo").unwrap();
    assert_eq!(v.field_find(idx, FieldType::User).unwrap().data, b"new");
    let stats = v.stats();
    assert_eq!(stats.data, 1);
    assert_eq!(stats.empty, 1); // the stale loser awaits reclamation
    check_partition(&v);
}

#[test]
fn interrupted_write_rolls_back() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    let idx = v.new_entry("demo").unwrap();
    v.change_field(idx, FieldType::User, b"old").unwrap();

    // the record write itself fails
    flash.fail_after(0);
    assert!(v.change_field(idx, FieldType::User, b"new").is_err());
    flash.heal();
    assert_eq!(v.field_find(idx, FieldType::User).unwrap().data, b"old");
    drop(v);

    let v = reboot(&flash, "1234");
    let idx = v.find("demo").unwrap();
    assert_eq!(v.field_find(idx, FieldType::User).unwrap().data, b"old");
}

#[test]
fn reclamation_when_full() {
    let flash = SharedFlash::new(16, 4); // 8 data blocks
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    let idx = v.new_entry("demo").unwrap();
    for i in 0..7u8 {
        v.change_field(idx, FieldType::User, &[b'a' + i]).unwrap();
    }
    assert_eq!(v.stats().erased, 0);
    // pops an erase-aligned run of deleted blocks, erases it, reuses one
    v.change_field(idx, FieldType::User, b"z").unwrap();
    assert_eq!(v.field_find(idx, FieldType::User).unwrap().data, b"z");
    check_partition(&v);
    drop(v);

    let v = reboot(&flash, "1234");
    let idx = v.find("demo").unwrap();
    assert_eq!(v.field_find(idx, FieldType::User).unwrap().data, b"z");
}

#[test]
fn corrupted_block_is_invalid() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    let idx = v.new_entry("demo").unwrap();
    let block = v.entry(idx).unwrap().block.unwrap();
    drop(v);

    // clear one set bit somewhere in the ciphertext
    let raw = flash.raw(block);
    let i = (NONCE_SIZE..BLOCK_SIZE).find(|i| raw[*i] != 0).unwrap();
    flash.patch(block, i, raw[i] & (raw[i] - 1));

    let v = reboot(&flash, "1234");
    assert!(v.find("demo").is_none());
    let stats = v.stats();
    assert_eq!(stats.invalid, 1);
    assert_eq!(stats.data, 0);
    check_partition(&v);
}

#[test]
fn generation_visible_across_api() {
    let flash = SharedFlash::new(64, 4);
    let mut v = vault(&flash);
    v.set_pin(pin("1234")).unwrap();
    v.open().unwrap();
    let g0 = v.generation();
    let idx = v.new_entry("demo").unwrap();
    let g1 = v.generation();
    assert!(g1 > g0);
    v.rename(idx, "omed").unwrap();
    assert!(v.generation() > g1);
}
