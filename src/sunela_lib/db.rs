/// Account database
///
/// A log-structured store of one record per flash block. Mutations never
/// rewrite in place: the new version goes to a fresh erased block, then the
/// old block is zeroed. A crash at any point leaves either the old record,
/// both (resolved by sequence number), or the new one alone.
use std::collections::HashMap;

use flash_driver::FlashDriver;
use log::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zeroize::{Zeroize, Zeroizing};

use super::block::{self, BlockContent, ContentType};
use super::crypt::DbCrypt;
use super::error::{Error, Result};
use super::settings::Settings;
use super::span::SpanList;
use super::{seq_newer, PAYLOAD_SIZE};

/// Maximum length of an entry name
pub const MAX_NAME_LEN: usize = 16;
/// Maximum length of user, email, pw, comment
pub const MAX_STRING_LEN: usize = 64;
/// Maximum bytes of a HOTP/TOTP secret
pub const MAX_SECRET_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FieldType {
    End = 0,
    Id = 1,
    /// Place after this entry
    Prev = 2,
    User = 3,
    Email = 4,
    Pw = 5,
    HotpSecret = 6,
    HotpCounter = 7,
    TotpSecret = 8,
    Comment = 9,
    Pw2 = 10,
    /// Presence marks the entry as a directory
    Dir = 11,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::End => "end",
            FieldType::Id => "id",
            FieldType::Prev => "prev",
            FieldType::User => "user",
            FieldType::Email => "email",
            FieldType::Pw => "pw",
            FieldType::HotpSecret => "hotp_secret",
            FieldType::HotpCounter => "hotp_counter",
            FieldType::TotpSecret => "totp_secret",
            FieldType::Comment => "comment",
            FieldType::Pw2 => "pw2",
            FieldType::Dir => "dir",
        }
    }

    pub fn from_name(name: &str) -> Option<FieldType> {
        [
            FieldType::User,
            FieldType::Email,
            FieldType::Pw,
            FieldType::HotpSecret,
            FieldType::HotpCounter,
            FieldType::TotpSecret,
            FieldType::Comment,
            FieldType::Pw2,
            FieldType::Dir,
        ]
        .into_iter()
        .find(|ft| ft.name() == name)
    }

    /// Fields that are hidden unless explicitly revealed.
    pub fn is_secret(&self) -> bool {
        matches!(
            self,
            FieldType::Pw | FieldType::Pw2 | FieldType::HotpSecret | FieldType::TotpSecret
        )
    }
}

fn check_field(ft: FieldType, data: &[u8]) -> Result<()> {
    match ft {
        FieldType::End => Err(Error::InvalidInput("bad field type")),
        FieldType::Id | FieldType::Prev => {
            if data.is_empty() || data.len() > MAX_NAME_LEN {
                Err(Error::InvalidInput("name too long"))
            } else if data.contains(&0) {
                Err(Error::InvalidInput("name contains NUL"))
            } else {
                Ok(())
            }
        }
        FieldType::User | FieldType::Email | FieldType::Pw | FieldType::Comment | FieldType::Pw2 => {
            if data.len() > MAX_STRING_LEN {
                Err(Error::InvalidInput("string field too long"))
            } else {
                Ok(())
            }
        }
        FieldType::HotpSecret | FieldType::TotpSecret => {
            if data.is_empty() || data.len() > MAX_SECRET_LEN {
                Err(Error::InvalidInput("bad OTP secret length"))
            } else {
                Ok(())
            }
        }
        FieldType::HotpCounter => {
            if data.len() != 8 {
                Err(Error::InvalidInput("HOTP counter must be 8 bytes"))
            } else {
                Ok(())
            }
        }
        FieldType::Dir => {
            if data.is_empty() {
                Ok(())
            } else {
                Err(Error::InvalidInput("dir field carries no value"))
            }
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    check_field(FieldType::Id, name.as_bytes())
}

#[derive(Debug, Clone)]
pub struct DbField {
    pub ft: FieldType,
    pub data: Vec<u8>,
}

impl Drop for DbField {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

#[derive(Debug, Clone)]
pub struct DbEntry {
    pub name: String,
    pub seq: u16,
    /// None while the entry only exists in memory
    pub block: Option<usize>,
    /// Defer writing changes to storage
    pub defer: bool,
    /// Kept sorted by field type; id first
    pub fields: Vec<DbField>,
}

impl DbEntry {
    pub fn field(&self, ft: FieldType) -> Option<&DbField> {
        self.fields.iter().find(|f| f.ft == ft)
    }

    pub fn prev(&self) -> Option<&str> {
        self.field(FieldType::Prev)
            .and_then(|f| std::str::from_utf8(&f.data).ok())
    }

    pub fn is_dir(&self) -> bool {
        self.field(FieldType::Dir).is_some()
    }

    pub fn is_account(&self) -> bool {
        self.fields.iter().any(|f| {
            !matches!(f.ft, FieldType::Id | FieldType::Prev | FieldType::Dir)
        })
    }

    fn set_field(&mut self, ft: FieldType, data: &[u8]) {
        let i = self.fields.partition_point(|f| f.ft < ft);
        if i < self.fields.len() && self.fields[i].ft == ft {
            self.fields[i].data = data.to_vec();
        } else {
            self.fields.insert(
                i,
                DbField {
                    ft,
                    data: data.to_vec(),
                },
            );
        }
    }

    fn remove_field(&mut self, ft: FieldType) -> bool {
        match self.fields.iter().position(|f| f.ft == ft) {
            Some(i) => {
                self.fields.remove(i);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DbStats {
    pub total: usize,
    pub erased: usize,
    pub deleted: usize,
    pub empty: usize,
    pub invalid: usize,
    pub error: usize,
    pub data: usize,
    /// Settings and other distinguished records
    pub special: usize,
}

enum Scanned {
    New,
    Replaced { old_block: Option<usize> },
    Stale,
    Bad,
}

#[derive(Default)]
pub struct Db {
    crypt: Option<DbCrypt>,
    /// First data-region block (the pad region lies below)
    reserved: usize,
    generation: u64,
    stats: DbStats,
    erased: SpanList,
    deleted: SpanList,
    /// Blocks that carry no live data but are not yet erased or zeroed:
    /// ct_empty blocks and stale sequence losers, reclaimed group-wise
    empty: SpanList,
    entries: Vec<DbEntry>,
    settings: Settings,
    settings_block: Option<usize>,
    settings_seq: u16,
    have_settings: bool,
}

fn encode_fields(fields: &[DbField]) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::new());
    for f in fields {
        debug_assert!(f.data.len() <= 255);
        buf.push(f.ft.into());
        buf.push(f.data.len() as u8);
        buf.extend_from_slice(&f.data);
    }
    if buf.len() > PAYLOAD_SIZE {
        return Err(Error::InvalidInput("record exceeds block capacity"));
    }
    Ok(buf)
}

fn parse_fields(payload: &[u8]) -> Result<Vec<DbField>> {
    let mut fields: Vec<DbField> = Vec::new();
    let mut p = 0;
    while p < payload.len() && payload[p] != 0 {
        if p + 2 > payload.len() {
            return Err(Error::InvalidInput("truncated field"));
        }
        let ft = FieldType::try_from(payload[p])
            .map_err(|_| Error::InvalidInput("unknown field type"))?;
        let len = payload[p + 1] as usize;
        if p + 2 + len > payload.len() {
            return Err(Error::InvalidInput("truncated field value"));
        }
        fields.push(DbField {
            ft,
            data: payload[p + 2..p + 2 + len].to_vec(),
        });
        p += 2 + len;
    }
    if fields.first().map(|f| f.ft) != Some(FieldType::Id) {
        return Err(Error::InvalidInput("record does not start with an id"));
    }
    Ok(fields)
}

impl Db {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_open(&self) -> bool {
        self.crypt.is_some()
    }

    fn crypt(&self) -> Result<&DbCrypt> {
        self.crypt.as_ref().ok_or(Error::InvalidInput("database not open"))
    }

    /// Scan every data-region block, index the newest version of each entry
    /// and collect the free-space span lists. Invalid blocks are counted but
    /// do not fail the open. `progress` is called once per block.
    pub fn open(
        &mut self,
        driver: &mut dyn FlashDriver,
        crypt: DbCrypt,
        reserved: usize,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<()> {
        self.close();
        self.reserved = reserved;
        let total_blocks = driver.block_count();
        self.stats.total = total_blocks - reserved;
        for i in reserved..total_blocks {
            match block::block_read(driver, &crypt, i) {
                Err(e) => {
                    warn!("block {}: read failed: {}", i, e);
                    self.stats.error += 1;
                }
                Ok(BlockContent::Deleted) => {
                    self.deleted.add(i, 1);
                    self.stats.deleted += 1;
                }
                Ok(BlockContent::Erased) => {
                    self.erased.add(i, 1);
                    self.stats.erased += 1;
                }
                Ok(BlockContent::Invalid) => {
                    self.stats.invalid += 1;
                }
                Ok(BlockContent::Empty) => {
                    self.empty.add(i, 1);
                    self.stats.empty += 1;
                }
                Ok(BlockContent::Record { kind: ContentType::Settings, seq, payload }) => {
                    self.scan_settings(i, seq, &payload);
                }
                Ok(BlockContent::Record { kind, seq, payload }) => {
                    debug_assert_eq!(kind, ContentType::Data);
                    match self.scan_record(i, seq, &payload) {
                        Scanned::New => self.stats.data += 1,
                        Scanned::Replaced { old_block } => {
                            self.stats.data += 1;
                            if let Some(old) = old_block {
                                self.stats.data -= 1;
                                self.empty.add(old, 1);
                                self.stats.empty += 1;
                            }
                        }
                        Scanned::Stale => {
                            self.empty.add(i, 1);
                            self.stats.empty += 1;
                        }
                        Scanned::Bad => self.stats.invalid += 1,
                    }
                }
            }
            if let Some(f) = progress.as_mut() {
                f(i - reserved, self.stats.total);
            }
        }
        self.crypt = Some(crypt);
        let broken = self.tsort();
        if broken > 0 {
            warn!("{} entries placed by name fallback", broken);
        }
        info!(
            "db open: {} entries, {} data, {} erased, {} deleted, {} empty, {} invalid",
            self.entries.len(),
            self.stats.data,
            self.stats.erased,
            self.stats.deleted,
            self.stats.empty,
            self.stats.invalid
        );
        Ok(())
    }

    pub fn close(&mut self) {
        self.entries.clear();
        self.erased.clear();
        self.deleted.clear();
        self.empty.clear();
        self.stats = Default::default();
        self.crypt = None;
        self.settings = Default::default();
        self.settings_block = None;
        self.settings_seq = 0;
        self.have_settings = false;
        self.generation = 0;
    }

    fn scan_settings(&mut self, block: usize, seq: u16, payload: &[u8]) {
        if self.have_settings && !seq_newer(seq, self.settings_seq) {
            self.empty.add(block, 1);
            self.stats.empty += 1;
            return;
        }
        match Settings::decode(payload) {
            Ok(settings) => {
                if let Some(old) = self.settings_block {
                    self.empty.add(old, 1);
                    self.stats.empty += 1;
                    self.stats.special -= 1;
                }
                self.settings = settings;
                self.settings_block = Some(block);
                self.settings_seq = seq;
                self.have_settings = true;
                self.stats.special += 1;
            }
            Err(e) => {
                debug!("block {}: bad settings record: {}", block, e);
                self.stats.invalid += 1;
            }
        }
    }

    fn scan_record(&mut self, block: usize, seq: u16, payload: &[u8]) -> Scanned {
        let mut fields = match parse_fields(payload) {
            Ok(fields) => fields,
            Err(e) => {
                debug!("block {}: bad record: {}", block, e);
                return Scanned::Bad;
            }
        };
        let name = match std::str::from_utf8(&fields[0].data) {
            Ok(name) if check_name(name).is_ok() => name.to_string(),
            _ => {
                debug!("block {}: bad entry name", block);
                return Scanned::Bad;
            }
        };
        fields.sort_by_key(|f| f.ft);
        match self.find(&name) {
            Some(i) => {
                if !seq_newer(seq, self.entries[i].seq) {
                    return Scanned::Stale;
                }
                let old_block = self.entries[i].block;
                let e = &mut self.entries[i];
                e.seq = seq;
                e.block = Some(block);
                e.fields = fields;
                Scanned::Replaced { old_block }
            }
            None => {
                self.entries.push(DbEntry {
                    name,
                    seq,
                    block: Some(block),
                    defer: false,
                    fields,
                });
                Scanned::New
            }
        }
    }

    /// Topological ordering along the `prev` chains. Roots (and entries
    /// whose `prev` target is absent) come in case-sensitive name order;
    /// cycle members fall back to name order at the end. Returns how many
    /// entries could not be placed by their `prev` hint.
    pub fn tsort(&mut self) -> usize {
        let n = self.entries.len();
        let names: HashMap<String, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut roots: Vec<usize> = Vec::new();
        let mut fallback = 0;
        for (i, e) in self.entries.iter().enumerate() {
            match e.prev().and_then(|p| names.get(p)) {
                Some(&p) if p != i => succs[p].push(i),
                Some(_) => {
                    // self-reference
                    fallback += 1;
                    roots.push(i);
                }
                None => {
                    if e.prev().is_some() {
                        fallback += 1;
                    }
                    roots.push(i);
                }
            }
        }
        let by_name = |a: &usize, b: &usize| self.entries[*a].name.cmp(&self.entries[*b].name);
        roots.sort_by(by_name);
        for s in &mut succs {
            s.sort_by(by_name);
        }
        let mut order: Vec<usize> = Vec::with_capacity(n);
        let mut placed = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        for root in roots {
            stack.push(root);
            while let Some(i) = stack.pop() {
                if placed[i] {
                    continue;
                }
                placed[i] = true;
                order.push(i);
                for s in succs[i].iter().rev() {
                    stack.push(*s);
                }
            }
        }
        // whatever remains sits on a cycle
        let mut rest: Vec<usize> = (0..n).filter(|i| !placed[*i]).collect();
        fallback += rest.len();
        rest.sort_by(by_name);
        order.extend(rest);

        let mut slots: Vec<Option<DbEntry>> = std::mem::take(&mut self.entries)
            .into_iter()
            .map(Some)
            .collect();
        self.entries = order
            .into_iter()
            .map(|i| slots[i].take().expect("order is a permutation"))
            .collect();
        fallback
    }

    /// Pop an erased block, reclaiming an aligned group from the empty or
    /// deleted pool when the erased pool runs dry.
    fn get_erased_block(&mut self, driver: &mut dyn FlashDriver) -> Result<usize> {
        loop {
            if let Some(n) = self.erased.pop_one() {
                self.stats.erased -= 1;
                return Ok(n);
            }
            let group = driver.erase_group_size();
            if let Some(n) = self.empty.pop_erase_group(group) {
                self.stats.empty -= group;
                if driver.erase_blocks(n, group).is_ok() {
                    self.erased.add(n, group);
                    self.stats.erased += group;
                } else {
                    warn!("erase of group {} failed", n);
                    self.stats.error += group;
                }
                continue;
            }
            if let Some(n) = self.deleted.pop_erase_group(group) {
                self.stats.deleted -= group;
                if driver.erase_blocks(n, group).is_ok() {
                    self.erased.add(n, group);
                    self.stats.erased += group;
                } else {
                    warn!("erase of group {} failed", n);
                    self.stats.error += group;
                }
                continue;
            }
            return Err(Error::OutOfSpace);
        }
    }

    /// Write the entry's next version to a fresh block, then retire the old
    /// block. On failure the new block is zeroed best-effort and the entry's
    /// committed fields are untouched (the caller restores in-memory state).
    fn write_back(&mut self, driver: &mut dyn FlashDriver, idx: usize) -> Result<()> {
        let payload = encode_fields(&self.entries[idx].fields)?;
        let new = self.get_erased_block(driver)?;
        debug_assert!(new >= self.reserved);
        let seq = self.entries[idx].seq.wrapping_add(1);
        let res = {
            let crypt = self.crypt()?;
            block::block_write(driver, crypt, ContentType::Data, seq, &payload, new)
        };
        match res {
            Err(e) => {
                if block::block_delete(driver, new).is_ok() {
                    self.deleted.add(new, 1);
                    self.stats.deleted += 1;
                } else {
                    warn!("could not retire block {} after failed write", new);
                    self.stats.error += 1;
                }
                Err(e)
            }
            Ok(()) => {
                let old = self.entries[idx].block;
                self.entries[idx].seq = seq;
                self.entries[idx].block = Some(new);
                self.stats.data += 1;
                if let Some(old) = old {
                    if block::block_delete(driver, old).is_ok() {
                        self.deleted.add(old, 1);
                        self.stats.deleted += 1;
                        self.stats.data -= 1;
                    } else {
                        // stale duplicate; resolved by sequence on next open
                        warn!("could not delete old block {}", old);
                    }
                }
                Ok(())
            }
        }
    }

    /// Apply `mutate` to the entry and persist it, or only record it in
    /// memory while the entry defers updates. Rolls the entry back if the
    /// write fails.
    fn rewrite_entry<F>(&mut self, driver: &mut dyn FlashDriver, idx: usize, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut DbEntry),
    {
        if self.entries[idx].defer {
            mutate(&mut self.entries[idx]);
            self.generation += 1;
            return Ok(());
        }
        let snapshot = self.entries[idx].clone();
        mutate(&mut self.entries[idx]);
        match self.write_back(driver, idx) {
            Ok(()) => {
                self.generation += 1;
                Ok(())
            }
            Err(e) => {
                self.entries[idx] = snapshot;
                Err(e)
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn entry(&self, idx: usize) -> Option<&DbEntry> {
        self.entries.get(idx)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn field_find(&self, idx: usize, ft: FieldType) -> Option<&DbField> {
        self.entries.get(idx).and_then(|e| e.field(ft))
    }

    /// Walk entries in list order until `f` returns false.
    pub fn iterate<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&DbEntry) -> bool,
    {
        for e in &self.entries {
            if !f(e) {
                return false;
            }
        }
        true
    }

    fn new_entry_impl(&mut self, driver: &mut dyn FlashDriver, name: &str, dir: bool) -> Result<usize> {
        self.crypt()?;
        check_name(name)?;
        if self.find(name).is_some() {
            return Err(Error::Duplicate);
        }
        let mut entry = DbEntry {
            name: name.to_string(),
            seq: 0,
            block: None,
            defer: false,
            fields: Vec::new(),
        };
        entry.set_field(FieldType::Id, name.as_bytes());
        if dir {
            entry.set_field(FieldType::Dir, &[]);
        }
        self.entries.push(entry);
        let idx = self.entries.len() - 1;
        match self.write_back(driver, idx) {
            Ok(()) => {
                self.generation += 1;
                self.tsort();
                Ok(self.find(name).expect("entry just inserted"))
            }
            Err(e) => {
                self.entries.pop();
                Err(e)
            }
        }
    }

    /// Create and persist an empty entry. Fails on duplicate name.
    pub fn new_entry(&mut self, driver: &mut dyn FlashDriver, name: &str) -> Result<usize> {
        self.new_entry_impl(driver, name, false)
    }

    /// Create and persist an empty directory entry.
    pub fn mkdir(&mut self, driver: &mut dyn FlashDriver, name: &str) -> Result<usize> {
        self.new_entry_impl(driver, name, true)
    }

    /// Turn an entry without account content into a directory, or back.
    pub fn set_dir(&mut self, driver: &mut dyn FlashDriver, idx: usize, dir: bool) -> Result<()> {
        let e = self.entries.get(idx).ok_or(Error::NotFound)?;
        if e.is_dir() == dir {
            return Ok(());
        }
        if e.is_account() {
            return Err(Error::InvalidInput("entry is not empty"));
        }
        self.rewrite_entry(driver, idx, |e| {
            if dir {
                e.set_field(FieldType::Dir, &[]);
            } else {
                e.remove_field(FieldType::Dir);
            }
        })
    }

    pub fn change_field(
        &mut self,
        driver: &mut dyn FlashDriver,
        idx: usize,
        ft: FieldType,
        data: &[u8],
    ) -> Result<()> {
        if idx >= self.entries.len() {
            return Err(Error::NotFound);
        }
        if ft == FieldType::Id {
            return Err(Error::InvalidInput("use rename to change the id"));
        }
        check_field(ft, data)?;
        self.rewrite_entry(driver, idx, |e| e.set_field(ft, data))
    }

    pub fn delete_field(&mut self, driver: &mut dyn FlashDriver, idx: usize, ft: FieldType) -> Result<()> {
        let e = self.entries.get(idx).ok_or(Error::NotFound)?;
        if ft == FieldType::Id {
            return Err(Error::InvalidInput("an entry cannot lose its id"));
        }
        if e.field(ft).is_none() {
            return Err(Error::NotFound);
        }
        self.rewrite_entry(driver, idx, |e| {
            e.remove_field(ft);
        })
    }

    /// Rename an entry, updating the id field and every `prev` reference.
    pub fn rename(&mut self, driver: &mut dyn FlashDriver, idx: usize, name: &str) -> Result<()> {
        if idx >= self.entries.len() {
            return Err(Error::NotFound);
        }
        check_name(name)?;
        match self.find(name) {
            Some(i) if i != idx => return Err(Error::Duplicate),
            Some(_) => return Ok(()),
            None => (),
        }
        let old_name = self.entries[idx].name.clone();
        self.rewrite_entry(driver, idx, |e| {
            e.name = name.to_string();
            e.set_field(FieldType::Id, name.as_bytes());
        })?;
        let referrers: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.prev() == Some(old_name.as_str()))
            .map(|(i, _)| i)
            .collect();
        for r in referrers {
            if let Err(e) = self.rewrite_entry(driver, r, |e| e.set_field(FieldType::Prev, name.as_bytes())) {
                // dangling reference; tsort falls back to name order
                warn!("could not update prev reference: {}", e);
            }
        }
        self.tsort();
        Ok(())
    }

    /// Zero the record's block and drop the entry. The successor, if any, is
    /// re-pointed at the deleted entry's predecessor.
    pub fn delete_entry(&mut self, driver: &mut dyn FlashDriver, idx: usize) -> Result<()> {
        let e = self.entries.get(idx).ok_or(Error::NotFound)?;
        let name = e.name.clone();
        let prev = e.prev().map(String::from);
        if let Some(block) = e.block {
            block::block_delete(driver, block)?;
            self.deleted.add(block, 1);
            self.stats.deleted += 1;
            self.stats.data -= 1;
        }
        self.entries.remove(idx);
        self.generation += 1;
        if let Some(succ) = self
            .entries
            .iter()
            .position(|e| e.prev() == Some(name.as_str()))
        {
            let res = self.rewrite_entry(driver, succ, |e| match &prev {
                Some(p) => e.set_field(FieldType::Prev, p.as_bytes()),
                None => {
                    e.remove_field(FieldType::Prev);
                }
            });
            if let Err(e) = res {
                warn!("could not relink after delete: {}", e);
            }
        }
        self.tsort();
        Ok(())
    }

    /// Rewrite the `prev` fields named in `plan` (None removes the field),
    /// all in memory first, then persist each affected entry.
    fn apply_prev_plan(
        &mut self,
        driver: &mut dyn FlashDriver,
        plan: Vec<(usize, Option<String>)>,
    ) -> Result<()> {
        // keep only the last change per entry
        let mut dedup: Vec<(usize, Option<String>)> = Vec::new();
        for (idx, prev) in plan {
            if let Some(slot) = dedup.iter_mut().find(|(i, _)| *i == idx) {
                slot.1 = prev;
            } else {
                dedup.push((idx, prev));
            }
        }
        let plan = dedup;
        for (idx, prev) in &plan {
            match prev {
                Some(p) => self.entries[*idx].set_field(FieldType::Prev, p.as_bytes()),
                None => {
                    self.entries[*idx].remove_field(FieldType::Prev);
                }
            }
        }
        let mut result = Ok(());
        for (idx, _) in &plan {
            if self.entries[*idx].defer {
                self.generation += 1;
                continue;
            }
            match self.write_back(driver, *idx) {
                Ok(()) => self.generation += 1,
                Err(e) => {
                    // order degrades to the name fallback, data is intact
                    warn!("reorder write failed: {}", e);
                    result = Err(e);
                }
            }
        }
        self.tsort();
        result
    }

    /// Sort the entry after `after`, or at the beginning if None.
    pub fn move_after(&mut self, driver: &mut dyn FlashDriver, idx: usize, after: Option<usize>) -> Result<()> {
        if idx >= self.entries.len() || after.map_or(false, |a| a >= self.entries.len()) {
            return Err(Error::NotFound);
        }
        if after == Some(idx) {
            return Err(Error::InvalidInput("cannot move an entry after itself"));
        }
        let e_name = self.entries[idx].name.clone();
        let e_prev = self.entries[idx].prev().map(String::from);
        let mut plan: Vec<(usize, Option<String>)> = Vec::new();
        match after {
            Some(a) => {
                let after_name = self.entries[a].name.clone();
                if self.entries[idx].prev() == Some(after_name.as_str()) {
                    return Ok(());
                }
                for (i, e) in self.entries.iter().enumerate() {
                    if i == idx {
                        continue;
                    }
                    if e.prev() == Some(e_name.as_str()) {
                        plan.push((i, e_prev.clone()));
                    } else if e.prev() == Some(after_name.as_str()) {
                        plan.push((i, Some(e_name.clone())));
                    }
                }
                plan.push((idx, Some(after_name)));
            }
            None => {
                // to the beginning: the current head follows the entry
                if idx == 0 {
                    return Ok(());
                }
                for (i, e) in self.entries.iter().enumerate() {
                    if i != idx && e.prev() == Some(e_name.as_str()) {
                        plan.push((i, e_prev.clone()));
                    }
                }
                plan.push((0, Some(e_name)));
                plan.push((idx, None));
            }
        }
        self.apply_prev_plan(driver, plan)
    }

    /// Sort the entry before `before`, or at the end if None.
    pub fn move_before(&mut self, driver: &mut dyn FlashDriver, idx: usize, before: Option<usize>) -> Result<()> {
        if idx >= self.entries.len() || before.map_or(false, |b| b >= self.entries.len()) {
            return Err(Error::NotFound);
        }
        if before == Some(idx) {
            return Err(Error::InvalidInput("cannot move an entry before itself"));
        }
        let e_name = self.entries[idx].name.clone();
        let e_prev = self.entries[idx].prev().map(String::from);
        let mut plan: Vec<(usize, Option<String>)> = Vec::new();
        match before {
            Some(b) => {
                if self.entries[b].prev() == Some(e_name.as_str()) {
                    return Ok(());
                }
                let b_prev = self.entries[b].prev().map(String::from);
                for (i, e) in self.entries.iter().enumerate() {
                    if i != idx && i != b && e.prev() == Some(e_name.as_str()) {
                        plan.push((i, e_prev.clone()));
                    }
                }
                plan.push((idx, b_prev));
                plan.push((b, Some(e_name)));
            }
            None => {
                // to the end: hang the entry off the current tail
                if idx + 1 == self.entries.len() {
                    return Ok(());
                }
                let last_name = self.entries[self.entries.len() - 1].name.clone();
                for (i, e) in self.entries.iter().enumerate() {
                    if i != idx && e.prev() == Some(e_name.as_str()) {
                        plan.push((i, e_prev.clone()));
                    }
                }
                plan.push((idx, Some(last_name)));
            }
        }
        self.apply_prev_plan(driver, plan)
    }

    /// While deferred, changes only touch memory; `defer_update(.., false)`
    /// writes the entry once, reflecting the cumulative change.
    pub fn defer_update(&mut self, driver: &mut dyn FlashDriver, idx: usize, defer: bool) -> Result<()> {
        if idx >= self.entries.len() {
            return Err(Error::NotFound);
        }
        if defer {
            self.entries[idx].defer = true;
            return Ok(());
        }
        if !self.entries[idx].defer {
            return Ok(());
        }
        self.entries[idx].defer = false;
        self.write_back(driver, idx)?;
        self.generation += 1;
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Rewrite the settings record; same fresh-block discipline as entries.
    pub fn update_settings(&mut self, driver: &mut dyn FlashDriver, settings: Settings) -> Result<()> {
        self.crypt()?;
        let payload = settings.encode();
        let seq = self.settings_seq.wrapping_add(1);
        let new = self.get_erased_block(driver)?;
        let res = {
            let crypt = self.crypt()?;
            block::block_write(driver, crypt, ContentType::Settings, seq, &payload, new)
        };
        match res {
            Err(e) => {
                if block::block_delete(driver, new).is_ok() {
                    self.deleted.add(new, 1);
                    self.stats.deleted += 1;
                } else {
                    self.stats.error += 1;
                }
                Err(e)
            }
            Ok(()) => {
                let old = self.settings_block;
                self.settings = settings;
                self.settings_block = Some(new);
                self.settings_seq = seq;
                self.have_settings = true;
                self.stats.special += 1;
                if let Some(old) = old {
                    if block::block_delete(driver, old).is_ok() {
                        self.deleted.add(old, 1);
                        self.stats.deleted += 1;
                        self.stats.special -= 1;
                    } else {
                        warn!("could not delete old settings block {}", old);
                    }
                }
                self.generation += 1;
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> DbStats {
        self.stats.clone()
    }

    /// Incremented on every mutation; lets streaming readers detect change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Test hook: create an in-memory-only entry with an optional prev hint.
    #[cfg(test)]
    pub(crate) fn dummy_entry(&mut self, name: &str, prev: Option<&str>) {
        let mut entry = DbEntry {
            name: name.to_string(),
            seq: 0,
            block: None,
            defer: false,
            fields: Vec::new(),
        };
        entry.set_field(FieldType::Id, name.as_bytes());
        if let Some(p) = prev {
            entry.set_field(FieldType::Prev, p.as_bytes());
        }
        self.entries.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_driver::memory::MemFlashDriver;
    use flash_driver::BLOCK_SIZE;

    const RESERVED: usize = 8;

    fn crypt() -> DbCrypt {
        DbCrypt::new(&[0x11; super::super::MASTER_SECRET_BYTES])
    }

    fn open_db(driver: &mut MemFlashDriver) -> Db {
        let mut db = Db::new();
        db.open(driver, crypt(), RESERVED, None).unwrap();
        db
    }

    fn names(db: &Db) -> Vec<String> {
        let mut out = vec![];
        db.iterate(|e| {
            out.push(e.name.clone());
            true
        });
        out
    }

    #[test]
    fn open_empty() {
        let mut driver = MemFlashDriver::new(64, 4);
        let db = open_db(&mut driver);
        let stats = db.stats();
        assert_eq!(stats.total, 64 - RESERVED);
        assert_eq!(stats.erased, stats.total);
        assert_eq!(db.entry_count(), 0);
    }

    #[test]
    fn create_change_reopen() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        db.change_field(&mut driver, idx, FieldType::User, b"alice")?;

        let db = open_db(&mut driver);
        let idx = db.find("demo").unwrap();
        let entry = db.entry(idx).unwrap();
        assert_eq!(entry.seq, 2);
        assert_eq!(db.field_find(idx, FieldType::User).unwrap().data, b"alice");
        let stats = db.stats();
        assert_eq!(stats.data, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.erased, stats.total - 2);
        Ok(())
    }

    #[test]
    fn duplicate_name_rejected() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        db.new_entry(&mut driver, "demo")?;
        assert!(matches!(db.new_entry(&mut driver, "demo"), Err(Error::Duplicate)));
        Ok(())
    }

    #[test]
    fn field_bounds() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        assert!(db.change_field(&mut driver, idx, FieldType::User, &[b'x'; 64]).is_ok());
        assert!(matches!(
            db.change_field(&mut driver, idx, FieldType::User, &[b'x'; 65]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            db.change_field(&mut driver, idx, FieldType::HotpSecret, &[0; 21]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            db.change_field(&mut driver, idx, FieldType::HotpCounter, &[0; 7]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            db.new_entry(&mut driver, "seventeen-chars-x"),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn encode_capacity_boundary() {
        // a record of exactly PAYLOAD_SIZE encodes; one byte more does not
        let mut fields = vec![DbField {
            ft: FieldType::Id,
            data: vec![b'a'; 16],
        }];
        let mut left = PAYLOAD_SIZE - 18;
        let mut ft = FieldType::User;
        for chunk in [255usize, 255, 255, 189] {
            fields.push(DbField {
                ft,
                data: vec![b'x'; chunk],
            });
            ft = FieldType::Email;
            left -= chunk + 2;
        }
        assert_eq!(left, 0);
        assert!(encode_fields(&fields).is_ok());
        fields.last_mut().unwrap().data.push(b'x');
        assert!(matches!(encode_fields(&fields), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn fields_stay_sorted() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        db.change_field(&mut driver, idx, FieldType::Comment, b"c")?;
        db.change_field(&mut driver, idx, FieldType::User, b"u")?;
        db.change_field(&mut driver, idx, FieldType::Pw, b"p")?;
        let types: Vec<FieldType> = db.entry(idx).unwrap().fields.iter().map(|f| f.ft).collect();
        assert_eq!(
            types,
            vec![FieldType::Id, FieldType::User, FieldType::Pw, FieldType::Comment]
        );
        Ok(())
    }

    #[test]
    fn delete_field_and_entry() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        db.change_field(&mut driver, idx, FieldType::Pw, b"secret")?;
        db.delete_field(&mut driver, idx, FieldType::Pw)?;
        assert!(db.field_find(idx, FieldType::Pw).is_none());
        assert!(matches!(
            db.delete_field(&mut driver, idx, FieldType::Pw),
            Err(Error::NotFound)
        ));
        db.delete_entry(&mut driver, idx)?;
        assert!(db.find("demo").is_none());

        let db = open_db(&mut driver);
        assert_eq!(db.entry_count(), 0);
        assert_eq!(db.stats().data, 0);
        Ok(())
    }

    #[test]
    fn sequence_wraps() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        // jump close to the wrap point
        db.entries[idx].seq = 0xfffe;
        db.change_field(&mut driver, idx, FieldType::User, b"old")?;
        assert_eq!(db.entry(idx).unwrap().seq, 0xffff);
        db.change_field(&mut driver, idx, FieldType::User, b"new")?;
        assert_eq!(db.entry(idx).unwrap().seq, 0);

        let db = open_db(&mut driver);
        let idx = db.find("demo").unwrap();
        assert_eq!(db.entry(idx).unwrap().seq, 0);
        assert_eq!(db.field_find(idx, FieldType::User).unwrap().data, b"new");
        Ok(())
    }

    #[test]
    fn newer_sequence_wins_on_open() -> Result<()> {
        // two blocks carrying the same name; the newer (mod 2^16) wins and
        // the loser goes to the empty-obsolete pool
        let mut driver = MemFlashDriver::new(64, 4);
        let c = crypt();
        let payload = encode_fields(&[DbField { ft: FieldType::Id, data: b"demo".to_vec() }]).unwrap();
        block::block_write(&mut driver, &c, ContentType::Data, 0xffff, &payload, 10)?;
        block::block_write(&mut driver, &c, ContentType::Data, 0, &payload, 20)?;
        let db = open_db(&mut driver);
        let idx = db.find("demo").unwrap();
        assert_eq!(db.entry(idx).unwrap().seq, 0);
        assert_eq!(db.entry(idx).unwrap().block, Some(20));
        let stats = db.stats();
        assert_eq!(stats.data, 1);
        assert_eq!(stats.empty, 1);
        assert!(db.empty.contains(10));
        Ok(())
    }

    #[test]
    fn reclaims_deleted_groups() -> Result<()> {
        let mut driver = MemFlashDriver::new(16, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        for i in 0..7u8 {
            db.change_field(&mut driver, idx, FieldType::User, &[b'a' + i])?;
        }
        assert_eq!(db.stats().erased, 0);
        // next mutation must erase a group of deleted blocks and reuse it
        db.change_field(&mut driver, idx, FieldType::User, b"z")?;
        let stats = db.stats();
        assert_eq!(stats.data, 1);
        assert!(stats.erased > 0);
        let db = open_db(&mut driver);
        let idx = db.find("demo").unwrap();
        assert_eq!(db.field_find(idx, FieldType::User).unwrap().data, b"z");
        Ok(())
    }

    #[test]
    fn out_of_space() -> Result<()> {
        let mut driver = MemFlashDriver::new(16, 4);
        let mut db = open_db(&mut driver);
        for name in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            db.new_entry(&mut driver, name)?;
        }
        // eight live records, no deleted or empty blocks left
        assert!(matches!(
            db.new_entry(&mut driver, "i"),
            Err(Error::OutOfSpace)
        ));
        assert!(db.find("i").is_none());
        let idx = db.find("a").unwrap();
        assert!(matches!(
            db.change_field(&mut driver, idx, FieldType::User, b"x"),
            Err(Error::OutOfSpace)
        ));
        // the failed change rolled back
        assert!(db.field_find(idx, FieldType::User).is_none());
        Ok(())
    }

    #[test]
    fn deferred_writes_coalesce() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        let gen0 = db.generation();
        let writes = driver.info.stats.write_cnt;
        db.defer_update(&mut driver, idx, true)?;
        db.change_field(&mut driver, idx, FieldType::User, b"alice")?;
        db.change_field(&mut driver, idx, FieldType::Pw, b"hunter2")?;
        db.change_field(&mut driver, idx, FieldType::User, b"bob")?;
        assert_eq!(driver.info.stats.write_cnt, writes);
        assert!(db.generation() > gen0);
        db.defer_update(&mut driver, idx, false)?;
        // one record write, one delete of the old block
        assert_eq!(driver.info.stats.write_cnt, writes + 2);

        let db = open_db(&mut driver);
        let idx = db.find("demo").unwrap();
        assert_eq!(db.field_find(idx, FieldType::User).unwrap().data, b"bob");
        assert_eq!(db.field_find(idx, FieldType::Pw).unwrap().data, b"hunter2");
        Ok(())
    }

    #[test]
    fn rename_updates_references() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let a = db.new_entry(&mut driver, "aaa")?;
        db.new_entry(&mut driver, "bbb")?;
        let b = db.find("bbb").unwrap();
        db.move_after(&mut driver, b, Some(a))?;
        let a = db.find("aaa").unwrap();
        db.rename(&mut driver, a, "zzz")?;
        assert_eq!(names(&db), vec!["zzz", "bbb"]);

        let db = open_db(&mut driver);
        assert_eq!(names(&db), vec!["zzz", "bbb"]);
        let b = db.find("bbb").unwrap();
        assert_eq!(db.entry(b).unwrap().prev(), Some("zzz"));
        Ok(())
    }

    #[test]
    fn move_reorders_persistently() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        for name in ["a", "b", "c"] {
            db.new_entry(&mut driver, name)?;
        }
        assert_eq!(names(&db), vec!["a", "b", "c"]);

        let b = db.find("b").unwrap();
        let c = db.find("c").unwrap();
        db.move_after(&mut driver, b, Some(c))?;
        assert_eq!(names(&db), vec!["a", "c", "b"]);
        let db2 = open_db(&mut driver);
        assert_eq!(names(&db2), vec!["a", "c", "b"]);
        let mut db = db2;

        let a = db.find("a").unwrap();
        db.move_before(&mut driver, a, None)?;
        assert_eq!(names(&db), vec!["c", "b", "a"]);

        let a = db.find("a").unwrap();
        db.move_after(&mut driver, a, None)?;
        assert_eq!(names(&db), vec!["a", "c", "b"]);

        let a = db.find("a").unwrap();
        let b = db.find("b").unwrap();
        db.move_before(&mut driver, b, Some(a))?;
        assert_eq!(names(&db), vec!["b", "a", "c"]);

        let db = open_db(&mut driver);
        assert_eq!(names(&db), vec!["b", "a", "c"]);
        Ok(())
    }

    #[test]
    fn tsort_orders_chains_and_breaks_cycles() {
        let mut db = Db::new();
        db.dummy_entry("m", None);
        db.dummy_entry("a", Some("m"));
        db.dummy_entry("z", Some("m"));
        db.dummy_entry("q", Some("missing"));
        // cycle
        db.dummy_entry("c1", Some("c2"));
        db.dummy_entry("c2", Some("c1"));
        let fallback = db.tsort();
        assert_eq!(fallback, 3); // q dangles, c1 and c2 cycle
        assert_eq!(names(&db), vec!["m", "a", "z", "q", "c1", "c2"]);
    }

    #[test]
    fn generation_strictly_increases() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let mut last = db.generation();
        let idx = db.new_entry(&mut driver, "demo")?;
        assert!(db.generation() > last);
        last = db.generation();
        db.change_field(&mut driver, idx, FieldType::User, b"alice")?;
        assert!(db.generation() > last);
        last = db.generation();
        db.delete_entry(&mut driver, idx)?;
        assert!(db.generation() > last);
        Ok(())
    }

    #[test]
    fn settings_record_roundtrip() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        assert_eq!(db.settings(), Settings::default());
        db.update_settings(
            &mut driver,
            Settings {
                crosshair: true,
                strict_rmt: false,
            },
        )?;
        assert_eq!(db.stats().special, 1);
        db.update_settings(
            &mut driver,
            Settings {
                crosshair: true,
                strict_rmt: true,
            },
        )?;
        assert_eq!(db.stats().special, 1);

        let db = open_db(&mut driver);
        assert!(db.settings().crosshair);
        assert!(db.settings().strict_rmt);
        assert_eq!(db.stats().special, 1);
        Ok(())
    }

    #[test]
    fn corrupt_block_counts_invalid() -> Result<()> {
        let mut driver = MemFlashDriver::new(64, 4);
        let mut db = open_db(&mut driver);
        let idx = db.new_entry(&mut driver, "demo")?;
        let block = db.entry(idx).unwrap().block.unwrap();
        let mut raw = vec![0u8; BLOCK_SIZE];
        driver.read_block(block, &mut raw).unwrap();
        let i = (super::super::NONCE_SIZE..BLOCK_SIZE)
            .find(|i| raw[*i] != 0)
            .unwrap();
        let mut patch = vec![0xffu8; BLOCK_SIZE];
        patch[i] = raw[i] & (raw[i] - 1);
        driver.write_block(block, &patch).unwrap();

        let db = open_db(&mut driver);
        assert!(db.find("demo").is_none());
        assert_eq!(db.stats().invalid, 1);
        assert_eq!(db.stats().data, 0);
        Ok(())
    }
}
