use crate::{FlashConst, FlashDriver, FlashInfo, BLOCK_SIZE};
use anyhow::{bail, Context, Result};
use log::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

const DEFAULT_FILE_BLOCKS: usize = 2048;

/// File-backed flash emulation. A fresh file is created fully erased
/// (all bytes 0xff); writes AND into the stored image like NOR flash.
pub struct FileFlashDriver {
    pub info: FlashInfo,
    file: Option<File>,
}

impl FileFlashDriver {
    pub fn new() -> Self {
        Self {
            info: FlashInfo {
                stats: Default::default(),
                consts: FlashConst {
                    block_count: DEFAULT_FILE_BLOCKS,
                    erase_group: 4,
                },
            },
            file: None,
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().context("storage file not open")
    }

    fn seek_block(&mut self, n: usize) -> Result<()> {
        self.file()?
            .seek(SeekFrom::Start((n * BLOCK_SIZE) as u64))?;
        Ok(())
    }

    fn check_block(&self, n: usize) -> Result<()> {
        if n >= self.info.consts.block_count {
            bail!("block {} out of range", n);
        }
        Ok(())
    }
}

impl Default for FileFlashDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashDriver for FileFlashDriver {
    fn open(&mut self, path: &str) -> Result<()> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                let len = file.metadata()?.len() as usize;
                if len == 0 || len % BLOCK_SIZE != 0 {
                    bail!("{}: size {} is not a multiple of {}", path, len, BLOCK_SIZE);
                }
                self.info.consts.block_count = len / BLOCK_SIZE;
                self.file = Some(file);
            }
            Err(_) => {
                info!("creating storage file {}", path);
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("cannot create {}", path))?;
                let erased = vec![0xffu8; BLOCK_SIZE];
                for _ in 0..DEFAULT_FILE_BLOCKS {
                    file.write_all(&erased)?;
                }
                file.sync_data()?;
                self.info.consts.block_count = DEFAULT_FILE_BLOCKS;
                self.file = Some(file);
            }
        }
        debug!(
            "storage {}: {} blocks, erase group {}",
            path, self.info.consts.block_count, self.info.consts.erase_group
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.info.consts.block_count
    }

    fn erase_group_size(&self) -> usize {
        self.info.consts.erase_group
    }

    fn read_block(&mut self, n: usize, buf: &mut [u8]) -> Result<()> {
        self.check_block(n)?;
        self.info.stats.read_cnt += 1;
        self.seek_block(n)?;
        self.file()?.read_exact(&mut buf[..BLOCK_SIZE])?;
        Ok(())
    }

    fn write_block(&mut self, n: usize, buf: &[u8]) -> Result<()> {
        self.check_block(n)?;
        if buf.len() != BLOCK_SIZE {
            bail!("write of {} bytes, want {}", buf.len(), BLOCK_SIZE);
        }
        self.info.stats.write_cnt += 1;
        let mut old = vec![0u8; BLOCK_SIZE];
        self.seek_block(n)?;
        self.file()?.read_exact(&mut old)?;
        for (dst, src) in old.iter_mut().zip(buf) {
            *dst &= *src;
        }
        self.seek_block(n)?;
        let file = self.file()?;
        file.write_all(&old)?;
        file.sync_data()?;
        Ok(())
    }

    fn erase_blocks(&mut self, n: usize, count: usize) -> Result<()> {
        let group = self.info.consts.erase_group;
        if n % group != 0 || count % group != 0 {
            bail!("unaligned erase: {}+{} (group {})", n, count, group);
        }
        self.check_block(n + count - 1)?;
        self.info.stats.erase_cnt += 1;
        self.seek_block(n)?;
        let erased = vec![0xffu8; BLOCK_SIZE];
        let file = self.file()?;
        for _ in 0..count {
            file.write_all(&erased)?;
        }
        file.sync_data()?;
        Ok(())
    }
}
