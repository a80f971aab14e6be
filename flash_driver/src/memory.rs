use crate::{FlashConst, FlashDriver, FlashInfo, BLOCK_SIZE};
use anyhow::{bail, Result};

/// RAM-backed flash, mainly for tests. Starts fully erased.
pub struct MemFlashDriver {
    pub info: FlashInfo,
    pub mem: Vec<u8>,
}

impl MemFlashDriver {
    pub fn new(block_count: usize, erase_group: usize) -> Self {
        Self {
            info: FlashInfo {
                stats: Default::default(),
                consts: FlashConst {
                    block_count,
                    erase_group,
                },
            },
            mem: vec![0xff; block_count * BLOCK_SIZE],
        }
    }

    fn check_block(&self, n: usize) -> Result<()> {
        if n >= self.info.consts.block_count {
            bail!("block {} out of range", n);
        }
        Ok(())
    }
}

impl FlashDriver for MemFlashDriver {
    fn open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
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
        buf.copy_from_slice(&self.mem[n * BLOCK_SIZE..(n + 1) * BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&mut self, n: usize, buf: &[u8]) -> Result<()> {
        self.check_block(n)?;
        if buf.len() != BLOCK_SIZE {
            bail!("write of {} bytes, want {}", buf.len(), BLOCK_SIZE);
        }
        self.info.stats.write_cnt += 1;
        for (dst, src) in self.mem[n * BLOCK_SIZE..(n + 1) * BLOCK_SIZE]
            .iter_mut()
            .zip(buf)
        {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase_blocks(&mut self, n: usize, count: usize) -> Result<()> {
        let group = self.info.consts.erase_group;
        if n % group != 0 || count % group != 0 {
            bail!("unaligned erase: {}+{} (group {})", n, count, group);
        }
        self.check_block(n + count - 1)?;
        self.info.stats.erase_cnt += 1;
        self.mem[n * BLOCK_SIZE..(n + count) * BLOCK_SIZE].fill(0xff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_erased() -> Result<()> {
        let mut driver = MemFlashDriver::new(16, 4);
        let mut buf = vec![0u8; BLOCK_SIZE];
        driver.read_block(15, &mut buf)?;
        assert!(buf.iter().all(|b| *b == 0xff));
        assert!(driver.read_block(16, &mut buf).is_err());
        Ok(())
    }
}
