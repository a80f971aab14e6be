use anyhow::Result;

/// Size of one flash block in bytes. One block is the unit of read and write;
/// erase works on aligned groups of `erase_group` blocks.
pub const BLOCK_SIZE: usize = 1024;

#[derive(Default, Debug, Clone)]
pub struct FlashStats {
    pub read_cnt: u32,
    pub write_cnt: u32,
    pub erase_cnt: u32,
}

#[derive(Debug, Clone)]
pub struct FlashConst {
    pub block_count: usize,
    /// Smallest erasable run, in blocks
    pub erase_group: usize,
}

#[derive(Default, Debug, Clone)]
pub struct FlashInfo {
    pub stats: FlashStats,
    pub consts: FlashConst,
}

impl Default for FlashConst {
    fn default() -> Self {
        Self {
            block_count: 2048,
            erase_group: 4,
        }
    }
}

/// FlashDriver abstract interface.
///
/// Bit-exact NOR semantics: erase leaves every bit of an aligned group at 1;
/// a write can only clear bits. Implementations emulate this by AND-ing the
/// new data into the stored image, so an illegal rewrite of a programmed
/// block yields garbage instead of the requested bytes, like real hardware.
pub trait FlashDriver {
    fn open(&mut self, path: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn block_count(&self) -> usize;
    fn erase_group_size(&self) -> usize;
    fn read_block(&mut self, n: usize, buf: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, n: usize, buf: &[u8]) -> Result<()>;
    /// Erase `count` blocks starting at `n`; both must be multiples of the
    /// erase group size.
    fn erase_blocks(&mut self, n: usize, count: usize) -> Result<()>;
}

pub mod file;
pub mod memory;
