/// Block-level operations
///
/// Block structure:
///
/// Offset
/// |       Size
/// 0       24      Nonce (all-zero if deleted, all-0xff if erased)
/// 24      1000    Encrypted content
///  0      1         Content type (empty, data, settings)
///  1      1         Reserved
///  2      2         Sequence (little-endian, to version records)
///  4      980       Payload
///  984    16        Authentication tag
use anyhow::anyhow;
use flash_driver::FlashDriver;
use log::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zeroize::Zeroizing;

use super::crypt::DbCrypt;
use super::error::{Error, Result};
use super::{BLOCK_SIZE, CONTENT_SIZE, HEADER_SIZE, NONCE_SIZE, PAYLOAD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ContentType {
    /// Allocated but carries no valid data
    Empty = 3,
    /// Account record
    Data = 4,
    /// Settings record
    Settings = 5,
}

/// Physical block state, inferred from raw bytes alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Deleted,
    Erased,
    Data,
    Invalid,
}

/// Result of reading and decrypting one block.
#[derive(Debug)]
pub enum BlockContent {
    Deleted,
    Erased,
    /// Classified as data but failed decryption, authentication or parsing
    Invalid,
    Empty,
    Record {
        kind: ContentType,
        seq: u16,
        payload: Zeroizing<Vec<u8>>,
    },
}

pub fn classify(raw: &[u8]) -> Classification {
    assert_eq!(raw.len(), BLOCK_SIZE);
    match raw[0] {
        0 => {
            if raw[1..NONCE_SIZE].iter().all(|b| *b == 0) {
                Classification::Deleted
            } else {
                Classification::Data
            }
        }
        0xff => {
            if raw[1..NONCE_SIZE].iter().any(|b| *b != 0xff) {
                Classification::Data
            } else if raw[NONCE_SIZE..].iter().all(|b| *b == 0xff) {
                Classification::Erased
            } else {
                // an erased nonce over a dirty tail cannot decrypt
                Classification::Invalid
            }
        }
        _ => Classification::Data,
    }
}

/// Read block `n` and return its decrypted content.
/// I/O failure is the only error; everything else is a BlockContent case.
pub fn block_read(
    driver: &mut dyn FlashDriver,
    crypt: &DbCrypt,
    n: usize,
) -> Result<BlockContent> {
    let mut raw = vec![0u8; BLOCK_SIZE];
    driver.read_block(n, &mut raw)?;
    match classify(&raw) {
        Classification::Deleted => return Ok(BlockContent::Deleted),
        Classification::Erased => return Ok(BlockContent::Erased),
        Classification::Invalid => return Ok(BlockContent::Invalid),
        Classification::Data => (),
    }
    let content = match crypt.decrypt(&raw) {
        Ok(content) => content,
        Err(_) => return Ok(BlockContent::Invalid),
    };
    let kind = match ContentType::try_from(content[0]) {
        Ok(kind) => kind,
        Err(_) => {
            debug!("block {}: unknown content type {}", n, content[0]);
            return Ok(BlockContent::Invalid);
        }
    };
    let seq = u16::from_le_bytes([content[2], content[3]]);
    match kind {
        ContentType::Empty => Ok(BlockContent::Empty),
        ContentType::Data | ContentType::Settings => Ok(BlockContent::Record {
            kind,
            seq,
            payload: Zeroizing::new(content[HEADER_SIZE..].to_vec()),
        }),
    }
}

/// Encrypt and write one record to block `n`. The target must be physically
/// erased; programming a non-erased NOR block cannot set bits back to 1 and
/// would silently produce an invalid block, so we check and reject instead.
pub fn block_write(
    driver: &mut dyn FlashDriver,
    crypt: &DbCrypt,
    kind: ContentType,
    seq: u16,
    payload: &[u8],
    n: usize,
) -> Result<()> {
    if payload.len() > PAYLOAD_SIZE {
        return Err(Error::InvalidInput("record exceeds block capacity"));
    }
    let mut raw = vec![0u8; BLOCK_SIZE];
    driver.read_block(n, &mut raw)?;
    if classify(&raw) != Classification::Erased {
        return Err(Error::Io(anyhow!("write target block {} is not erased", n)));
    }
    let mut content = Zeroizing::new(vec![0u8; CONTENT_SIZE]);
    content[0] = kind.into();
    content[2..4].copy_from_slice(&seq.to_le_bytes());
    content[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    crypt.encrypt(&mut raw, &content)?;
    driver.write_block(n, &raw)
        .map_err(Error::Io)
}

/// Turn block `n` into a deleted block by programming it to all-zero.
pub fn block_delete(driver: &mut dyn FlashDriver, n: usize) -> Result<()> {
    let zero = vec![0u8; BLOCK_SIZE];
    driver.write_block(n, &zero).map_err(Error::Io)
}
