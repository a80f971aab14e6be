/// One-time passwords (RFC 4226 HOTP, RFC 6238 TOTP) and the base32
/// secret encoding (RFC 4648) used to enter and display OTP keys.
use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::Zeroize;

use super::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// TOTP step, in seconds
pub const TOTP_PERIOD: u64 = 30;

/// Dynamically truncated HMAC-SHA1 of the 8-byte big-endian counter.
pub fn hotp(key: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC-SHA1 takes any key length");
    mac.update(&counter.to_be_bytes());
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&mac.finalize().into_bytes());
    let i = (hash[19] & 15) as usize;
    let res = (hash[i] as u32 & 0x7f) << 24
        | (hash[i + 1] as u32) << 16
        | (hash[i + 2] as u32) << 8
        | hash[i + 3] as u32;
    hash.zeroize();
    res
}

/// The usual 6-digit HOTP code.
pub fn hotp_code(key: &[u8], counter: u64) -> u32 {
    hotp(key, counter) % 1_000_000
}

/// 6-digit TOTP code for a Unix timestamp.
pub fn totp_code(key: &[u8], unix_time: u64) -> u32 {
    hotp_code(key, unix_time / TOTP_PERIOD)
}

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::new();
    for chunk in data.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..chunk.len()].copy_from_slice(chunk);
        let v = u64::from_be_bytes([0, 0, 0, buf[0], buf[1], buf[2], buf[3], buf[4]]);
        let symbols = (chunk.len() * 8 + 4) / 5;
        for s in 0..8 {
            if s < symbols {
                out.push(ALPHABET[(v >> (35 - 5 * s)) as usize & 31] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

/// Decode base32; case-insensitive, padding optional.
pub fn base32_decode(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut acc: u32 = 0;
    let mut bits = 0;
    for c in s.chars() {
        if c == '=' {
            break;
        }
        let v = match c {
            'A'..='Z' => c as u32 - 'A' as u32,
            'a'..='z' => c as u32 - 'a' as u32,
            '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => return Err(Error::InvalidInput("bad base32 character")),
        };
        acc = acc << 5 | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    // leftover bits must be zero padding
    if bits > 0 && acc & ((1 << bits) - 1) != 0 {
        return Err(Error::InvalidInput("trailing base32 bits"));
    }
    Ok(out)
}
