/// Settings record
///
/// A single distinguished record (ContentType::Settings) holds device-wide
/// boolean flags. It is versioned by the same modular sequence rule as
/// named records.
use super::error::{Error, Result};

const ST_FLAGS: u8 = 1;

const SF_CROSSHAIR: u8 = 1 << 0;
const SF_STRICT_RMT: u8 = 1 << 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Show a crosshair at the tap position
    pub crosshair: bool,
    /// Strict remote-control protocol (panic on error)
    pub strict_rmt: bool,
}

impl Settings {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.crosshair {
            flags |= SF_CROSSHAIR;
        }
        if self.strict_rmt {
            flags |= SF_STRICT_RMT;
        }
        if flags == 0 {
            return vec![];
        }
        vec![ST_FLAGS, 1, flags]
    }

    pub fn decode(payload: &[u8]) -> Result<Settings> {
        let mut settings = Settings::default();
        let mut p = 0;
        while p < payload.len() && payload[p] != 0 {
            if p + 2 > payload.len() {
                return Err(Error::InvalidInput("truncated settings item"));
            }
            let kind = payload[p];
            let len = payload[p + 1] as usize;
            let value = &payload[p + 2..];
            if len > value.len() {
                return Err(Error::InvalidInput("truncated settings value"));
            }
            match kind {
                ST_FLAGS if len == 1 => {
                    settings.crosshair = value[0] & SF_CROSSHAIR != 0;
                    settings.strict_rmt = value[0] & SF_STRICT_RMT != 0;
                }
                _ => return Err(Error::InvalidInput("unknown settings item")),
            }
            p += 2 + len;
        }
        Ok(settings)
    }
}
