use thiserror::Error;

/// Errors visible to callers of the vault core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no entry with this name")]
    NotFound,
    #[error("an entry with this name already exists")]
    Duplicate,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("no erased or reclaimable blocks left")]
    OutOfSpace,
    #[error("storage I/O error: {0}")]
    Io(anyhow::Error),
    #[error("decryption or authentication failed")]
    Crypto,
    #[error("PIN cooldown active, {0} s remaining")]
    Locked(u64),
    #[error("resource busy")]
    Busy,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Io(e)
    }
}
