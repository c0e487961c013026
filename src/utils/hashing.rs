use crate::error::WriteError;
use crate::models::CancelToken;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// A SHA-256 digest. Parsed from and displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Digest([u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestParseError {
    #[error("invalid hex in SHA256 digest: {0}")]
    Hex(String),
    #[error("SHA256 digest must be 32 bytes, got {0}")]
    Length(usize),
}

impl Sha256Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl FromStr for Sha256Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| DigestParseError::Hex(e.to_string()))?;
        let len = bytes.len();
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DigestParseError::Length(len))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = DigestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Sha256Digest> for String {
    fn from(value: Sha256Digest) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

/// Incremental SHA-256 over chunks as they stream past.
#[derive(Clone, Default)]
pub struct StreamingHasher {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Sha256Digest {
        Sha256Digest(self.hasher.finalize().into())
    }
}

/// Hash a reader to EOF in `chunk_size` reads, checking for cancellation
/// between reads. `on_progress` receives the running byte count.
pub fn hash_reader<R, P, E>(
    mut reader: R,
    chunk_size: usize,
    cancel: &CancelToken,
    mut on_progress: P,
    map_err: E,
) -> Result<(Sha256Digest, u64), WriteError>
where
    R: Read,
    P: FnMut(u64),
    E: Fn(io::Error) -> WriteError,
{
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; chunk_size];

    loop {
        cancel.check()?;

        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_err(e)),
        };

        hasher.update(&buffer[..n]);
        on_progress(hasher.bytes());
    }

    let total = hasher.bytes();
    let digest = hasher.finalize();
    debug!("Hashed {} bytes: {}", total, digest);
    Ok((digest, total))
}
