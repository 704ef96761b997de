//! Content fingerprints
//!
//! A fingerprint is the 128-bit XXH3 hash of a file's bytes, stored as
//! standard base64 (24 characters). Streaming and one-shot hashing give the
//! same value, so the read strategy never changes the fingerprint.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use xxhash_rust::xxh3::{Xxh3, xxh3_128};

/// Width of the textual encoding as persisted
pub const FINGERPRINT_TEXT_LEN: usize = 24;

/// 128-bit content fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentFingerprint(u128);

impl ContentFingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(xxh3_128(bytes))
    }

    /// Base64 encoding of the big-endian hash bytes
    pub fn encode(&self) -> String {
        STANDARD.encode(self.0.to_be_bytes())
    }

    pub fn decode(text: &str) -> Result<Self, String> {
        if text.len() != FINGERPRINT_TEXT_LEN {
            return Err(format!(
                "fingerprint must be {} characters, got {}",
                FINGERPRINT_TEXT_LEN,
                text.len()
            ));
        }
        let bytes = STANDARD
            .decode(text)
            .map_err(|e| format!("invalid fingerprint '{}': {}", text, e))?;
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| format!("invalid fingerprint width '{}'", text))?;
        Ok(Self(u128::from_be_bytes(raw)))
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ContentFingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl From<ContentFingerprint> for String {
    fn from(fp: ContentFingerprint) -> Self {
        fp.encode()
    }
}

impl TryFrom<String> for ContentFingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

/// Incremental hasher fed chunk by chunk
#[derive(Clone)]
pub struct FingerprintHasher {
    state: Xxh3,
    bytes: u64,
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            state: Xxh3::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.state.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes consumed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finish(&self) -> ContentFingerprint {
        ContentFingerprint(self.state.digest128())
    }
}

/// Hash an async reader to the end using a buffer of `buffer_size` bytes.
/// Returns the fingerprint and the number of bytes read.
pub async fn fingerprint_reader<R>(
    reader: &mut R,
    buffer_size: usize,
) -> std::io::Result<(ContentFingerprint, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = FingerprintHasher::new();
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok((hasher.finish(), hasher.bytes_hashed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_fits_persisted_width() {
        let fp = ContentFingerprint::from_bytes(b"hello world");
        let text = fp.encode();
        assert_eq!(text.len(), FINGERPRINT_TEXT_LEN);
        assert_eq!(ContentFingerprint::decode(&text), Ok(fp));
    }

    #[test]
    fn test_identical_bytes_identical_fingerprint() {
        let a = ContentFingerprint::from_bytes(b"same content");
        let b = ContentFingerprint::from_bytes(b"same content");
        let c = ContentFingerprint::from_bytes(b"other content");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_wrong_width() {
        assert!(ContentFingerprint::decode("abc").is_err());
        assert!(ContentFingerprint::decode("!!!!!!!!!!!!!!!!!!!!!!!!").is_err());
    }

    #[tokio::test]
    async fn test_read_strategy_does_not_change_fingerprint() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let one_shot = ContentFingerprint::from_bytes(&data);

        for buffer_size in [1, 7, 4096, 65_536, 1 << 20] {
            let mut reader = data.as_slice();
            let (streamed, len) = fingerprint_reader(&mut reader, buffer_size).await.unwrap();
            assert_eq!(streamed, one_shot, "buffer size {}", buffer_size);
            assert_eq!(len, data.len() as u64);
        }
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut reader: &[u8] = &[];
        let (fp, len) = fingerprint_reader(&mut reader, 16).await.unwrap();
        assert_eq!(len, 0);
        assert_eq!(fp, ContentFingerprint::from_bytes(&[]));
    }
}
