//! SHA-512 hashing over on-disk files.

use std::path::Path;

use sha2::{Digest, Sha512};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::error::Result;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex-encoded SHA-512 of a file, reading in chunks so
/// multi-gigabyte images never land in memory at once.
pub async fn sha512_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex-encoded SHA-512 of an in-memory buffer.
pub fn sha512_hex(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
