// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content addressing: streaming SHA-256 key computation.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use weft_core::BlobKey;

use crate::BlobError;

const CHUNK: usize = 64 * 1024;

fn digest_to_key(digest: sha2::digest::Output<Sha256>) -> BlobKey {
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    // A 64-char lowercase hex string always validates.
    BlobKey::from_hex(hex).expect("sha256 digest is a valid blob key")
}

/// The content address of an in-memory byte string.
pub fn key_of(content: &[u8]) -> BlobKey {
    digest_to_key(Sha256::digest(content))
}

/// The content address and size of a file, computed in a single streaming
/// pass.
pub async fn key_of_file(path: &Path) -> Result<(BlobKey, u64), BlobError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((digest_to_key(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            key_of(b"hello").as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn file_key_matches_in_memory_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        tokio::fs::write(&path, b"streaming content").await.unwrap();
        let (key, size) = key_of_file(&path).await.unwrap();
        assert_eq!(key, key_of(b"streaming content"));
        assert_eq!(size, 17);
    }
}
