//! Content hashing
//!
//! Files are streamed through SHA-256 in fixed-size blocks so memory use
//! stays flat regardless of file size.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::DEFAULT_HASH_BLOCK_SIZE;
use crate::error::{CatalogError, CatalogResult};

/// Streams files and produces their content digest
#[derive(Debug, Clone)]
pub struct ContentHasher {
    block_size: usize,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_BLOCK_SIZE)
    }
}

impl ContentHasher {
    /// Create a hasher reading `block_size` bytes at a time
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Compute the lowercase hex SHA-256 digest of a file
    pub fn hash_file(&self, path: &Path) -> CatalogResult<String> {
        let mut file = File::open(path)
            .map_err(|e| CatalogError::hash_error(path.to_path_buf(), e.to_string()))?;
        self.hash_reader(&mut file)
            .map_err(|e| CatalogError::hash_error(path.to_path_buf(), e.to_string()))
    }

    /// Compute the digest of any reader
    pub fn hash_reader<R: Read>(&self, reader: &mut R) -> std::io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.block_size];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}
