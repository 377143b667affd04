use sha2::{Digest as _, Sha256};
use std::{
    hash::{Hash, Hasher},
    io::{self, Write},
};

use crate::models::Digest;

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                let mut prefix = [0; 8];
                prefix.copy_from_slice(&self.0.finalize().as_bytes()[..8]);
                u64::from_le_bytes(prefix)
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }
}

pub fn blake3_digest(bytes: &[u8]) -> Digest {
    Digest(format!("blake3:{}", blake3::hash(bytes).to_hex()))
}

/// Passes writes through while computing both the blake3 content address
/// and the sha256 diff id of everything written.
pub struct HashingWriter<W> {
    inner: W,
    blake3: blake3::Hasher,
    sha256: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> HashingWriter<W> {
        HashingWriter {
            inner,
            blake3: blake3::Hasher::new(),
            sha256: Sha256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer with the blake3 digest, the sha256 diff id
    /// and the number of bytes written.
    pub fn finish(self) -> (W, Digest, String, u64) {
        let digest = Digest(format!("blake3:{}", self.blake3.finalize().to_hex()));
        let diff_id = format!("sha256:{:x}", self.sha256.finalize());
        (self.inner, digest, diff_id, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.blake3.update(&buf[..written]);
        self.sha256.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
