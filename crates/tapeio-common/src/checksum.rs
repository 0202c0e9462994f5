//! Digest utilities
//!
//! Objects and archives are identified on tape by their SHA-512 digest.
//! The helpers here compute it incrementally while bytes stream through
//! a reader or a writer, so no payload is ever read twice.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha512};
use std::fmt;
use std::io::{self, Read, Write};

/// Digest algorithm used for objects and archives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[default]
    Sha512,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha512 => write!(f, "SHA-512"),
        }
    }
}

/// A byte count together with the hex digest of those bytes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestWithSize {
    pub size: u64,
    pub digest: String,
}

/// Streaming digest calculator
#[derive(Clone, Default)]
pub struct DigestCalculator {
    sha512: Sha512,
    bytes: u64,
}

impl DigestCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.sha512.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the lowercase hex digest
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.sha512.finalize())
    }

    /// Finalize and return digest and byte count
    #[must_use]
    pub fn finalize(self) -> DigestWithSize {
        let size = self.bytes;
        DigestWithSize {
            size,
            digest: self.finalize_hex(),
        }
    }
}

/// Digest a byte slice in one go
#[must_use]
pub fn digest_bytes(data: &[u8]) -> String {
    let mut calc = DigestCalculator::new();
    calc.update(data);
    calc.finalize_hex()
}

/// Digest everything a reader yields
pub fn digest_reader<R: Read>(reader: R) -> io::Result<DigestWithSize> {
    let mut hashing = HashingReader::new(reader);
    io::copy(&mut hashing, &mut io::sink())?;
    Ok(hashing.finalize())
}

/// Reader adapter that hashes every byte read through it
pub struct HashingReader<R> {
    inner: R,
    calc: DigestCalculator,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            calc: DigestCalculator::new(),
        }
    }

    /// Bytes read so far
    pub const fn bytes(&self) -> u64 {
        self.calc.bytes()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn finalize(self) -> DigestWithSize {
        self.calc.finalize()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.calc.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer adapter that hashes and counts every byte written through it
pub struct HashingWriter<W> {
    inner: W,
    calc: DigestCalculator,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            calc: DigestCalculator::new(),
        }
    }

    /// Bytes written so far
    pub const fn bytes(&self) -> u64 {
        self.calc.bytes()
    }

    pub const fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_parts(self) -> (W, DigestWithSize) {
        (self.inner, self.calc.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.calc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
