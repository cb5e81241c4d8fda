//! Netascii translation: LF -> CRLF, bare CR -> CR NUL (RFC 1350 §4).
//!
//! Mirrors `fbtftp.netascii.NetasciiReader`: encoding is lazy (only as
//! many bytes of the source are touched as a caller actually reads), but
//! `size()` requires the whole stream to be known, so the first call to
//! `size()` materializes and caches the remainder of the translated
//! output.

use std::io;

use crate::session::ByteSource;

pub struct NetasciiEncoder {
    inner: Box<dyn ByteSource>,
    /// Bytes already translated but not yet handed to a caller of `read`.
    residual: Vec<u8>,
    /// Set once the whole source has been read and translated.
    materialized: bool,
    /// True once `inner` has yielded an empty read (EOF).
    source_exhausted: bool,
}

impl NetasciiEncoder {
    pub fn new(inner: Box<dyn ByteSource>) -> Self {
        Self {
            inner,
            residual: Vec::new(),
            materialized: false,
            source_exhausted: false,
        }
    }

    fn translate_chunk(chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &b in chunk {
            match b {
                b'\n' => {
                    out.push(b'\r');
                    out.push(b'\n');
                }
                b'\r' => {
                    out.push(b'\r');
                    out.push(0);
                }
                _ => out.push(b),
            }
        }
        out
    }

    fn materialize(&mut self) -> io::Result<()> {
        if self.materialized {
            return Ok(());
        }
        loop {
            let chunk = self.inner.read(64 * 1024)?;
            if chunk.is_empty() {
                break;
            }
            self.residual.extend(Self::translate_chunk(&chunk));
        }
        self.source_exhausted = true;
        self.materialized = true;
        Ok(())
    }
}

impl ByteSource for NetasciiEncoder {
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        while self.residual.len() < n && !self.source_exhausted {
            let chunk = self.inner.read(n.max(4096))?;
            if chunk.is_empty() {
                self.source_exhausted = true;
                break;
            }
            self.residual.extend(Self::translate_chunk(&chunk));
        }
        let take = n.min(self.residual.len());
        Ok(self.residual.drain(..take).collect())
    }

    fn size(&mut self) -> Option<u64> {
        self.materialize().ok()?;
        Some(self.residual.len() as u64)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
