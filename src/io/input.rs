use crate::error::{Error, Result};
use memchr::memchr;
use std::cmp;
use std::io::{self, Read};

/// Default capacity of the read and write buffers (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Read side of the transport.
///
/// Fills a fixed buffer from the underlying stream and serves byte, line and
/// block reads out of it. Not synchronized; one owner per connection.
pub struct InputBuffer<R> {
    inner: R,
    buf: Box<[u8]>,
    pos: usize,
    limit: usize,
}

impl<R: Read> InputBuffer<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; DEFAULT_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            limit: 0,
        }
    }

    /// Create a buffer with the given capacity. Zero is rejected.
    pub fn with_capacity(inner: R, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("Buffer size <= 0".to_string()));
        }
        Ok(Self {
            inner,
            buf: vec![0u8; size].into_boxed_slice(),
            pos: 0,
            limit: 0,
        })
    }

    /// Read the next byte, refilling when the buffer is drained.
    pub fn read_byte(&mut self) -> Result<u8> {
        if self.pos == self.limit {
            self.fill()?;
            if self.limit == 0 {
                return Err(Error::ConnectionClosed(
                    "unexpected end of stream".to_string(),
                ));
            }
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Read one CRLF-terminated line, without the terminator.
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::with_capacity(32);
        self.read_line_into(&mut line)?;
        Ok(line)
    }

    /// Same as [`read_line`](Self::read_line) but reuses the caller's buffer.
    ///
    /// A CR not followed by LF is kept as data. A trailing CR right before
    /// end-of-stream ends the line. Reaching end-of-stream with nothing
    /// accumulated means the peer closed the connection.
    pub fn read_line_into(&mut self, line: &mut Vec<u8>) -> Result<()> {
        line.clear();
        loop {
            if self.pos == self.limit {
                self.fill()?;
                if self.limit == 0 {
                    break;
                }
            }

            let chunk = &self.buf[self.pos..self.limit];
            let Some(cr) = memchr(b'\r', chunk) else {
                line.extend_from_slice(chunk);
                self.pos = self.limit;
                continue;
            };

            line.extend_from_slice(&chunk[..cr]);
            self.pos += cr + 1;

            if self.pos == self.limit {
                self.fill()?;
                if self.limit == 0 {
                    break;
                }
            }

            if self.buf[self.pos] == b'\n' {
                self.pos += 1;
                return Ok(());
            }
            line.push(b'\r');
        }

        if line.is_empty() {
            return Err(Error::ConnectionClosed(
                "It seems like server has closed the connection.".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy up to `out.len()` bytes, refilling as often as needed.
    ///
    /// Returns the number of bytes copied; fewer than requested (possibly 0)
    /// only when the stream ended.
    pub fn read_block(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        while copied < out.len() {
            let n = self.read(&mut out[copied..])?;
            if n == 0 {
                break;
            }
            copied += n;
        }
        Ok(copied)
    }

    /// Fill `out` completely or fail with a connection error.
    pub fn read_exact_block(&mut self, out: &mut [u8]) -> Result<()> {
        let copied = self.read_block(out)?;
        if copied < out.len() {
            return Err(Error::ConnectionClosed(format!(
                "stream ended after {} of {} bytes",
                copied,
                out.len()
            )));
        }
        Ok(())
    }

    /// Bytes already buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.limit - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self) -> io::Result<()> {
        self.pos = 0;
        self.limit = 0;
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(n) => {
                    self.limit = n;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Read for InputBuffer<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.limit {
            self.fill()?;
            if self.limit == 0 {
                return Ok(0);
            }
        }
        let n = cmp::min(self.limit - self.pos, out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
