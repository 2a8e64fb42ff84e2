use super::input::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};
use std::io::{self, Write};

const CRLF: &[u8] = b"\r\n";

/// Write side of the transport.
///
/// Batches bytes into a fixed buffer and only touches the underlying stream
/// when the buffer fills or [`flush`](Self::flush) is called. Integers and
/// strings are formatted straight into the buffer.
pub struct OutputBuffer<W: Write> {
    inner: W,
    buf: Box<[u8]>,
    count: usize,
}

impl<W: Write> OutputBuffer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: vec![0u8; DEFAULT_BUFFER_SIZE].into_boxed_slice(),
            count: 0,
        }
    }

    /// Create a buffer with the given capacity. Zero is rejected.
    pub fn with_capacity(inner: W, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("Buffer size <= 0".to_string()));
        }
        Ok(Self {
            inner,
            buf: vec![0u8; size].into_boxed_slice(),
            count: 0,
        })
    }

    pub fn write_byte(&mut self, b: u8) -> Result<()> {
        if self.count == self.buf.len() {
            self.flush_buffer()?;
        }
        self.buf[self.count] = b;
        self.count += 1;
        Ok(())
    }

    /// Buffer `data`, flushing first if it does not fit. Payloads at least as
    /// large as the whole buffer go straight to the stream.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() >= self.buf.len() {
            self.flush_buffer()?;
            self.inner.write_all(data)?;
            return Ok(());
        }
        if data.len() > self.buf.len() - self.count {
            self.flush_buffer()?;
        }
        self.buf[self.count..self.count + data.len()].copy_from_slice(data);
        self.count += data.len();
        Ok(())
    }

    pub fn write_crlf(&mut self) -> Result<()> {
        self.write_bytes(CRLF)
    }

    /// Write an ASCII string, one byte per character, then CRLF.
    pub fn write_ascii_crlf(&mut self, text: &str) -> Result<()> {
        if !text.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "non-ASCII text in ASCII line: {:?}",
                text
            )));
        }
        self.write_bytes(text.as_bytes())?;
        self.write_crlf()
    }

    /// Write a string as UTF-8 followed by CRLF.
    ///
    /// Each code point (1 to 4 bytes) is encoded in place and never split
    /// across two flushes.
    pub fn write_utf8_crlf(&mut self, text: &str) -> Result<()> {
        let ascii_len = text.bytes().take_while(u8::is_ascii).count();
        self.write_bytes(&text.as_bytes()[..ascii_len])?;

        let mut scratch = [0u8; 4];
        for ch in text[ascii_len..].chars() {
            let width = ch.len_utf8();
            if width > self.buf.len() {
                self.flush_buffer()?;
                self.inner.write_all(ch.encode_utf8(&mut scratch).as_bytes())?;
                continue;
            }
            if width > self.buf.len() - self.count {
                self.flush_buffer()?;
            }
            ch.encode_utf8(&mut self.buf[self.count..self.count + width]);
            self.count += width;
        }
        self.write_crlf()
    }

    /// Write the decimal form of `value` followed by CRLF.
    pub fn write_int_crlf(&mut self, value: i64) -> Result<()> {
        let mut digits = itoa::Buffer::new();
        self.write_bytes(digits.format(value).as_bytes())?;
        self.write_crlf()
    }

    /// Write a length or count (always non-negative) followed by CRLF.
    pub fn write_usize_crlf(&mut self, value: usize) -> Result<()> {
        let mut digits = itoa::Buffer::new();
        self.write_bytes(digits.format(value).as_bytes())?;
        self.write_crlf()
    }

    /// Push buffered bytes and flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.inner.flush()?;
        Ok(())
    }

    /// Bytes waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.count > 0 {
            let count = self.count;
            self.count = 0;
            self.inner.write_all(&self.buf[..count])?;
        }
        Ok(())
    }
}

impl<W: Write> Write for OutputBuffer<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_bytes(data).map_err(into_io)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputBuffer::flush(self).map_err(into_io)
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}
