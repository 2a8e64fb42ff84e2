use crate::error::{DataError, Error, Result};
use crate::io::{InputBuffer, OutputBuffer};
use bytes::Bytes;
use std::io::{Read, Write};
use std::str;

pub const ARRAY_MARKER: u8 = b'*';
pub const BULK_MARKER: u8 = b'$';
pub const STATUS_MARKER: u8 = b'+';
pub const ERROR_MARKER: u8 = b'-';
pub const INTEGER_MARKER: u8 = b':';

/// Largest bulk payload accepted from a peer (same ceiling as the server's
/// proto-max-bulk-len).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// One decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "status",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(Some(_)) => "bulk",
            RespValue::BulkString(None) => "nil bulk",
            RespValue::Array(Some(_)) => "array",
            RespValue::Array(None) => "nil array",
        }
    }

    /// Split error replies off into the error channel.
    pub fn into_result(self) -> std::result::Result<RespValue, DataError> {
        match self {
            RespValue::Error(message) => Err(DataError::new(message)),
            other => Ok(other),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }
}

/// Write one request as an array of bulk strings: the command name followed
/// by its arguments. Nothing is flushed.
pub fn send_command<W: Write>(
    out: &mut OutputBuffer<W>,
    command: &[u8],
    args: &[&[u8]],
) -> Result<()> {
    out.write_byte(ARRAY_MARKER)?;
    out.write_usize_crlf(args.len() + 1)?;
    write_bulk(out, command)?;
    for arg in args {
        write_bulk(out, arg)?;
    }
    Ok(())
}

#[inline]
fn write_bulk<W: Write>(out: &mut OutputBuffer<W>, data: &[u8]) -> Result<()> {
    out.write_byte(BULK_MARKER)?;
    out.write_usize_crlf(data.len())?;
    out.write_bytes(data)?;
    out.write_crlf()
}

/// Read one reply, recursing into arrays.
///
/// Error replies come back as [`RespValue::Error`]; only transport failures
/// and unknown markers are returned as `Err`.
pub fn read_reply<R: Read>(input: &mut InputBuffer<R>) -> Result<RespValue> {
    let marker = input.read_byte()?;
    match marker {
        STATUS_MARKER => Ok(RespValue::SimpleString(Bytes::from(input.read_line()?))),
        ERROR_MARKER => {
            let line = input.read_line()?;
            Ok(RespValue::Error(String::from_utf8_lossy(&line).into_owned()))
        }
        INTEGER_MARKER => Ok(RespValue::Integer(parse_integer(&input.read_line()?)?)),
        BULK_MARKER => read_bulk(input),
        ARRAY_MARKER => read_array(input),
        other => Err(Error::Protocol(format!(
            "Unknown reply: {}",
            char::from(other).escape_default()
        ))),
    }
}

fn read_bulk<R: Read>(input: &mut InputBuffer<R>) -> Result<RespValue> {
    let len = parse_integer(&input.read_line()?)?;
    if len == -1 {
        return Ok(RespValue::BulkString(None));
    }
    if !(0..=MAX_BULK_LEN).contains(&len) {
        return Err(Error::Protocol(format!("Invalid bulk length: {}", len)));
    }

    let mut data = vec![0u8; len as usize];
    input.read_exact_block(&mut data)?;

    let cr = input.read_byte()?;
    let lf = input.read_byte()?;
    if cr != b'\r' || lf != b'\n' {
        return Err(Error::Protocol(
            "Missing CRLF after bulk string".to_string(),
        ));
    }
    Ok(RespValue::BulkString(Some(Bytes::from(data))))
}

fn read_array<R: Read>(input: &mut InputBuffer<R>) -> Result<RespValue> {
    let count = parse_integer(&input.read_line()?)?;
    if count == -1 {
        return Ok(RespValue::Array(None));
    }
    if count < 0 {
        return Err(Error::Protocol(format!("Invalid array length: {}", count)));
    }

    // Cap the preallocation; a hostile count should not reserve gigabytes.
    let mut elements = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        elements.push(read_reply(input)?);
    }
    Ok(RespValue::Array(Some(elements)))
}

fn parse_integer(line: &[u8]) -> Result<i64> {
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "Invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// Write one reply the way a server answers a request. Nothing is flushed.
///
/// The client never sends replies; this is the peer side of
/// [`read_reply`], used by in-process test servers.
pub fn write_reply<W: Write>(out: &mut OutputBuffer<W>, value: &RespValue) -> Result<()> {
    match value {
        RespValue::SimpleString(s) => {
            out.write_byte(STATUS_MARKER)?;
            out.write_bytes(s)?;
            out.write_crlf()
        }
        RespValue::Error(message) => {
            out.write_byte(ERROR_MARKER)?;
            out.write_bytes(message.as_bytes())?;
            out.write_crlf()
        }
        RespValue::Integer(n) => {
            out.write_byte(INTEGER_MARKER)?;
            out.write_int_crlf(*n)
        }
        RespValue::BulkString(None) => {
            out.write_byte(BULK_MARKER)?;
            out.write_int_crlf(-1)
        }
        RespValue::BulkString(Some(payload)) => {
            out.write_byte(BULK_MARKER)?;
            out.write_usize_crlf(payload.len())?;
            out.write_bytes(payload)?;
            out.write_crlf()
        }
        RespValue::Array(None) => {
            out.write_byte(ARRAY_MARKER)?;
            out.write_int_crlf(-1)
        }
        RespValue::Array(Some(items)) => {
            out.write_byte(ARRAY_MARKER)?;
            out.write_usize_crlf(items.len())?;
            items.iter().try_for_each(|item| write_reply(out, item))
        }
    }
}
