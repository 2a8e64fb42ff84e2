use crate::error::{DataError, Error, Result};
use crate::io::{InputBuffer, OutputBuffer, DEFAULT_BUFFER_SIZE};
use crate::network::endpoint::{Endpoint, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT};
use crate::protocol::{read_reply, resp, RespValue};
use bytes::Bytes;
use nix::sys::socket::{setsockopt, sockopt};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

/// Whether the connection may still be used.
///
/// `Broken` is permanent: once a transport failure has been seen the
/// connection never goes back to `Open`, even after a successful reconnect
/// would have been possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Open,
    Broken,
}

struct Stream {
    socket: TcpStream,
    input: InputBuffer<TcpStream>,
    output: OutputBuffer<TcpStream>,
}

/// One blocking TCP connection to a server.
///
/// Requests are buffered by [`send_command`](Self::send_command) and only hit
/// the socket when a reply is read or [`flush`](Self::flush) is called, so any
/// number of commands can be pipelined before reading. The connection counts
/// how many replies are still owed and every getter consumes exactly one.
pub struct Connection {
    host: String,
    port: u16,
    timeout: Duration,
    buffer_size: usize,
    stream: Option<Stream>,
    health: Health,
    pipelined: usize,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("connected", &self.stream.is_some())
            .field("health", &self.health)
            .field("pipelined", &self.pipelined)
            .finish()
    }
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            stream: None,
            health: Health::Open,
            pipelined: 0,
        }
    }

    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.host.clone(), endpoint.port).with_timeout(endpoint.timeout)
    }

    /// Zero means no timeout at all.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Capacity of the read and write buffers. Zero is rejected.
    pub fn with_buffer_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("Buffer size <= 0".to_string()));
        }
        self.buffer_size = size;
        Ok(self)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Takes effect on the next connect. Use
    /// [`set_timeout_infinite`](Self::set_timeout_infinite) to change a live socket.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn is_broken(&self) -> bool {
        self.health == Health::Broken
    }

    /// Number of replies sent for but not yet read.
    pub fn pending_replies(&self) -> usize {
        self.pipelined
    }

    /// Forget about owed replies without reading them. Only sensible right
    /// after the caller has consumed them by other means.
    pub fn reset_pipelined_count(&mut self) {
        self.pipelined = 0;
    }

    /// True when a socket exists and still has a peer. Pending socket
    /// errors are left for the next read or write to report.
    pub fn is_connected(&self) -> bool {
        match &self.stream {
            Some(stream) => stream.socket.peer_addr().is_ok(),
            None => false,
        }
    }

    /// Open the socket if it is not already open.
    ///
    /// A transport failure here marks the connection broken.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_broken() {
            return Err(Error::ConnectionBroken);
        }
        if self.is_connected() {
            return Ok(());
        }
        // Drop a half-dead stream before replacing it.
        self.stream = None;

        match self.open_stream() {
            Ok(stream) => {
                debug!(host = %self.host, port = self.port, "Connected");
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, "Connect failed");
                if e.is_connection_error() {
                    self.health = Health::Broken;
                }
                Err(e)
            }
        }
    }

    fn open_stream(&self) -> Result<Stream> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::ConnectionClosed(format!(
                "could not resolve {}:{}",
                self.host, self.port
            )));
        }

        let mut attempt = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no address to connect to",
        ));
        for addr in addrs {
            attempt = if self.timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, self.timeout)
            };
            if attempt.is_ok() {
                break;
            }
        }
        let socket = attempt?;

        configure_socket(&socket)?;
        socket.set_read_timeout(read_timeout(self.timeout))?;

        let input = InputBuffer::with_capacity(socket.try_clone()?, self.buffer_size)?;
        let output = OutputBuffer::with_capacity(socket.try_clone()?, self.buffer_size)?;
        Ok(Stream {
            socket,
            input,
            output,
        })
    }

    /// Shut the socket down and forget any owed replies. Safe to call repeatedly.
    ///
    /// A failed shutdown marks the connection broken.
    pub fn disconnect(&mut self) -> Result<()> {
        self.pipelined = 0;
        match self.stream.take() {
            Some(stream) => {
                debug!(host = %self.host, port = self.port, "Disconnecting");
                self.finish_shutdown(stream.socket.shutdown(Shutdown::Both))
            }
            None => Ok(()),
        }
    }

    fn finish_shutdown(&mut self, result: std::io::Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, "Disconnect failed");
                self.health = Health::Broken;
                Err(e.into())
            }
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.disconnect()
    }

    /// Buffer one request. Nothing is written to the socket yet.
    pub fn send_command(&mut self, command: &[u8], args: &[&[u8]]) -> Result<()> {
        self.connect()?;
        self.with_stream(|stream| resp::send_command(&mut stream.output, command, args))?;
        self.pipelined += 1;
        Ok(())
    }

    /// Push buffered requests onto the socket. A no-op when not connected.
    pub fn flush(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        self.with_stream(|stream| stream.output.flush())
    }

    /// Run `f` against the live stream, marking the connection broken if it
    /// fails at the transport level.
    fn with_stream<T>(&mut self, f: impl FnOnce(&mut Stream) -> Result<T>) -> Result<T> {
        if self.is_broken() {
            return Err(Error::ConnectionBroken);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ConnectionClosed("not connected".to_string()))?;
        let result = f(stream);
        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!(host = %self.host, port = self.port, error = %e, "Connection broken");
                self.health = Health::Broken;
            }
        }
        result
    }

    /// Flush, then read exactly one reply and count it as consumed.
    fn read_one(&mut self) -> Result<RespValue> {
        if self.pipelined == 0 {
            return Err(Error::NoPendingReplies);
        }
        self.with_stream(|stream| stream.output.flush())?;
        self.pipelined -= 1;
        self.with_stream(|stream| read_reply(&mut stream.input))
    }

    /// Next reply with error replies turned into `Err(Error::Data)`.
    fn read_value(&mut self) -> Result<RespValue> {
        Ok(self.read_one()?.into_result()?)
    }

    /// Status reply such as `OK` or `PONG`.
    pub fn get_status_code_reply(&mut self) -> Result<String> {
        match self.read_value()? {
            RespValue::SimpleString(s) => Ok(String::from_utf8_lossy(&s).into_owned()),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Bulk reply decoded as UTF-8 text.
    pub fn get_bulk_reply(&mut self) -> Result<Option<String>> {
        Ok(self
            .get_binary_bulk_reply()?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Bulk reply as raw bytes. A status reply is accepted as well.
    pub fn get_binary_bulk_reply(&mut self) -> Result<Option<Bytes>> {
        match self.read_value()? {
            RespValue::BulkString(b) => Ok(b),
            RespValue::SimpleString(s) => Ok(Some(s)),
            other => Err(unexpected("bulk", &other)),
        }
    }

    pub fn get_integer_reply(&mut self) -> Result<i64> {
        match self.read_value()? {
            RespValue::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Array of bulk replies decoded as text. Nil elements stay `None`.
    pub fn get_multi_bulk_reply(&mut self) -> Result<Option<Vec<Option<String>>>> {
        Ok(self.get_binary_multi_bulk_reply()?.map(|items| {
            items
                .into_iter()
                .map(|item| item.map(|b| String::from_utf8_lossy(&b).into_owned()))
                .collect()
        }))
    }

    pub fn get_binary_multi_bulk_reply(&mut self) -> Result<Option<Vec<Option<Bytes>>>> {
        let items = match self.read_value()? {
            RespValue::Array(None) => return Ok(None),
            RespValue::Array(Some(items)) => items,
            other => return Err(unexpected("array", &other)),
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::BulkString(b) => Ok(b),
                RespValue::SimpleString(s) => Ok(Some(s)),
                RespValue::Error(message) => Err(DataError::new(message).into()),
                other => Err(unexpected("bulk", &other)),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn get_integer_multi_bulk_reply(&mut self) -> Result<Option<Vec<i64>>> {
        let items = match self.read_value()? {
            RespValue::Array(None) => return Ok(None),
            RespValue::Array(Some(items)) => items,
            other => return Err(unexpected("array", &other)),
        };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::Integer(n) => Ok(n),
                RespValue::Error(message) => Err(DataError::new(message).into()),
                other => Err(unexpected("integer", &other)),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Array reply with its elements left undecoded. Error elements stay in
    /// place as [`RespValue::Error`].
    pub fn get_object_multi_bulk_reply(&mut self) -> Result<Option<Vec<RespValue>>> {
        match self.read_value()? {
            RespValue::Array(items) => Ok(items),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Read an array reply that was not announced through
    /// [`send_command`](Self::send_command), such as a pushed message. The
    /// pending count is left alone and nothing is flushed.
    pub fn get_raw_object_multi_bulk_reply(&mut self) -> Result<Option<Vec<RespValue>>> {
        match self.with_stream(|stream| read_reply(&mut stream.input))? {
            RespValue::Array(items) => Ok(items),
            RespValue::Error(message) => Err(DataError::new(message).into()),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Next reply of any shape.
    pub fn get_one(&mut self) -> Result<RespValue> {
        self.read_value()
    }

    /// Drain owed replies in order until only `except` remain unread.
    ///
    /// Error replies are returned in place rather than aborting the drain.
    pub fn get_all(&mut self, except: usize) -> Result<Vec<std::result::Result<RespValue, DataError>>> {
        self.flush()?;
        let mut replies = Vec::with_capacity(self.pipelined.saturating_sub(except));
        while self.pipelined > except {
            replies.push(self.read_one()?.into_result());
        }
        Ok(replies)
    }

    /// Disable the read timeout on the live socket, for blocking commands.
    pub fn set_timeout_infinite(&mut self) -> Result<()> {
        self.connect()?;
        self.with_stream(|stream| {
            stream.socket.set_read_timeout(None)?;
            Ok(())
        })
    }

    /// Put the configured read timeout back after
    /// [`set_timeout_infinite`](Self::set_timeout_infinite).
    pub fn rollback_timeout(&mut self) -> Result<()> {
        let timeout = read_timeout(self.timeout);
        self.with_stream(|stream| {
            stream.socket.set_read_timeout(timeout)?;
            setsockopt(&stream.socket, sockopt::KeepAlive, &true).map_err(std::io::Error::from)?;
            Ok(())
        })
    }

    /// Run `f` with the read timeout disabled, restoring it afterwards even if
    /// `f` fails.
    pub fn with_timeout_infinite<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.set_timeout_infinite()?;
        let result = f(self);
        let rollback = if self.stream.is_some() && !self.is_broken() {
            self.rollback_timeout()
        } else {
            Ok(())
        };
        let value = result?;
        rollback?;
        Ok(value)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!(host = %self.host, port = self.port, error = %e, "Error while dropping connection");
        }
    }
}

fn read_timeout(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// Socket options applied to every fresh connection: address reuse,
/// keep-alive, no Nagle delay and an immediate close on shutdown.
fn configure_socket(socket: &TcpStream) -> Result<()> {
    socket.set_nodelay(true)?;
    setsockopt(socket, sockopt::ReuseAddr, &true).map_err(std::io::Error::from)?;
    setsockopt(socket, sockopt::KeepAlive, &true).map_err(std::io::Error::from)?;
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    setsockopt(socket, sockopt::Linger, &linger).map_err(std::io::Error::from)?;
    Ok(())
}

fn unexpected(expected: &'static str, actual: &RespValue) -> Error {
    Error::UnexpectedReply {
        expected,
        actual: actual.type_name(),
    }
}
