//! Single-endpoint client: the connection handshake, session state and the
//! typed command methods built on [`Connection`].

use crate::error::{DataError, Result};
use crate::network::{Connection, Endpoint};
use crate::protocol::{Command, Keyword, RespValue};
use bytes::Bytes;
use tracing::debug;

/// A connection to one server plus the session state that goes with it.
///
/// The socket is opened lazily. Every fresh socket is authenticated, has its
/// database selected and its name set before the first user command goes out.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    connection: Connection,
    db: i64,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        let connection = Connection::from_endpoint(&endpoint);
        Self::with_connection(endpoint, connection)
    }

    pub fn with_connection(endpoint: Endpoint, connection: Connection) -> Self {
        let db = endpoint.database;
        Self {
            endpoint,
            connection,
            db,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Database currently selected on this session.
    pub fn db(&self) -> i64 {
        self.db
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_broken(&self) -> bool {
        self.connection.is_broken()
    }

    /// Open the socket and run the handshake if not already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.connection.is_connected() {
            return Ok(());
        }
        self.connection.connect()?;
        if let Err(e) = self.handshake() {
            debug!(endpoint = %self.endpoint, error = %e, "Handshake failed");
            // A half-initialised session must not be reused; the next call
            // reconnects and tries again.
            let _ = self.connection.disconnect();
            return Err(e);
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        if let Some(password) = &self.endpoint.password {
            self.connection
                .send_command(Command::Auth.as_bytes(), &[password.as_bytes()])?;
            self.connection.get_status_code_reply()?;
        }
        if self.endpoint.database != 0 {
            let mut buf = itoa::Buffer::new();
            let db = buf.format(self.endpoint.database);
            self.connection
                .send_command(Command::Select.as_bytes(), &[db.as_bytes()])?;
            self.connection.get_status_code_reply()?;
        }
        self.db = self.endpoint.database;
        if let Some(name) = &self.endpoint.client_name {
            self.connection.send_command(
                Command::Client.as_bytes(),
                &[Keyword::SetName.as_bytes(), name.as_bytes()],
            )?;
            self.connection.get_status_code_reply()?;
        }
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.connection.disconnect()
    }

    /// Queue a raw request. Read its reply with one of the connection's getters.
    pub fn send_command(&mut self, command: impl AsRef<[u8]>, args: &[&[u8]]) -> Result<()> {
        self.connect()?;
        self.connection.send_command(command.as_ref(), args)
    }

    /// Drain replies left unread by a caller and go back to the endpoint's
    /// database. Run before a session is handed to someone else.
    pub fn reset_state(&mut self) -> Result<()> {
        if !self.connection.is_connected() {
            self.db = self.endpoint.database;
            return Ok(());
        }
        if self.connection.pending_replies() > 0 {
            self.connection.get_all(0)?;
        }
        if self.db != self.endpoint.database {
            self.select(self.endpoint.database)?;
        }
        Ok(())
    }

    /// Start a batch of commands whose replies are read together.
    pub fn pipelined(&mut self) -> Pipeline<'_> {
        Pipeline { client: self }
    }

    pub fn ping(&mut self) -> Result<String> {
        self.send_command(Command::Ping, &[])?;
        self.connection.get_status_code_reply()
    }

    pub fn echo(&mut self, message: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        self.send_command(Command::Echo, &[message.as_ref()])?;
        self.connection.get_binary_bulk_reply()
    }

    pub fn auth(&mut self, password: &str) -> Result<String> {
        self.send_command(Command::Auth, &[password.as_bytes()])?;
        self.connection.get_status_code_reply()
    }

    pub fn select(&mut self, db: i64) -> Result<String> {
        let mut buf = itoa::Buffer::new();
        self.send_command(Command::Select, &[buf.format(db).as_bytes()])?;
        let status = self.connection.get_status_code_reply()?;
        self.db = db;
        Ok(status)
    }

    /// Ask the server to close the session, then close our side.
    pub fn quit(&mut self) -> Result<String> {
        self.send_command(Command::Quit, &[])?;
        let status = self.connection.get_status_code_reply();
        self.connection.disconnect()?;
        status
    }

    pub fn client_setname(&mut self, name: &str) -> Result<String> {
        self.send_command(
            Command::Client,
            &[Keyword::SetName.as_bytes(), name.as_bytes()],
        )?;
        self.connection.get_status_code_reply()
    }

    pub fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        self.send_command(Command::Get, &[key.as_ref()])?;
        self.connection.get_binary_bulk_reply()
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<String> {
        self.send_command(Command::Set, &[key.as_ref(), value.as_ref()])?;
        self.connection.get_status_code_reply()
    }

    /// `SET key value EX seconds`.
    pub fn set_ex(
        &mut self,
        key: impl AsRef<[u8]>,
        seconds: u64,
        value: impl AsRef<[u8]>,
    ) -> Result<String> {
        let mut buf = itoa::Buffer::new();
        self.send_command(
            Command::Set,
            &[
                key.as_ref(),
                value.as_ref(),
                Keyword::Ex.as_bytes(),
                buf.format(seconds).as_bytes(),
            ],
        )?;
        self.connection.get_status_code_reply()
    }

    /// Number of keys removed.
    pub fn del(&mut self, keys: &[&[u8]]) -> Result<i64> {
        self.send_command(Command::Del, keys)?;
        self.connection.get_integer_reply()
    }

    pub fn exists(&mut self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.send_command(Command::Exists, &[key.as_ref()])?;
        Ok(self.connection.get_integer_reply()? > 0)
    }

    pub fn incr(&mut self, key: impl AsRef<[u8]>) -> Result<i64> {
        self.send_command(Command::Incr, &[key.as_ref()])?;
        self.connection.get_integer_reply()
    }

    pub fn incr_by(&mut self, key: impl AsRef<[u8]>, delta: i64) -> Result<i64> {
        let mut buf = itoa::Buffer::new();
        self.send_command(Command::IncrBy, &[key.as_ref(), buf.format(delta).as_bytes()])?;
        self.connection.get_integer_reply()
    }

    /// True if the timeout was set.
    pub fn expire(&mut self, key: impl AsRef<[u8]>, seconds: u64) -> Result<bool> {
        let mut buf = itoa::Buffer::new();
        self.send_command(Command::Expire, &[key.as_ref(), buf.format(seconds).as_bytes()])?;
        Ok(self.connection.get_integer_reply()? == 1)
    }

    /// Remaining time to live in seconds; -1 without expiry, -2 when missing.
    pub fn ttl(&mut self, key: impl AsRef<[u8]>) -> Result<i64> {
        self.send_command(Command::Ttl, &[key.as_ref()])?;
        self.connection.get_integer_reply()
    }

    pub fn mget(&mut self, keys: &[&[u8]]) -> Result<Vec<Option<Bytes>>> {
        self.send_command(Command::MGet, keys)?;
        Ok(self
            .connection
            .get_binary_multi_bulk_reply()?
            .unwrap_or_default())
    }

    /// Length of the list after the push.
    pub fn rpush(&mut self, key: impl AsRef<[u8]>, values: &[&[u8]]) -> Result<i64> {
        let mut args = Vec::with_capacity(values.len() + 1);
        args.push(key.as_ref());
        args.extend_from_slice(values);
        self.send_command(Command::RPush, &args)?;
        self.connection.get_integer_reply()
    }

    pub fn lrange(&mut self, key: impl AsRef<[u8]>, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let mut start_buf = itoa::Buffer::new();
        let mut stop_buf = itoa::Buffer::new();
        self.send_command(
            Command::LRange,
            &[
                key.as_ref(),
                start_buf.format(start).as_bytes(),
                stop_buf.format(stop).as_bytes(),
            ],
        )?;
        Ok(self
            .connection
            .get_binary_multi_bulk_reply()?
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect())
    }

    /// Blocking pop from the head of the first non-empty list.
    ///
    /// Returns `(key, value)`, or `None` when `timeout_secs` elapsed. A timeout
    /// of zero blocks indefinitely; the socket read timeout is lifted for the
    /// duration of the call either way.
    pub fn blpop(&mut self, timeout_secs: u64, keys: &[&[u8]]) -> Result<Option<(Bytes, Bytes)>> {
        self.blocking_pop(Command::BLPop, timeout_secs, keys)
    }

    /// Blocking pop from the tail; see [`blpop`](Self::blpop).
    pub fn brpop(&mut self, timeout_secs: u64, keys: &[&[u8]]) -> Result<Option<(Bytes, Bytes)>> {
        self.blocking_pop(Command::BRPop, timeout_secs, keys)
    }

    fn blocking_pop(
        &mut self,
        command: Command,
        timeout_secs: u64,
        keys: &[&[u8]],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let mut buf = itoa::Buffer::new();
        let timeout = buf.format(timeout_secs);
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.extend_from_slice(keys);
        args.push(timeout.as_bytes());

        self.connect()?;
        let reply = self.connection.with_timeout_infinite(|conn| {
            conn.send_command(command.as_bytes(), &args)?;
            conn.get_binary_multi_bulk_reply()
        })?;

        Ok(match reply {
            Some(items) => {
                let mut items = items.into_iter();
                match (items.next(), items.next()) {
                    (Some(Some(key)), Some(Some(value))) => Some((key, value)),
                    _ => None,
                }
            }
            None => None,
        })
    }
}

/// Commands queued on a [`Client`] whose replies are collected in one go.
///
/// Dropping a pipeline without syncing leaves the replies owed on the
/// connection; [`Client::reset_state`] drains them.
pub struct Pipeline<'a> {
    client: &'a mut Client,
}

impl Pipeline<'_> {
    /// Queue any command.
    pub fn queue(&mut self, command: impl AsRef<[u8]>, args: &[&[u8]]) -> Result<&mut Self> {
        self.client.send_command(command, args)?;
        Ok(self)
    }

    pub fn get(&mut self, key: impl AsRef<[u8]>) -> Result<&mut Self> {
        self.queue(Command::Get, &[key.as_ref()])
    }

    pub fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<&mut Self> {
        self.queue(Command::Set, &[key.as_ref(), value.as_ref()])
    }

    pub fn incr(&mut self, key: impl AsRef<[u8]>) -> Result<&mut Self> {
        self.queue(Command::Incr, &[key.as_ref()])
    }

    pub fn del(&mut self, keys: &[&[u8]]) -> Result<&mut Self> {
        self.queue(Command::Del, keys)
    }

    /// Replies still owed for queued commands.
    pub fn pending(&self) -> usize {
        self.client.connection.pending_replies()
    }

    /// Read and drop every queued reply.
    pub fn sync(&mut self) -> Result<()> {
        self.client.connection.get_all(0)?;
        Ok(())
    }

    /// Read every queued reply in order. Error replies occupy their slot
    /// instead of aborting the batch.
    pub fn sync_and_return_all(&mut self) -> Result<Vec<std::result::Result<RespValue, DataError>>> {
        self.client.connection.get_all(0)
    }
}
