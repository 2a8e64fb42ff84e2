//! Command and keyword names as sent on the wire.

/// Commands issued by the built-in client methods.
///
/// Anything not listed here can still be sent by passing raw bytes to
/// `Connection::send_command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Connection
    Ping,
    Echo,
    Auth,
    Select,
    Quit,
    Client,

    // Strings and keys
    Get,
    Set,
    Del,
    Exists,
    Incr,
    IncrBy,
    Expire,
    Ttl,
    MGet,

    // Lists
    RPush,
    LRange,
    BLPop,
    BRPop,
}

impl Command {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Command::Ping => b"PING",
            Command::Echo => b"ECHO",
            Command::Auth => b"AUTH",
            Command::Select => b"SELECT",
            Command::Quit => b"QUIT",
            Command::Client => b"CLIENT",
            Command::Get => b"GET",
            Command::Set => b"SET",
            Command::Del => b"DEL",
            Command::Exists => b"EXISTS",
            Command::Incr => b"INCR",
            Command::IncrBy => b"INCRBY",
            Command::Expire => b"EXPIRE",
            Command::Ttl => b"TTL",
            Command::MGet => b"MGET",
            Command::RPush => b"RPUSH",
            Command::LRange => b"LRANGE",
            Command::BLPop => b"BLPOP",
            Command::BRPop => b"BRPOP",
        }
    }
}

impl AsRef<[u8]> for Command {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Sub-command and option keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    SetName,
    Ex,
}

impl Keyword {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Keyword::SetName => b"SETNAME",
            Keyword::Ex => b"EX",
        }
    }
}

impl AsRef<[u8]> for Keyword {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
