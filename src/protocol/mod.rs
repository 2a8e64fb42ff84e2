//! Wire protocol: request framing and reply decoding.

pub mod command;
pub mod resp;

pub use command::{Command, Keyword};
pub use resp::{read_reply, send_command, write_reply, RespValue};
