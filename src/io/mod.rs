//! Buffered transport: framing-agnostic byte, line and block I/O over a
//! blocking stream.

pub mod input;
pub mod output;

pub use input::{InputBuffer, DEFAULT_BUFFER_SIZE};
pub use output::OutputBuffer;
