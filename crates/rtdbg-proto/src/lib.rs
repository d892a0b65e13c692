//! GDB remote serial protocol (RSP) wire layer.
//!
//! Everything here is transport and target agnostic: bytes in, packets out,
//! and replies framed back into bytes.
//!
//! ```ignore
//! use rtdbg_proto::{Event, PacketReader, PacketWriter};
//!
//! let mut reader = PacketReader::new(BUFFER_SIZE);
//! for &byte in b"$g#67" {
//!     if let Some(Event::Packet) = reader.feed(byte) {
//!         assert_eq!(reader.payload(), b"g");
//!     }
//! }
//!
//! let mut out = PacketWriter::new(BUFFER_SIZE);
//! out.reset();
//! out.append(b"OK")?;
//! assert_eq!(out.finish()?, b"$OK#9a");
//! ```

pub mod hex;
mod reader;
mod thread_id;
mod writer;

pub use reader::{Event, PacketReader, State};
pub use thread_id::ThreadId;
pub use writer::{PacketWriter, checksum};

use thiserror::Error;

/// Size of the input and output packet buffers.
pub const BUFFER_SIZE: usize = 2048;

/// Escape byte used on the wire, `}` in both directions as GDB sends it.
pub const ESCAPE: u8 = b'}';

/// Value XOR-ed into an escaped byte.
pub const ESCAPE_XOR: u8 = 0x20;

/// Interrupt byte sent by the debugger (Ctrl-C).
pub const INTERRUPT: u8 = 0x03;

/// Payload synthesized for an interrupt byte.
pub const BREAK_COMMAND: &[u8] = b"^C";

/// Protocol codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("output overflow at {level} bytes")]
    Overflow { level: usize },

    #[error("invalid hex digit: {0:#04x}")]
    InvalidHex(u8),

    #[error("hex data too short: need {expected} bytes, got {actual}")]
    ShortHex { expected: usize, actual: usize },
}

/// Returns true if `byte` must be escaped in a packet payload.
#[inline]
pub const fn needs_escape(byte: u8) -> bool {
    matches!(byte, b'#' | b'$' | ESCAPE)
}
