//! Outgoing packet framing.

use std::fmt::{self, Write as _};

use crate::hex::encode_digit;
use crate::{ESCAPE, ESCAPE_XOR, ProtoError, needs_escape};

/// Bytes reserved for the `#hh` trailer.
const TRAILER: usize = 3;

/// Modulo-256 sum of `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Builds a single reply frame.
///
/// The finished frame stays in the writer so it can be retransmitted when
/// the debugger answers with a NACK.
#[derive(Debug)]
pub struct PacketWriter {
    buffer: Vec<u8>,
    capacity: usize,
    finished: bool,
}

impl PacketWriter {
    pub fn new(capacity: usize) -> Self {
        let mut writer = Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            finished: false,
        };
        writer.reset();
        writer
    }

    /// Start a new frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer.push(b'$');
        self.finished = false;
    }

    /// Payload bytes as transmitted (escaped), without framing.
    pub fn payload(&self) -> &[u8] {
        let end = if self.finished {
            self.buffer.len() - TRAILER
        } else {
            self.buffer.len()
        };
        &self.buffer[1..end]
    }

    /// Bytes still available for payload.
    pub const fn remaining(&self) -> usize {
        self.capacity
            .saturating_sub(TRAILER)
            .saturating_sub(self.buffer.len())
    }

    /// Append payload bytes, escaping as needed.
    ///
    /// # Errors
    ///
    /// On overflow nothing from this call is kept.
    pub fn append(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        let mark = self.buffer.len();
        for &byte in data {
            let needed = if needs_escape(byte) { 2 } else { 1 };
            if self.remaining() < needed {
                self.buffer.truncate(mark);
                return Err(ProtoError::Overflow { level: mark });
            }
            if needed == 2 {
                self.buffer.push(ESCAPE);
                self.buffer.push(byte ^ ESCAPE_XOR);
            } else {
                self.buffer.push(byte);
            }
        }
        Ok(())
    }

    pub fn append_str(&mut self, s: &str) -> Result<(), ProtoError> {
        self.append(s.as_bytes())
    }

    /// Append `data` as lowercase hex pairs.
    pub fn append_hex(&mut self, data: &[u8]) -> Result<(), ProtoError> {
        if self.remaining() < data.len() * 2 {
            return Err(ProtoError::Overflow {
                level: self.buffer.len(),
            });
        }
        for &byte in data {
            self.buffer.push(encode_digit(byte >> 4));
            self.buffer.push(encode_digit(byte));
        }
        Ok(())
    }

    /// Append formatted text.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), ProtoError> {
        let mark = self.buffer.len();
        if self.write_fmt(args).is_err() {
            self.buffer.truncate(mark);
            return Err(ProtoError::Overflow { level: mark });
        }
        Ok(())
    }

    /// Close the frame with `#hh` and return the wire bytes.
    ///
    /// # Errors
    ///
    /// Fails if the trailer does not fit.
    pub fn finish(&mut self) -> Result<&[u8], ProtoError> {
        if !self.finished {
            if self.buffer.len() + TRAILER > self.capacity {
                return Err(ProtoError::Overflow {
                    level: self.buffer.len(),
                });
            }
            let sum = checksum(&self.buffer[1..]);
            self.buffer.push(b'#');
            self.buffer.push(encode_digit(sum >> 4));
            self.buffer.push(encode_digit(sum));
            self.finished = true;
        }
        Ok(&self.buffer)
    }

    /// The frame built so far, or the finished frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl fmt::Write for PacketWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes()).map_err(|_| fmt::Error)
    }
}
