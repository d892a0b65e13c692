//! Byte-at-a-time packet input state machine.

use crate::hex::decode_digit;
use crate::{ESCAPE, ESCAPE_XOR, INTERRUPT};

/// Input framing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for `$` or a control byte.
    Hunting,
    /// Collecting payload bytes until `#`.
    Payload,
    /// Expecting the first checksum digit.
    Checksum1,
    /// Expecting the second checksum digit.
    Checksum2,
    /// A packet was delivered. Behaves like `Hunting`, except stray bytes
    /// are reported as trailing data.
    Done,
}

/// Something the reader recognised in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// `+` outside a packet.
    Ack,
    /// `-` outside a packet.
    Nack,
    /// Ctrl-C outside a packet.
    Interrupt,
    /// A complete packet with a valid checksum; see [`PacketReader::payload`].
    Packet,
    /// A complete packet whose checksum did not match. `received` is `None`
    /// when the checksum field was not valid hex.
    BadChecksum { received: Option<u8>, computed: u8 },
    /// The payload did not fit; the packet was dropped.
    Overflow,
    /// Unexpected byte while hunting for a packet.
    Junk(u8),
    /// Unexpected byte after a packet.
    Trailing(u8),
}

/// Incremental RSP packet decoder.
///
/// The checksum is summed over the bytes as transmitted. Escaped bytes are
/// stored unescaped.
#[derive(Debug)]
pub struct PacketReader {
    state: State,
    buffer: Vec<u8>,
    capacity: usize,
    escaped: bool,
    sum: u8,
    /// Raw first checksum digit.
    high: Option<u8>,
}

impl PacketReader {
    /// Create a reader that accepts payloads of up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: State::Hunting,
            buffer: Vec::with_capacity(capacity),
            capacity,
            escaped: false,
            sum: 0,
            high: None,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    /// Payload of the last delivered packet.
    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    /// Move the last payload out, leaving the reader ready for the next one.
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Drop any partial packet and go back to hunting.
    pub fn reset(&mut self) {
        self.state = State::Hunting;
        self.start();
    }

    fn start(&mut self) {
        self.buffer.clear();
        self.escaped = false;
        self.sum = 0;
        self.high = None;
    }

    /// Feed one byte.
    pub fn feed(&mut self, byte: u8) -> Option<Event> {
        match self.state {
            State::Hunting | State::Done => self.idle(byte),
            State::Payload => self.payload_byte(byte),
            State::Checksum1 => {
                self.high = Some(byte);
                self.state = State::Checksum2;
                None
            }
            State::Checksum2 => Some(self.checksum(byte)),
        }
    }

    fn idle(&mut self, byte: u8) -> Option<Event> {
        match byte {
            b'$' => {
                self.start();
                self.state = State::Payload;
                None
            }
            b'+' => Some(Event::Ack),
            b'-' => Some(Event::Nack),
            INTERRUPT => Some(Event::Interrupt),
            _ if self.state == State::Done => Some(Event::Trailing(byte)),
            _ => Some(Event::Junk(byte)),
        }
    }

    fn payload_byte(&mut self, byte: u8) -> Option<Event> {
        match byte {
            // A new start marker always restarts the packet.
            b'$' => {
                self.start();
                None
            }
            b'#' if !self.escaped => {
                self.state = State::Checksum1;
                None
            }
            _ => {
                self.sum = self.sum.wrapping_add(byte);
                if byte == ESCAPE && !self.escaped {
                    self.escaped = true;
                    return None;
                }
                if self.buffer.len() >= self.capacity {
                    self.reset();
                    return Some(Event::Overflow);
                }
                let value = if self.escaped {
                    byte ^ ESCAPE_XOR
                } else {
                    byte
                };
                self.escaped = false;
                self.buffer.push(value);
                None
            }
        }
    }

    fn checksum(&mut self, byte: u8) -> Event {
        let computed = self.sum;
        let received = match (self.high.take().and_then(decode_digit), decode_digit(byte)) {
            (Some(hi), Some(lo)) => Some((hi << 4) | lo),
            _ => None,
        };
        if received == Some(computed) {
            self.state = State::Done;
            Event::Packet
        } else {
            self.state = State::Hunting;
            self.buffer.clear();
            Event::BadChecksum { received, computed }
        }
    }
}
