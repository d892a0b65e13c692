//! Thread-id fields: bare hex (`1a`) or multiprocess form (`p1.1a`).

use std::fmt;

use crate::hex::{after, decode_uint};

/// A decoded thread-id field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId {
    /// Process id. For the bare form this repeats the thread value.
    pub pid: u64,
    /// Thread id, `u64::MAX` for "all" and `0` for "any".
    pub tid: u64,
    /// True when the `p<pid>.<tid>` form was used.
    pub extended: bool,
}

impl ThreadId {
    /// Marker for "all threads" (`-1` on the wire).
    pub const ALL: u64 = u64::MAX;
    /// Marker for "any thread" (`0` on the wire).
    pub const ANY: u64 = 0;

    /// Decode a thread-id field. Trailing bytes after the id are ignored.
    pub fn decode(data: &[u8]) -> Self {
        let (extended, data) = match data.split_first() {
            Some((b'p', rest)) => (true, rest),
            _ => (false, data),
        };
        let pid = decode_uint(data);
        let mut tid = pid;
        if extended {
            if let Some(rest) = after(data, b'.') {
                tid = decode_uint(rest);
            }
        }
        Self { pid, tid, extended }
    }

    /// Build the multiprocess form for a reply.
    pub const fn new(pid: u64, tid: u64) -> Self {
        Self {
            pid,
            tid,
            extended: true,
        }
    }

    pub const fn is_all(&self) -> bool {
        self.tid == Self::ALL
    }

    pub const fn is_any(&self) -> bool {
        self.tid == Self::ANY
    }

    /// Returns true if the process part addresses `pid`.
    ///
    /// The bare form carries no process, and `0`/`-1` mean any process.
    pub const fn matches_pid(&self, pid: u64) -> bool {
        !self.extended || self.pid == 0 || self.pid == Self::ALL || self.pid == pid
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "p{:x}.", self.pid)?;
        }
        if self.tid == Self::ALL {
            f.write_str("-1")
        } else {
            write!(f, "{:08x}", self.tid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bare() {
        let id = ThreadId::decode(b"0a010001");
        assert!(!id.extended);
        assert_eq!(id.tid, 0x0a01_0001);
        assert!(id.matches_pid(42));
    }

    #[test]
    fn test_decode_extended() {
        let id = ThreadId::decode(b"p1.0a010002;c");
        assert!(id.extended);
        assert_eq!(id.pid, 1);
        assert_eq!(id.tid, 0x0a01_0002);
        assert!(id.matches_pid(1));
        assert!(!id.matches_pid(2));
    }

    #[test]
    fn test_decode_all() {
        assert!(ThreadId::decode(b"p1.-1").is_all());
        assert!(ThreadId::decode(b"-1").is_all());
        assert!(ThreadId::decode(b"0").is_any());
    }

    #[test]
    fn test_display() {
        assert_eq!(ThreadId::new(1, 0x0a01_0001).to_string(), "p1.0a010001");
        assert_eq!(ThreadId::new(1, ThreadId::ALL).to_string(), "p1.-1");
    }
}
