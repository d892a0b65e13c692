//! Byte-stream transport to the debugger.

use std::io;
use std::time::Duration;

/// A transport the agent accepts one debugger connection on at a time.
pub trait Remote: Send + Sync {
    /// Registry name, for example `tcp`.
    fn name(&self) -> &str;

    /// Open the device (a port, a serial line). `timeout` bounds each read.
    fn begin(&self, device: &str, timeout: Duration) -> io::Result<()>;

    /// Close the device and wake a pending [`Remote::connect`].
    fn end(&self) -> io::Result<()>;

    /// Wait for a debugger.
    ///
    /// Fails with [`io::ErrorKind::Interrupted`] once [`Remote::end`] has
    /// been called.
    fn connect(&self) -> io::Result<()>;

    fn disconnect(&self) -> io::Result<()>;

    fn is_connected(&self) -> bool;

    /// Read available bytes.
    ///
    /// Returns `Ok(0)` when the debugger went away, and an error of kind
    /// [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`] when
    /// nothing arrived within the timeout.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Write all of `buf`.
    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}
