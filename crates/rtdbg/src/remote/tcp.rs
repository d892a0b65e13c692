//! TCP transport.
//!
//! The device is `host:port`, `:port` or a bare port; the last two listen on
//! the loopback interface. Accept is polled so that [`Remote::end`] can
//! interrupt a pending [`Remote::connect`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rtdbg_target::Remote;
use tracing::{debug, info};

use crate::config::POLL_WAIT;

/// Smallest read timeout; a zero timeout is rejected by the socket layer.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct TcpRemote {
    open: AtomicBool,
    timeout: Mutex<Duration>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    stream: Mutex<Option<Arc<TcpStream>>>,
}

impl TcpRemote {
    pub const NAME: &'static str = "tcp";

    pub fn new() -> Self {
        Self::default()
    }

    /// Address the listener is bound to, once begun.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    fn stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().clone()
    }
}

/// Expand `:port` and bare ports to the loopback interface.
pub fn parse_device(device: &str) -> String {
    if device.starts_with(':') {
        format!("127.0.0.1{device}")
    } else if !device.is_empty() && device.bytes().all(|b| b.is_ascii_digit()) {
        format!("127.0.0.1:{device}")
    } else {
        device.to_string()
    }
}

impl Remote for TcpRemote {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn begin(&self, device: &str, timeout: Duration) -> io::Result<()> {
        let addr = parse_device(device);
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "waiting for debugger");
        *self.timeout.lock() = timeout.max(MIN_TIMEOUT);
        *self.listener.lock() = Some(Arc::new(listener));
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn end(&self) -> io::Result<()> {
        self.open.store(false, Ordering::Release);
        self.listener.lock().take();
        self.disconnect()
    }

    fn connect(&self) -> io::Result<()> {
        loop {
            if !self.open.load(Ordering::Acquire) {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let Some(listener) = self.listener.lock().clone() else {
                return Err(io::ErrorKind::Interrupted.into());
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(*self.timeout.lock()))?;
                    stream.set_nodelay(true)?;
                    info!(%peer, "debugger connected");
                    *self.stream.lock() = Some(Arc::new(stream));
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_WAIT),
                Err(err) => return Err(err),
            }
        }
    }

    fn disconnect(&self) -> io::Result<()> {
        let Some(stream) = self.stream.lock().take() else {
            return Ok(());
        };
        debug!("debugger disconnected");
        match stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream() {
            Some(stream) => (&*stream).read(buf),
            None => Ok(0),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.stream() {
            Some(stream) => (&*stream).write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device(":1122"), "127.0.0.1:1122");
        assert_eq!(parse_device("1122"), "127.0.0.1:1122");
        assert_eq!(parse_device("0.0.0.0:2000"), "0.0.0.0:2000");
    }

    #[test]
    fn test_connect_read_write() {
        let remote = Arc::new(TcpRemote::new());
        remote.begin("0", Duration::from_millis(50)).unwrap();
        let addr = remote.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"+$?#3f").unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        remote.connect().unwrap();
        assert!(remote.is_connected());
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 6 {
            match remote.read(&mut buf) {
                Ok(count) => got.extend_from_slice(&buf[..count]),
                Err(err) => assert!(matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                )),
            }
        }
        assert_eq!(got, b"+$?#3f");
        remote.write_all(b"$OK#9a").unwrap();
        assert_eq!(&client.join().unwrap(), b"$OK#9");

        remote.end().unwrap();
        assert!(!remote.is_connected());
    }

    #[test]
    fn test_end_interrupts_connect() {
        let remote = Arc::new(TcpRemote::new());
        remote.begin("0", Duration::from_millis(50)).unwrap();
        let waiter = {
            let remote = Arc::clone(&remote);
            thread::spawn(move || remote.connect())
        };
        thread::sleep(Duration::from_millis(50));
        remote.end().unwrap();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
