//! In-memory transport and a scripted debugger client.
//!
//! The client runs a pump thread that frames the agent's output, answers
//! every packet with `+` straight away and queues what it saw. Tests then
//! consume [`Reply`] items at their own pace without the agent timing out
//! and retransmitting.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rtdbg_proto::{BUFFER_SIZE, Event, PacketReader, PacketWriter};
use rtdbg_target::Remote;
use tracing::trace;

const PUMP_POLL: Duration = Duration::from_millis(20);

/// Default wait for the client helpers.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct PipeState {
    to_agent: VecDeque<u8>,
    to_client: VecDeque<u8>,
    open: bool,
    connected: bool,
    dialing: bool,
    client_closed: bool,
    timeout: Duration,
}

/// Agent side of the pipe.
#[derive(Debug, Default)]
pub struct PipeRemote {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl PipeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dial the agent. Blocks until the agent accepted or `timeout` passed.
    pub fn dial(self: &Arc<Self>, timeout: Duration) -> Option<PipeClient> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.dialing = true;
        state.client_closed = false;
        state.to_agent.clear();
        state.to_client.clear();
        self.ready.notify_all();
        while !state.connected {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                state.dialing = false;
                return None;
            }
        }
        drop(state);

        let (tx, replies) = mpsc::channel();
        let remote = Arc::clone(self);
        thread::Builder::new()
            .name("pipe-pump".into())
            .spawn(move || remote.pump(&tx))
            .ok()?;
        Some(PipeClient {
            remote: Arc::clone(self),
            replies,
        })
    }

    fn pump(&self, tx: &mpsc::Sender<Reply>) {
        let mut reader = PacketReader::new(BUFFER_SIZE);
        loop {
            let bytes: Vec<u8> = {
                let mut state = self.state.lock();
                while state.to_client.is_empty() {
                    if state.client_closed || !state.open {
                        return;
                    }
                    self.ready.wait_for(&mut state, PUMP_POLL);
                }
                state.to_client.drain(..).collect()
            };
            for byte in bytes {
                let reply = match reader.feed(byte) {
                    Some(Event::Ack) => Reply::Ack,
                    Some(Event::Nack) => Reply::Nack,
                    Some(Event::Packet) => {
                        self.client_write(b"+");
                        Reply::Packet(String::from_utf8_lossy(&reader.take_payload()).into_owned())
                    }
                    Some(Event::BadChecksum { .. }) => {
                        self.client_write(b"-");
                        continue;
                    }
                    _ => continue,
                };
                trace!(?reply, "client received");
                if tx.send(reply).is_err() {
                    return;
                }
            }
        }
    }

    fn client_write(&self, data: &[u8]) {
        let mut state = self.state.lock();
        if state.connected {
            state.to_agent.extend(data);
            self.ready.notify_all();
        }
    }
}

impl Remote for PipeRemote {
    fn name(&self) -> &str {
        "pipe"
    }

    fn begin(&self, _device: &str, timeout: Duration) -> io::Result<()> {
        let mut state = self.state.lock();
        state.open = true;
        state.timeout = timeout;
        Ok(())
    }

    fn end(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.open = false;
        state.connected = false;
        self.ready.notify_all();
        Ok(())
    }

    fn connect(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        loop {
            if !state.open {
                return Err(io::ErrorKind::Interrupted.into());
            }
            if state.dialing {
                state.dialing = false;
                state.connected = true;
                self.ready.notify_all();
                return Ok(());
            }
            self.ready.wait(&mut state);
        }
    }

    fn disconnect(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        self.ready.notify_all();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let deadline = Instant::now() + state.timeout;
        loop {
            if !state.to_agent.is_empty() {
                let count = buf.len().min(state.to_agent.len());
                for (slot, byte) in buf.iter_mut().zip(state.to_agent.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }
            if !state.connected || !state.open {
                return Ok(0);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Err(io::ErrorKind::TimedOut.into());
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.to_client.extend(buf);
        self.ready.notify_all();
        Ok(buf.len())
    }
}

/// What the client saw from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    Packet(String),
}

/// Debugger side of the pipe.
pub struct PipeClient {
    remote: Arc<PipeRemote>,
    replies: Receiver<Reply>,
}

impl PipeClient {
    /// Send raw bytes.
    pub fn send_raw(&self, data: &[u8]) {
        self.remote.client_write(data);
    }

    /// Frame and send a packet.
    pub fn send(&self, payload: &str) {
        let mut out = PacketWriter::new(BUFFER_SIZE);
        if out.append_str(payload).is_ok() {
            if let Ok(frame) = out.finish() {
                self.send_raw(frame);
            }
        }
    }

    /// Next reply item.
    pub fn next(&self, timeout: Duration) -> Option<Reply> {
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next packet, skipping acks.
    pub fn packet(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next(left)? {
                Reply::Packet(payload) => return Some(payload),
                Reply::Ack | Reply::Nack => {}
            }
        }
    }

    /// Send a packet, expect the ack and return the reply payload.
    pub fn request(&self, payload: &str) -> Option<String> {
        self.send(payload);
        match self.next(CLIENT_TIMEOUT)? {
            Reply::Ack => self.packet(CLIENT_TIMEOUT),
            other => {
                trace!(?other, payload, "expected ack");
                None
            }
        }
    }

    /// Drop the connection.
    pub fn close(&self) {
        let mut state = self.remote.state.lock();
        state.client_closed = true;
        state.connected = false;
        self.remote.ready.notify_all();
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Arc<PipeRemote> {
        let remote = PipeRemote::new();
        remote.begin("", Duration::from_millis(50)).unwrap();
        remote
    }

    fn accept(remote: &Arc<PipeRemote>) -> thread::JoinHandle<io::Result<()>> {
        let agent = Arc::clone(remote);
        thread::spawn(move || agent.connect())
    }

    #[test]
    fn test_connect_and_exchange() {
        let remote = open();
        let agent = accept(&remote);
        let client = remote.dial(CLIENT_TIMEOUT).unwrap();
        agent.join().unwrap().unwrap();
        assert!(remote.is_connected());

        client.send("g");
        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"$g#67");

        remote.write(b"+$OK#9a").unwrap();
        assert_eq!(client.next(CLIENT_TIMEOUT), Some(Reply::Ack));
        assert_eq!(client.next(CLIENT_TIMEOUT), Some(Reply::Packet("OK".into())));

        // The pump acknowledged the packet.
        let n = remote.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"+");
    }

    #[test]
    fn test_read_timeout_and_disconnect() {
        let remote = open();
        let agent = accept(&remote);
        let client = remote.dial(CLIENT_TIMEOUT).unwrap();
        agent.join().unwrap().unwrap();

        let mut buf = [0u8; 4];
        let err = remote.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        client.close();
        assert_eq!(remote.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_end_interrupts_connect() {
        let remote = open();
        let agent = accept(&remote);
        thread::sleep(Duration::from_millis(20));
        remote.end().unwrap();
        let err = agent.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
