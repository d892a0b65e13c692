//! Debug server: session state, the packet loop and the events task.
//!
//! One [`Server`] exists per started agent. Its server task accepts a
//! debugger, runs a session until the debugger goes away and waits for the
//! next one. Each session owns an events task that reports stops raised by
//! tasks parking in the exception handler.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use rtdbg_proto::{BREAK_COMMAND, Event, PacketReader, PacketWriter, ThreadId};
use rtdbg_target::{Kernel, KernelError, Remote, Target, TaskId};

use crate::breakpoints::Breakpoints;
use crate::config::{
    BUFFER_SIZE, EVENTS_TASK, POLL_WAIT, SERVER_TASK, STOP_TIMEOUT, StartOptions,
};
use crate::exception::Rendezvous;
use crate::threads::{AgentTasks, Env, Threads};
use crate::{Error, Result, commands, cpus, metrics};

/// Protocol trace target.
const REMOTE_TRACE: &str = "rtdbg::remote";

/// Session mode flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Mode {
    /// Progress messages at `info` level.
    pub verbose: bool,
    /// Log every dispatched command.
    pub verbose_commands: bool,
    /// Log raw packets.
    pub remote_debug: bool,
    /// `vCont` negotiated; legacy `c` and `s` are then unsupported.
    pub vcont: bool,
    /// Reset the system when the session ends.
    pub reset: bool,
}

/// Events task bookkeeping.
#[derive(Debug, Default)]
pub struct EventsTask {
    pub id: Option<TaskId>,
    pub running: bool,
    pub finished: bool,
    /// A task parked since the last wake.
    pub pending: bool,
}

/// State guarded by the session lock.
#[derive(Debug)]
pub struct Session {
    pub mode: Mode,
    pub ack_pending: bool,
    pub threads: Threads,
    pub breakpoints: Breakpoints,
    /// Tasks parked in the exception handler, oldest first.
    pub exceptions: Vec<Arc<Rendezvous>>,
    pub events: EventsTask,
    reader: PacketReader,
    input: VecDeque<u8>,
    pub output: PacketWriter,
}

impl Session {
    fn new() -> Self {
        Self {
            mode: Mode::default(),
            ack_pending: false,
            threads: Threads::new(),
            breakpoints: Breakpoints::new(),
            exceptions: Vec::new(),
            events: EventsTask::default(),
            reader: PacketReader::new(BUFFER_SIZE),
            input: VecDeque::new(),
            output: PacketWriter::new(BUFFER_SIZE),
        }
    }

    /// Forget the protocol state of a finished session. Logging switches
    /// survive.
    fn end(&mut self) {
        self.mode = Mode {
            verbose: self.mode.verbose,
            verbose_commands: self.mode.verbose_commands,
            remote_debug: self.mode.remote_debug,
            ..Mode::default()
        };
        self.ack_pending = false;
        self.reader.reset();
        self.input.clear();
        self.output.reset();
    }
}

/// The debug agent.
pub struct Server {
    pub(crate) options: StartOptions,
    pub(crate) pid: u32,
    pub(crate) remote: Arc<dyn Remote>,
    pub(crate) target: Arc<dyn Target>,
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) state: Mutex<Session>,
    pub(crate) agents: AgentTasks,
    server_task: Mutex<Option<TaskId>>,
    /// Wakes the events task, and the teardown waiting for it.
    pub(crate) events: Condvar,
    running: AtomicBool,
    finished: Mutex<bool>,
    finished_cond: Condvar,
}

impl Server {
    pub fn new(
        options: StartOptions,
        remote: Arc<dyn Remote>,
        target: Arc<dyn Target>,
        kernel: Arc<dyn Kernel>,
    ) -> Self {
        let pid = options.pid.unwrap_or_else(|| kernel.pid());
        Self {
            options,
            pid,
            remote,
            target,
            kernel,
            state: Mutex::new(Session::new()),
            agents: AgentTasks::new(),
            server_task: Mutex::new(None),
            events: Condvar::new(),
            running: AtomicBool::new(false),
            finished: Mutex::new(true),
            finished_cond: Condvar::new(),
        }
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn remote_name(&self) -> &str {
        self.remote.name()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.remote.is_connected()
    }

    /// The agent's own tasks.
    pub const fn agents(&self) -> &AgentTasks {
        &self.agents
    }

    /// Lock the session.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.state.lock()
    }

    pub(crate) fn env(&self) -> Env<'_> {
        Env {
            target: &*self.target,
            kernel: &*self.kernel,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the server task.
    pub(crate) fn launch(self: &Arc<Self>) -> Result<TaskId> {
        self.running.store(true, Ordering::Release);
        *self.finished.lock() = false;
        let server = Arc::clone(self);
        let spawned = self.agents.spawn(
            &*self.kernel,
            SERVER_TASK,
            self.options.priority,
            Box::new(move || server.main_loop()),
        );
        match spawned {
            Ok(id) => {
                *self.server_task.lock() = Some(id);
                Ok(id)
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                *self.finished.lock() = true;
                Err(err.into())
            }
        }
    }

    fn main_loop(self: &Arc<Self>) {
        info!(remote = self.remote.name(), pid = self.pid, "remote running");
        while self.is_running() {
            if let Err(err) = self.remote.connect() {
                if self.is_running() {
                    warn!(%err, "connect failed");
                }
                break;
            }
            metrics::record_session();
            match self.run_session() {
                Ok(()) | Err(Error::Disconnected) => {}
                Err(err) => warn!(%err, "session ended"),
            }
            if self.remote.is_connected() {
                if let Err(err) = self.remote.disconnect() {
                    debug!(%err, "disconnect failed");
                }
            }
        }
        info!("remote finishing");
        self.running.store(false, Ordering::Release);
        *self.finished.lock() = true;
        self.finished_cond.notify_all();
    }

    /// Stop serving after a fault in the agent's own tasks.
    pub fn crash(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(err) = self.remote.end() {
            warn!(%err, "remote end failed");
        }
    }

    /// Stop the server task and close the transport.
    pub(crate) fn destroy(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let mut result = Ok(());
        if self.remote.is_connected() {
            result = self.remote.disconnect().map_err(Error::from);
        }
        if let Err(err) = self.remote.end() {
            if result.is_ok() {
                result = Err(err.into());
            }
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        let finished = {
            let mut finished = self.finished.lock();
            while !*finished {
                if self
                    .finished_cond
                    .wait_until(&mut finished, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            *finished
        };
        let task = self.server_task.lock().take();
        if let Some(id) = task {
            if !finished {
                warn!("server task did not stop");
                match self.kernel.delete(id) {
                    Ok(()) | Err(KernelError::NotFound(_)) => {}
                    Err(err) => warn!(task = %id, %err, "server task not deleted"),
                }
            }
            self.agents.remove(id);
        }
        result
    }

    // ========================================================================
    // Session
    // ========================================================================

    fn run_session(self: &Arc<Self>) -> Result<()> {
        let mut session = self.state.lock();
        let verbose = session.mode.verbose;
        if verbose {
            info!("session starting");
        }
        session.end();

        if let Err(err) = self.suspend(&mut session) {
            warn!(%err, "suspend on connect failed");
        }

        session.events = EventsTask {
            running: true,
            ..EventsTask::default()
        };
        let server = Arc::clone(self);
        let spawned = self.agents.spawn(
            &*self.kernel,
            EVENTS_TASK,
            self.options.priority,
            Box::new(move || server.events_loop()),
        );
        let result = match spawned {
            Ok(id) => {
                session.events.id = Some(id);
                self.packet_loop(&mut session)
            }
            Err(err) => {
                session.events.running = false;
                session.events.finished = true;
                Err(err.into())
            }
        };

        self.stop_events(&mut session);

        let env = self.env();
        let Session {
            threads,
            breakpoints,
            exceptions,
            ..
        } = &mut *session;
        if let Err(err) = threads.system_resume(env, breakpoints, exceptions, true) {
            warn!(%err, "resume on disconnect failed");
        }
        if let Err(err) = breakpoints.remove_all(&*self.target) {
            warn!(%err, "breakpoint removal failed");
        }
        breakpoints.clear();
        metrics::record_breakpoints(0);

        if session.mode.reset {
            warn!("reset requested by the debugger");
            self.kernel.reset();
        }
        session.end();
        if verbose {
            info!("session finished");
        }
        result
    }

    fn stop_events(&self, session: &mut MutexGuard<'_, Session>) {
        session.events.running = false;
        self.events.notify_all();
        let deadline = Instant::now() + STOP_TIMEOUT;
        while !session.events.finished {
            let wait = deadline.saturating_duration_since(Instant::now()).min(POLL_WAIT);
            if wait.is_zero() {
                break;
            }
            self.events.wait_for(session, wait);
        }
        if let Some(id) = session.events.id {
            if !session.events.finished {
                warn!("events task did not stop");
                match self.kernel.delete(id) {
                    Ok(()) | Err(KernelError::NotFound(_)) => {}
                    Err(err) => warn!(task = %id, %err, "events task not deleted"),
                }
            }
            self.agents.remove(id);
        }
        session.events = EventsTask::default();
    }

    fn packet_loop(&self, session: &mut MutexGuard<'_, Session>) -> Result<()> {
        while self.is_running() && self.remote.is_connected() {
            let packet = self.packet_in(session)?;
            if let Some(&command) = packet.first() {
                metrics::record_packet_in(command);
            }
            commands::dispatch(self, session, &packet)?;
        }
        Ok(())
    }

    // ========================================================================
    // Events task
    // ========================================================================

    fn events_loop(&self) {
        let target = Arc::clone(&self.target);
        let enabled = cpus::run_across_processors(
            &self.kernel,
            &self.agents,
            self.options.priority,
            move |cpu| target.enable(cpu).map_err(Error::from),
        );

        let mut session = self.state.lock();
        if session.mode.verbose {
            info!("events running");
        }
        match enabled {
            Ok(()) => {
                while session.events.running {
                    if !session.events.pending {
                        self.events.wait(&mut session);
                        continue;
                    }
                    session.events.pending = false;
                    if let Err(err) = self.report_event(&mut session) {
                        error!(%err, "error in events");
                        if err.is_fatal() {
                            break;
                        }
                    }
                }
            }
            Err(err) => error!(%err, "target enable failed"),
        }
        drop(session);

        let target = Arc::clone(&self.target);
        let disabled = cpus::run_across_processors(
            &self.kernel,
            &self.agents,
            self.options.priority,
            move |cpu| target.disable(cpu).map_err(Error::from),
        );
        if let Err(err) = disabled {
            warn!(%err, "target disable failed");
        }

        let mut session = self.state.lock();
        session.events.running = false;
        session.events.finished = true;
        if session.mode.verbose {
            info!("events finishing");
        }
        self.events.notify_all();
    }

    /// Stop the system for newly parked tasks and tell the debugger.
    fn report_event(&self, session: &mut Session) -> Result<()> {
        if session.threads.is_valid() {
            let env = self.env();
            let merged = session.threads.merge_parked(env, &session.exceptions)?;
            debug!(merged, "tasks parked while stopped");
            return Ok(());
        }
        self.suspend(session)?;
        session.threads.next = 0;
        self.send_stop_reason(session)?;
        metrics::record_stop();
        Ok(())
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    pub(crate) fn suspend(&self, session: &mut Session) -> Result<()> {
        let env = self.env();
        session.threads.system_suspend(
            env,
            &mut session.breakpoints,
            &session.exceptions,
            &self.agents,
        )
    }

    pub(crate) fn resume(&self, session: &mut Session, detaching: bool) -> Result<()> {
        let env = self.env();
        session.threads.system_resume(
            env,
            &mut session.breakpoints,
            &mut session.exceptions,
            detaching,
        )
    }

    /// Report stopped tasks from the `next` cursor on, or `OK` when all were
    /// reported.
    pub(crate) fn send_stop_reason(&self, session: &mut Session) -> Result<()> {
        let threads = &mut session.threads;
        let out = &mut session.output;
        out.reset();
        let stopped = threads.stopped();
        if threads.next >= stopped.len() {
            out.append_str("OK")?;
        } else {
            out.append_fmt(format_args!("T{:02x}", threads.signal().0))?;
            let pid = u64::from(self.pid);
            let mut next = threads.next;
            while let Some(id) = stopped.get(next) {
                let thread = ThreadId::new(pid, u64::from(id.0));
                if out.append_fmt(format_args!("thread:{thread};")).is_err() {
                    break;
                }
                next += 1;
            }
            threads.next = next;
        }
        self.send(session)
    }

    // ========================================================================
    // Packet I/O
    // ========================================================================

    /// Frame and send the reply in the output buffer.
    pub(crate) fn send(&self, session: &mut Session) -> Result<()> {
        let remote_debug = session.mode.remote_debug;
        let frame = session.output.finish()?;
        if remote_debug {
            debug!(
                target: REMOTE_TRACE,
                len = frame.len(),
                "put: {}",
                String::from_utf8_lossy(frame)
            );
        }
        self.remote.write_all(frame)?;
        session.ack_pending = true;
        metrics::record_packet_out();
        Ok(())
    }

    /// Send `payload` as the reply.
    pub(crate) fn reply(&self, session: &mut Session, payload: &str) -> Result<()> {
        session.output.reset();
        session.output.append_str(payload)?;
        self.send(session)
    }

    fn retransmit(&self, session: &Session) -> Result<()> {
        if !session.output.is_finished() {
            return Ok(());
        }
        metrics::record_retransmission();
        if session.mode.remote_debug {
            debug!(target: REMOTE_TRACE, "retransmit");
        }
        self.remote.write_all(session.output.as_bytes())?;
        Ok(())
    }

    fn control(&self, session: &Session, byte: u8) -> Result<()> {
        if session.mode.remote_debug {
            trace!(target: REMOTE_TRACE, "put: {}", char::from(byte));
        }
        self.remote.write_all(&[byte])?;
        Ok(())
    }

    /// Read the next command. The session lock is released while waiting
    /// on the transport.
    fn packet_in(&self, session: &mut MutexGuard<'_, Session>) -> Result<Vec<u8>> {
        let mut buf = [0u8; 256];
        loop {
            while let Some(byte) = session.input.pop_front() {
                if let Some(packet) = self.input_byte(session, byte)? {
                    return Ok(packet);
                }
            }

            if !self.is_running() || !self.remote.is_connected() {
                return Err(Error::Disconnected);
            }
            let read = MutexGuard::unlocked(session, || self.remote.read(&mut buf));
            match read {
                Ok(0) => return Err(Error::Disconnected),
                Ok(count) => session.input.extend(&buf[..count]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    if session.ack_pending {
                        self.retransmit(session)?;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "read failed");
                    return Err(err.into());
                }
            }
        }
    }

    fn input_byte(&self, session: &mut Session, byte: u8) -> Result<Option<Vec<u8>>> {
        let Some(event) = session.reader.feed(byte) else {
            return Ok(None);
        };
        let remote_debug = session.mode.remote_debug;
        match event {
            Event::Ack => session.ack_pending = false,
            Event::Nack => self.retransmit(session)?,
            Event::Interrupt => {
                session.ack_pending = false;
                return Ok(Some(BREAK_COMMAND.to_vec()));
            }
            Event::Packet => {
                let payload = session.reader.take_payload();
                if remote_debug {
                    debug!(
                        target: REMOTE_TRACE,
                        len = payload.len(),
                        "get: {}",
                        String::from_utf8_lossy(&payload)
                    );
                }
                self.control(session, b'+')?;
                return Ok(Some(payload));
            }
            Event::BadChecksum { received, computed } => {
                metrics::record_checksum_error();
                if remote_debug {
                    debug!(target: REMOTE_TRACE, ?received, computed, "invalid checksum");
                }
                self.control(session, b'-')?;
            }
            Event::Overflow => {
                metrics::record_checksum_error();
                warn!("input buffer overflow");
                self.control(session, b'-')?;
            }
            Event::Junk(byte) | Event::Trailing(byte) => {
                if remote_debug {
                    trace!(target: REMOTE_TRACE, byte, "extra data");
                }
            }
        }
        Ok(None)
    }
}
