//! Execution control: stop reports, thread selection, resume and detach.

use tracing::{debug, error, warn};

use rtdbg_proto::ThreadId;
use rtdbg_proto::hex::{after, decode_uint};
use rtdbg_target::TaskId;

use super::{Command, Handled, command, dispatch_in};
use crate::server::{Server, Session};
use crate::threads::Selector;
use crate::{Error, Result};

const V_PACKETS: &[Command] = &[
    command("vCont", v_continue),
    command("vStopped", v_stopped),
    command("vKill", kill),
];

pub(super) fn v_packets(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    dispatch_in(server, session, V_PACKETS, packet)?;
    Ok(Handled::Done)
}

pub(super) fn argc_argv(_: &Server, _: &mut Session, _: &[u8]) -> Result<Handled> {
    Ok(Handled::Unsupported)
}

// ============================================================================
// Stop reports
// ============================================================================

pub(super) fn stop_reason(server: &Server, session: &mut Session, _: &[u8]) -> Result<Handled> {
    session.threads.next = 0;
    server.send_stop_reason(session)?;
    Ok(Handled::Done)
}

fn v_stopped(server: &Server, session: &mut Session, _: &[u8]) -> Result<Handled> {
    server.send_stop_reason(session)?;
    Ok(Handled::Done)
}

pub(super) fn interrupt(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    if let Err(err) = server.suspend(session) {
        error!(%err, "suspend all on break");
    }
    stop_reason(server, session, packet)
}

// ============================================================================
// Threads
// ============================================================================

fn not_found(id: ThreadId) -> Error {
    u32::try_from(id.tid).map_or(Error::NoThreadSelected, |tid| {
        Error::ThreadNotFound(TaskId(tid))
    })
}

pub(super) fn thread_select(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    let threads = &mut session.threads;
    let response = match packet.get(1) {
        Some(&which @ (b'g' | b'c')) => {
            let id = ThreadId::decode(&packet[2..]);
            let selector = if !id.matches_pid(u64::from(server.pid())) {
                None
            } else if id.is_any() {
                Some(Selector::Any)
            } else if id.is_all() {
                Some(Selector::All)
            } else {
                Some(
                    threads
                        .find_index(id.tid)
                        .map_or(Selector::Invalid, Selector::Index),
                )
            };
            if let Some(selector) = selector {
                if which == b'g' {
                    threads.selector_gen = selector;
                } else {
                    threads.selector_cont = selector;
                }
            }
            match selector {
                Some(Selector::Invalid) | None => "E01",
                Some(_) => "OK",
            }
        }
        _ => "E01",
    };
    server.reply(session, response)?;
    Ok(Handled::Done)
}

pub(super) fn thread_alive(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    let id = ThreadId::decode(&packet[1..]);
    let alive =
        id.matches_pid(u64::from(server.pid())) && session.threads.find_index(id.tid).is_some();
    server.reply(session, if alive { "OK" } else { "E01" })?;
    Ok(Handled::Done)
}

// ============================================================================
// Resume
// ============================================================================

fn v_continue(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let args = &packet[b"vCont".len()..];
    if args.first() == Some(&b'?') {
        // Both `c` and `C` must be listed or the debugger ignores vCont.
        server.reply(session, "vCont;c;C;s;r;")?;
        return Ok(Handled::Done);
    }

    let mut ok = true;
    let mut resume = false;
    for action in args.split(|&b| b == b';').skip(1) {
        match apply_action(server, session, action) {
            Ok(()) => resume = true,
            Err(err) => {
                debug!(%err, action = %String::from_utf8_lossy(action), "vCont");
                ok = false;
                break;
            }
        }
    }

    if resume {
        if let Err(err) = server.resume(session, false) {
            warn!(%err, "resume failed");
            ok = false;
        }
    }
    server.reply(session, if ok { "OK" } else { "E01" })?;
    Ok(Handled::Done)
}

/// Flag the threads one `vCont` action names.
fn apply_action(server: &Server, session: &mut Session, action: &[u8]) -> Result<()> {
    let (&kind, rest) = action
        .split_first()
        .ok_or(Error::Malformed("empty vCont action"))?;
    let field = after(action, b':').ok_or(Error::Malformed("vCont action without thread"))?;
    let id = ThreadId::decode(field);
    if !id.matches_pid(u64::from(server.pid())) {
        return Err(Error::Malformed("vCont thread of another process"));
    }

    let threads = &mut session.threads;
    let found = threads.find_index(id.tid).ok_or_else(|| not_found(id));
    match kind {
        b'c' | b'C' if id.is_all() => threads.continue_all(),
        b'c' | b'C' => threads.continue_thread(found?),
        b's' | b'S' => threads.step(found?),
        b'r' => {
            let end = after(rest, b',').ok_or(Error::Malformed("vCont range"))?;
            threads.stepping(found?, decode_uint(rest), decode_uint(end))
        }
        _ => Err(Error::Malformed("unknown vCont action")),
    }
}

pub(super) fn continue_at(
    server: &Server,
    session: &mut Session,
    _: &[u8],
) -> Result<Handled> {
    if session.mode.vcont {
        return Ok(Handled::Unsupported);
    }
    let packet = format!("vCont;c:p{:x}.-1", server.pid());
    v_continue(server, session, packet.as_bytes())
}

pub(super) fn single_step(
    server: &Server,
    session: &mut Session,
    _: &[u8],
) -> Result<Handled> {
    if session.mode.vcont {
        return Ok(Handled::Unsupported);
    }
    let index = session.threads.selected(session.threads.selector_cont)?;
    let id = session.threads.current()[index].id;
    let packet = format!("vCont;s:p{pid:x}.{id};c:p{pid:x}.-1", pid = server.pid());
    v_continue(server, session, packet.as_bytes())
}

// ============================================================================
// Detach
// ============================================================================

pub(super) fn detach(server: &Server, session: &mut Session, _: &[u8]) -> Result<Handled> {
    server.reply(session, "OK")?;
    server.remote.disconnect()?;
    Ok(Handled::Done)
}

pub(super) fn kill(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    session.mode.reset = true;
    detach(server, session, packet)
}
