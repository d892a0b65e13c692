//! General queries (`q`) and sets (`Q`).

use rtdbg_proto::ThreadId;
use rtdbg_proto::hex::{after, decode_uint};

use super::{Command, Handled, command, dispatch_in};
use crate::server::{Server, Session};
use crate::Result;
use crate::config::BUFFER_SIZE;

const GENERAL_QUERY: &[Command] = &[
    command("qfThreadInfo", thread_info_first),
    command("qsThreadInfo", thread_info_subsequent),
    command("qThreadExtraInfo", thread_extra_info),
    command("qSupported", supported),
    command("qAttached", attached),
    command("qXfer", uninterpreted_transfer),
];

const GENERAL_SET: &[Command] = &[command("QNonStop", non_stop)];

const UNINTERPRETED_TRANSFER: &[Command] = &[
    command("qXfer:features", unsupported),
    command("qXfer:osdata", unsupported),
];

pub(super) fn general_query(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    dispatch_in(server, session, GENERAL_QUERY, packet)?;
    Ok(Handled::Done)
}

pub(super) fn general_set(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    dispatch_in(server, session, GENERAL_SET, packet)?;
    Ok(Handled::Done)
}

fn uninterpreted_transfer(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    dispatch_in(server, session, UNINTERPRETED_TRANSFER, packet)?;
    Ok(Handled::Done)
}

fn unsupported(_: &Server, _: &mut Session, _: &[u8]) -> Result<Handled> {
    Ok(Handled::Unsupported)
}

fn thread_info_first(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    session.threads.next = 0;
    thread_info_subsequent(server, session, packet)
}

fn thread_info_subsequent(server: &Server, session: &mut Session, _: &[u8]) -> Result<Handled> {
    let threads = &mut session.threads;
    let out = &mut session.output;
    out.reset();
    let current = threads.current();
    if threads.next >= current.len() {
        out.append_str("l")?;
    } else {
        out.append_str("m")?;
        let pid = u64::from(server.pid());
        let mut next = threads.next;
        while let Some(thread) = current.get(next) {
            let id = ThreadId::new(pid, u64::from(thread.id.0));
            let separator = if next == threads.next { "" } else { "," };
            if out.append_fmt(format_args!("{separator}{id}")).is_err() {
                break;
            }
            next += 1;
        }
        threads.next = next;
    }
    server.send(session)?;
    Ok(Handled::Done)
}

fn thread_extra_info(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    session.output.reset();
    if let Some(field) = after(packet, b',') {
        let id = ThreadId::decode(field);
        let found = if id.matches_pid(u64::from(server.pid())) {
            session.threads.find_index(id.tid)
        } else {
            None
        };
        if let Some(index) = found {
            let info = &session.threads.current()[index].info;
            let text = format!(
                "{:>4} ({}), priority(c:{:3} r:{:3}), stack(s:{:6} a:{:#x}), state({})",
                info.name,
                info.id,
                info.current_priority,
                info.real_priority,
                info.stack_size,
                info.stack_area,
                info.state,
            );
            session.output.append_hex(text.as_bytes())?;
        }
    }
    server.send(session)?;
    Ok(Handled::Done)
}

fn supported(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let capabilities = server.target.capabilities();
    let mut swbreak = false;
    let mut hwbreak = false;
    let mut vcont = false;
    let mut no_resumed = false;
    let mut multiprocess = false;

    let mut reply = format!("PacketSize={BUFFER_SIZE:x};QNonStop-");
    let requested = after(packet, b':').unwrap_or_default();
    for feature in requested.split(|&b| b == b';').filter(|f| !f.is_empty()) {
        let echo = match feature {
            b"swbreak+" if !swbreak && capabilities.swbreak => {
                swbreak = true;
                true
            }
            b"hwbreak+" if !hwbreak && capabilities.hwbreak => {
                hwbreak = true;
                true
            }
            b"vContSupported+" if !vcont => {
                session.mode.vcont = true;
                vcont = true;
                true
            }
            b"no-resumed+" if !no_resumed => {
                no_resumed = true;
                true
            }
            b"multiprocess+" if !multiprocess => {
                multiprocess = true;
                true
            }
            _ => false,
        };
        let feature = String::from_utf8_lossy(feature);
        if echo {
            reply.push(';');
            reply.push_str(&feature);
        } else if !feature.starts_with("xmlRegisters") {
            // Decline by replacing the trailing `+`, `-` or `?`.
            let name = feature
                .strip_suffix(['+', '-', '?'])
                .unwrap_or(&*feature);
            reply.push(';');
            reply.push_str(name);
            reply.push('-');
        }
    }

    let unrequested = [
        (!swbreak && capabilities.swbreak, "swbreak+"),
        (!hwbreak && capabilities.hwbreak, "hwbreak+"),
        (!vcont, "vContSupported+"),
        (!no_resumed, "no-resumed+"),
        (!multiprocess, "multiprocess+"),
    ];
    for (_, feature) in unrequested.iter().filter(|(add, _)| *add) {
        reply.push(';');
        reply.push_str(feature);
    }

    server.reply(session, &reply)?;
    Ok(Handled::Done)
}

fn attached(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let response = match after(packet, b':') {
        Some(pid) if decode_uint(pid) != u64::from(server.pid()) => "E01",
        _ => "1",
    };
    server.reply(session, response)?;
    Ok(Handled::Done)
}

/// All-stop is the only mode: `QNonStop-` is advertised, so the request is
/// only validated.
fn non_stop(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let response = match after(packet, b':') {
        Some(b"0" | b"1") => "OK",
        _ => "E01",
    };
    server.reply(session, response)?;
    Ok(Handled::Done)
}
