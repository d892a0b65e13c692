//! Command dispatch.
//!
//! Commands are matched by literal prefix against ordered tables, first
//! match wins. A handler writes and sends its own reply. Target and kernel
//! failures become `E01`, and an unknown or unsupported command gets an
//! empty reply.

mod control;
mod memory;
mod query;
mod registers;

use tracing::{debug, info};

use crate::Result;
use crate::server::{Server, Session};

/// What a handler did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    /// The reply was sent.
    Done,
    /// Not supported; answer with an empty reply.
    Unsupported,
}

type Handler = fn(&Server, &mut Session, &[u8]) -> Result<Handled>;

pub(crate) struct Command {
    label: &'static str,
    handler: Handler,
}

const fn command(label: &'static str, handler: Handler) -> Command {
    Command { label, handler }
}

const PACKETS: &[Command] = &[
    command("q", query::general_query),
    command("Q", query::general_set),
    command("v", control::v_packets),
    command("H", control::thread_select),
    command("T", control::thread_alive),
    command("?", control::stop_reason),
    command("A", control::argc_argv),
    command("c", control::continue_at),
    command("g", registers::read_all),
    command("G", registers::write_all),
    command("p", registers::read_one),
    command("P", registers::write_one),
    command("m", memory::read),
    command("M", memory::write),
    command("s", control::single_step),
    command("Z", memory::insert_breakpoint),
    command("z", memory::remove_breakpoint),
    command("D", control::detach),
    command("k", control::kill),
    command("r", control::kill),
    command("R", control::kill),
    command("^C", control::interrupt),
];

/// Handle one received packet.
pub(crate) fn dispatch(server: &Server, session: &mut Session, packet: &[u8]) -> Result<()> {
    dispatch_in(server, session, PACKETS, packet)
}

fn dispatch_in(
    server: &Server,
    session: &mut Session,
    table: &[Command],
    packet: &[u8],
) -> Result<()> {
    let Some(command) = table
        .iter()
        .find(|command| packet.starts_with(command.label.as_bytes()))
    else {
        return server.reply(session, "");
    };

    if session.mode.verbose_commands {
        info!(
            cmd = command.label,
            len = packet.len(),
            "cmd: {}",
            String::from_utf8_lossy(packet)
        );
    }

    match (command.handler)(server, session, packet) {
        Ok(Handled::Done) => Ok(()),
        Ok(Handled::Unsupported) => server.reply(session, ""),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            debug!(cmd = command.label, %err, "command failed");
            server.reply(session, "E01")
        }
    }
}
