//! Register access on the thread selected with `Hg`.

use rtdbg_proto::hex::{after, decode_bytes, decode_uint};
use rtdbg_target::TargetError;

use super::Handled;
use crate::server::{Server, Session};
use crate::threads::Flags;
use crate::{Error, Result};

fn selected(session: &Session) -> Result<usize> {
    session.threads.selected(session.threads.selector_gen)
}

/// Register number and byte range within the blob.
fn register(server: &Server, field: &[u8]) -> Result<std::ops::Range<usize>> {
    let reg = usize::try_from(decode_uint(field)).unwrap_or(usize::MAX);
    server
        .target
        .register_table()
        .range(reg)
        .ok_or(Error::Target(TargetError::InvalidRegister(reg)))
}

pub(super) fn read_all(server: &Server, session: &mut Session, _: &[u8]) -> Result<Handled> {
    let index = selected(session)?;
    let Session {
        threads, output, ..
    } = session;
    let thread = threads.thread_mut(index)?;
    output.reset();
    output.append_hex(&thread.registers)?;
    server.send(session)?;
    Ok(Handled::Done)
}

pub(super) fn write_all(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let index = selected(session)?;
    let data = &packet[1..];
    let size = server.target.register_table().size();
    if data.len() != size * 2 {
        return Err(TargetError::RegisterSize {
            expected: size,
            actual: data.len() / 2,
        }
        .into());
    }
    let thread = session.threads.thread_mut(index)?;
    decode_bytes(data, &mut thread.registers)?;
    thread.flags.insert(Flags::REGS_DIRTY);
    server.reply(session, "OK")?;
    Ok(Handled::Done)
}

pub(super) fn read_one(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let index = selected(session)?;
    let range = register(server, &packet[1..])?;
    let Session {
        threads, output, ..
    } = session;
    let thread = threads.thread_mut(index)?;
    output.reset();
    output.append_hex(&thread.registers[range])?;
    server.send(session)?;
    Ok(Handled::Done)
}

pub(super) fn write_one(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let index = selected(session)?;
    let value = after(packet, b'=').ok_or(Error::Malformed("register write without value"))?;
    let range = register(server, &packet[1..])?;
    let thread = session.threads.thread_mut(index)?;
    decode_bytes(value, &mut thread.registers[range])?;
    thread.flags.insert(Flags::REGS_DIRTY);
    server.reply(session, "OK")?;
    Ok(Handled::Done)
}
