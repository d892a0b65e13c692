//! Memory access and breakpoint commands.

use rtdbg_proto::hex::{after, decode_bytes, decode_uint};
use rtdbg_target::Watchpoint;

use super::Handled;
use crate::server::{Server, Session};
use crate::{Error, Result, metrics};

/// Parse `addr,len` followed by anything.
fn address_length(field: &[u8]) -> Result<(u64, usize)> {
    let length = after(field, b',').ok_or(Error::Malformed("missing length"))?;
    let length =
        usize::try_from(decode_uint(length)).map_err(|_| Error::Malformed("length too large"))?;
    Ok((decode_uint(field), length))
}

pub(super) fn read(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let (address, length) = address_length(&packet[1..])?;
    session.output.reset();
    if length.saturating_mul(2) > session.output.remaining() {
        return Err(Error::Malformed("read does not fit the packet buffer"));
    }
    let mut data = vec![0; length];
    server.target.read_memory(address, &mut data)?;
    session.output.append_hex(&data)?;
    server.send(session)?;
    Ok(Handled::Done)
}

pub(super) fn write(server: &Server, session: &mut Session, packet: &[u8]) -> Result<Handled> {
    let (address, length) = address_length(&packet[1..])?;
    let hex = after(packet, b':').ok_or(Error::Malformed("memory write without data"))?;
    if hex.len() / 2 < length {
        return Err(Error::Malformed("memory write data too short"));
    }
    let mut data = vec![0; length];
    decode_bytes(hex, &mut data)?;
    server.target.write_memory(address, &data)?;
    server.reply(session, "OK")?;
    Ok(Handled::Done)
}

pub(super) fn insert_breakpoint(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    breakpoint(server, session, true, packet)
}

pub(super) fn remove_breakpoint(
    server: &Server,
    session: &mut Session,
    packet: &[u8],
) -> Result<Handled> {
    breakpoint(server, session, false, packet)
}

/// `Z`/`z` `type,addr,kind`.
fn breakpoint(
    server: &Server,
    session: &mut Session,
    insert: bool,
    packet: &[u8],
) -> Result<Handled> {
    let fields = after(packet, b',').ok_or(Error::Malformed("missing breakpoint address"))?;
    let kind = after(fields, b',').ok_or(Error::Malformed("missing breakpoint kind"))?;
    let (address, kind) = (decode_uint(fields), decode_uint(kind));
    let capabilities = server.target.capabilities();

    match packet.get(1).map(|digit| digit.wrapping_sub(b'0')) {
        Some(0) if capabilities.swbreak => {
            let target = &*server.target;
            session.breakpoints.control(target, insert, address, kind)?;
            metrics::record_breakpoints(session.breakpoints.len());
        }
        Some(digit) if capabilities.hwwatch => {
            let watchpoint =
                Watchpoint::from_type(digit).ok_or(Error::Malformed("breakpoint type"))?;
            server
                .target
                .hwbreak_control(watchpoint, insert, address, kind)?;
        }
        _ => return Err(Error::Malformed("breakpoint type")),
    }
    server.reply(session, "OK")?;
    Ok(Handled::Done)
}
