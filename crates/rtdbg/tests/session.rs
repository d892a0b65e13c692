//! End-to-end debugger sessions against the simulator.

mod common;

use std::sync::mpsc;

use rtdbg::metrics::CHECKSUM_ERRORS;
use rtdbg_sim::program::{self, A0};
use rtdbg_sim::{BREAKPOINT, CLIENT_TIMEOUT, REGISTER_BYTES, Reply, VECTOR_BREAKPOINT};
use rtdbg_target::{ExceptionFrame, ExceptionOutcome, Kernel};

use common::*;

#[test]
fn test_supported_echoes_swbreak() {
    let harness = Harness::start(&program::counter());
    let client = harness.connect();

    let reply = client
        .request("qSupported:swbreak+;hwbreak+;xmlRegisters=i386")
        .unwrap();
    assert!(reply.starts_with("PacketSize=800;QNonStop-"), "{reply}");
    assert!(reply.contains(";swbreak+"), "{reply}");
    // The simulated target has no hardware breakpoints.
    assert!(reply.contains(";hwbreak-"), "{reply}");
    assert!(!reply.contains("xmlRegisters"), "{reply}");
    assert!(reply.contains(";vContSupported+"), "{reply}");
    assert_eq!(client.request("qAttached").unwrap(), "1");
    assert_eq!(client.request("vCont?").unwrap(), "vCont;c;C;s;r;");
}

#[test]
fn test_unknown_command_gets_empty_reply() {
    let harness = Harness::start(&program::counter());
    let client = harness.connect();

    assert_eq!(client.request("qXfer:features:read:target.xml:0,fff").unwrap(), "");
    assert_eq!(client.request("X1000,0:").unwrap(), "");
    assert_eq!(client.request("QNonStop:1").unwrap(), "OK");
    assert_eq!(client.request("QNonStop:0").unwrap(), "OK");
    assert_eq!(client.request("QNonStop:x").unwrap(), "E01");
    assert_eq!(client.request("QNonStop:10").unwrap(), "E01");
}

#[test]
fn test_snapshot_lists_and_describes_threads() {
    let harness = Harness::start(&program::counter());
    let first = harness.spawn("T000", 0);
    let second = harness.spawn("T001", 1);
    let client = harness.connect();

    assert!(harness.sim.machine.is_suspended(first));
    assert!(harness.sim.machine.is_suspended(second));

    let list = client.request("qfThreadInfo").unwrap();
    assert_eq!(list, format!("m{},{}", thread_id(first), thread_id(second)));
    assert_eq!(client.request("qsThreadInfo").unwrap(), "l");

    // Nothing trapped, so the first task reports an interrupt.
    let stop = client.request("?").unwrap();
    assert_eq!(stop, format!("T02thread:{};", thread_id(first)));

    let extra = client
        .request(&format!("qThreadExtraInfo,{}", thread_id(second)))
        .unwrap();
    let text = String::from_utf8(
        (0..extra.len() / 2)
            .map(|i| u8::from_str_radix(&extra[i * 2..i * 2 + 2], 16).unwrap())
            .collect(),
    )
    .unwrap();
    assert!(text.starts_with("T001 ("), "{text}");

    assert_eq!(client.request(&format!("T{}", thread_id(second))).unwrap(), "OK");
    assert_eq!(client.request("Tp1.deadbeef").unwrap(), "E01");
    assert_eq!(client.request("Tp2.00000001").unwrap(), "E01");
}

#[test]
fn test_register_access_on_selected_thread() {
    let harness = Harness::start(&program::counter());
    let task = harness.spawn("T000", 0);
    let client = harness.connect();

    assert_eq!(client.request(&format!("Hg{}", thread_id(task))).unwrap(), "OK");
    let regs = client.request("g").unwrap();
    assert_eq!(regs.len(), rtdbg_sim::REGISTER_BYTES * 2);

    let a0 = client.request("pa").unwrap();
    assert_eq!(a0, regs[80..88]);
    assert_eq!(client.request("Pa=2a000000").unwrap(), "OK");
    assert_eq!(client.request("pa").unwrap(), "2a000000");
    assert_eq!(client.request("p21").unwrap(), "E01");
    assert_eq!(client.request("G00").unwrap(), "E01");
    // One hex digit too many.
    let odd = format!("G{regs}0");
    assert_eq!(client.request(&odd).unwrap(), "E01");
    assert_eq!(client.request("Hgp1.deadbeef").unwrap(), "E01");

    // Detaching writes the registers back and lets the task run on.
    assert_eq!(client.request("D").unwrap(), "OK");
    assert!(wait_until(|| !harness.sim.machine.is_suspended(task)));
    assert!(wait_until(|| harness.sim.machine.register(task, A0 as usize).unwrap() > 0x2a));
}

#[test]
fn test_memory_read_write() {
    let harness = Harness::start(&program::counter());
    let client = harness.connect();

    let code = client.request("m1000,8").unwrap();
    assert_eq!(code, le_hex(program::addi(A0, A0, 1)) + &le_hex(program::jal(0, -4)));

    assert_eq!(client.request("M1200,2:beef").unwrap(), "OK");
    assert_eq!(client.request("m1200,2").unwrap(), "beef");
    assert_eq!(client.request("M1200,2:be").unwrap(), "E01");
    // Outside the simulated memory.
    assert_eq!(client.request("m100000,4").unwrap(), "E01");
}

#[test]
fn test_breakpoint_insert_remove_restores_memory() {
    let harness = Harness::start(&program::counter());
    harness.spawn("T000", 0);
    let client = harness.connect();
    let machine = &harness.sim.machine;
    let read = |address: u64| {
        let mut word = [0u8; 4];
        machine.read_memory(address, &mut word).unwrap();
        word
    };

    assert_eq!(client.request("Z0,1100,4").unwrap(), "OK");
    assert_eq!(client.request("Z0,1100,4").unwrap(), "OK");
    assert_eq!(client.request("Z0,1104,2").unwrap(), "E01");
    assert_eq!(client.request("Z2,1104,4").unwrap(), "E01");
    assert_eq!(rtdbg::server().unwrap().session().breakpoints.len(), 1);
    // Not written while the system is stopped.
    assert_eq!(read(0x1100), [0; 4]);

    assert_eq!(client.request("vCont;c:p1.-1").unwrap(), "OK");
    assert_eq!(read(0x1100), BREAKPOINT);

    client.send_raw(&[0x03]);
    let stop = client.packet(CLIENT_TIMEOUT).unwrap();
    assert!(stop.starts_with("T02thread:"), "{stop}");
    assert_eq!(read(0x1100), [0; 4]);
    assert_eq!(client.request("m1100,4").unwrap(), "00000000");

    assert_eq!(client.request("z0,1100,4").unwrap(), "OK");
    assert_eq!(rtdbg::server().unwrap().session().breakpoints.len(), 0);
    assert_eq!(client.request("vCont;c:p1.-1").unwrap(), "OK");
    assert_eq!(read(0x1100), [0; 4]);
}

#[test]
fn test_stop_reason_lists_parked_tasks() {
    let harness = Harness::start(&program::counter_with_break());
    let client = harness.connect();
    let first = harness.spawn("T000", 0);
    let second = harness.spawn("T001", 1);

    let mut stop = String::new();
    assert!(wait_until(|| {
        stop = client.request("?").unwrap();
        stopped_threads(&stop).len() == 2
    }));
    assert!(stop.starts_with("T05"), "{stop}");
    let mut threads = stopped_threads(&stop);
    threads.sort();
    assert_eq!(threads, [thread_id(first), thread_id(second)]);
    assert_eq!(client.request("vStopped").unwrap(), "OK");
}

#[test]
fn test_continue_releases_parked_task() {
    let harness = Harness::start(&program::counter_with_break());
    let client = harness.connect();
    let task = harness.spawn("T000", 0);
    let id = thread_id(task);

    assert!(wait_until(|| stopped_threads(&client.request("?").unwrap()) == [id.clone()]));
    assert_eq!(harness.sim.machine.register(task, A0 as usize), Some(1));

    // Step over the ebreak, then continue everything.
    assert_eq!(client.request(&format!("Hg{id}")).unwrap(), "OK");
    let pc = le_word(&client.request("p20").unwrap());
    assert_eq!(pc, LOAD_ADDRESS + 4);
    assert_eq!(client.request(&format!("P20={}", le_hex(pc + 4))).unwrap(), "OK");
    assert_eq!(client.request("vCont;c:p1.-1").unwrap(), "OK");

    // The loop comes round to the ebreak again and reports a new stop.
    let stop = client.packet(CLIENT_TIMEOUT).unwrap();
    assert_eq!(stop, format!("T05thread:{id};"));
    assert_eq!(harness.sim.machine.register(task, A0 as usize), Some(2));
}

#[test]
fn test_bad_checksum_is_nacked() {
    let metrics = recorder();
    let harness = Harness::start(&program::counter());
    let client = harness.connect();
    let before = metrics.get_counter(CHECKSUM_ERRORS).unwrap_or(0);

    client.send_raw(b"$?#00");
    assert_eq!(client.next(CLIENT_TIMEOUT), Some(Reply::Nack));
    assert_eq!(metrics.get_counter(CHECKSUM_ERRORS), Some(before + 1));
    assert_eq!(client.request("qAttached").unwrap(), "1");
}

#[test]
fn test_range_step_stops_outside_range() {
    let harness = Harness::start(&program::assemble(&[
        program::addi(A0, A0, 1),
        program::addi(A0, A0, 1),
        program::addi(A0, A0, 1),
        program::jal(0, -12),
    ]));
    let task = harness.spawn("T000", 0);
    let client = harness.connect();
    let id = thread_id(task);

    // Restart the loop with a0 cleared.
    assert_eq!(client.request(&format!("Hg{id}")).unwrap(), "OK");
    let start = le_hex(LOAD_ADDRESS);
    assert_eq!(client.request(&format!("P20={start}")).unwrap(), "OK");
    assert_eq!(client.request("Pa=00000000").unwrap(), "OK");

    // The step landing on 0x1004 stays in range, the one landing on 0x1008
    // leaves it.
    assert_eq!(client.request(&format!("vCont;r1000,1008:{id}")).unwrap(), "OK");
    let stop = client.packet(CLIENT_TIMEOUT).unwrap();
    assert_eq!(stop, format!("T05thread:{id};"));

    assert_eq!(client.request(&format!("Hg{id}")).unwrap(), "OK");
    assert_eq!(le_word(&client.request("p20").unwrap()), LOAD_ADDRESS + 8);
    assert_eq!(client.request("pa").unwrap(), "02000000");
    assert!(rtdbg::server().unwrap().session().threads.stepper(task).is_none());
}

#[test]
fn test_system_task_exception_cascades() {
    let harness = Harness::start(&program::counter());
    let _client = harness.connect();

    let (go, wait) = mpsc::channel::<()>();
    let (tx, rx) = mpsc::channel();
    let id = harness
        .sim
        .kernel
        .spawn(
            "TSYS",
            1,
            Box::new(move || {
                wait.recv().unwrap();
                let mut frame = ExceptionFrame {
                    vector: VECTOR_BREAKPOINT,
                    registers: vec![0; REGISTER_BYTES],
                    ..ExceptionFrame::default()
                };
                tx.send(rtdbg::exception::handle(&mut frame)).unwrap();
            }),
        )
        .unwrap();
    harness.sim.machine.mark_system(id).unwrap();
    go.send(()).unwrap();

    assert_eq!(rx.recv_timeout(CLIENT_TIMEOUT).unwrap(), ExceptionOutcome::Cascade);
    assert!(rtdbg::server().unwrap().session().exceptions.is_empty());
}

#[test]
fn test_events_enable_every_processor() {
    let harness = Harness::start(&program::counter());
    let client = harness.connect();
    assert!(wait_until(|| harness.sim.machine.enabled_cpus() == (0..CPUS).collect::<Vec<_>>()));

    client.close();
    assert!(wait_until(|| harness.sim.machine.enabled_cpus().is_empty()));
    assert!(rtdbg::running());
}

#[test]
fn test_kill_requests_reset() {
    let harness = Harness::start(&program::counter());
    let task = harness.spawn("T000", 0);
    let client = harness.connect();

    assert_eq!(client.request("k").unwrap(), "OK");
    assert!(wait_until(|| harness.sim.machine.reset_requested()));
    assert!(wait_until(|| !harness.sim.machine.is_suspended(task)));
    drop(client);

    // The agent waits for the next debugger.
    let client = harness.connect();
    assert_eq!(client.request("qAttached").unwrap(), "1");
}

#[test]
fn test_second_start_is_rejected() {
    let harness = Harness::start(&program::counter());
    let target: std::sync::Arc<dyn rtdbg_target::Target> = harness.sim.target.clone();
    let kernel: std::sync::Arc<dyn rtdbg_target::Kernel> = harness.sim.kernel.clone();
    let err = rtdbg::start(rtdbg::StartOptions::default(), target, kernel).unwrap_err();
    assert!(matches!(err, rtdbg::Error::AlreadyActive));
}
