#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, const_mutex};
use rtdbg::StartOptions;
use rtdbg::metrics::{CliRecorder, CliRecorderHandle};
use rtdbg_sim::{CLIENT_TIMEOUT, MachineConfig, PipeClient, PipeRemote, Sim};
use rtdbg_target::{Kernel, Target, TaskId};

pub const LOAD_ADDRESS: u32 = 0x1000;
pub const CPUS: usize = 2;

/// The agent is a process-wide singleton; sessions must not overlap.
static SERIAL: Mutex<()> = const_mutex(());

/// A simulated system with the agent started on the pipe transport.
pub struct Harness {
    pub sim: Sim,
    pub remote: Arc<PipeRemote>,
    _serial: MutexGuard<'static, ()>,
}

impl Harness {
    pub fn start(program: &[u8]) -> Self {
        let serial = SERIAL.lock();
        let sim = Sim::new(MachineConfig {
            cpus: CPUS,
            memory_base: u64::from(LOAD_ADDRESS),
            ..MachineConfig::default()
        });
        sim.machine.load(u64::from(LOAD_ADDRESS), program).unwrap();
        sim.machine
            .set_trap_handler(Arc::new(rtdbg::exception::handle));

        let remote = PipeRemote::new();
        rtdbg::remote::register(remote.clone());
        let options = StartOptions {
            remote: "pipe".to_string(),
            device: String::new(),
            timeout: Duration::from_millis(100),
            ..StartOptions::default()
        };
        let target: Arc<dyn Target> = sim.target.clone();
        let kernel: Arc<dyn Kernel> = sim.kernel.clone();
        rtdbg::start(options, target, kernel).unwrap();
        Self {
            sim,
            remote,
            _serial: serial,
        }
    }

    /// Connect a debugger and wait until the session serves packets.
    pub fn connect(&self) -> PipeClient {
        let client = self.remote.dial(CLIENT_TIMEOUT).expect("agent accepts");
        let supported = client.request("qSupported").expect("qSupported reply");
        assert!(supported.starts_with("PacketSize="), "{supported}");
        client
    }

    pub fn spawn(&self, name: &str, cpu: usize) -> TaskId {
        self.sim
            .machine
            .spawn_program(name, 100, LOAD_ADDRESS, cpu)
            .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = rtdbg::stop();
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + CLIENT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Thread ids listed in a stop reply.
pub fn stopped_threads(reply: &str) -> Vec<String> {
    reply
        .split(';')
        .filter_map(|field| field.split_once("thread:").map(|(_, id)| id.to_string()))
        .collect()
}

pub fn thread_id(id: TaskId) -> String {
    format!("p1.{:08x}", id.0)
}

pub fn le_word(hex: &str) -> u32 {
    let bytes: Vec<u8> = (0..4)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap())
        .collect();
    u32::from_le_bytes(bytes.try_into().unwrap())
}

pub fn le_hex(value: u32) -> String {
    value.to_le_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

/// Values recorded by the agent in this test binary.
pub fn recorder() -> &'static CliRecorderHandle {
    static HANDLE: OnceLock<CliRecorderHandle> = OnceLock::new();
    HANDLE.get_or_init(|| {
        let handle = CliRecorder::new().install().expect("no other recorder");
        rtdbg::metrics::init();
        handle
    })
}
