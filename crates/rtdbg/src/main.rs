//! rtdbg CLI - serve a simulated RV32 system to GDB

mod cli;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Cli, EXIT_FAILURE, EXIT_SUCCESS};
use rtdbg_sim::{MachineConfig, Sim};
use rtdbg_target::{Kernel, Target};

const LOAD_ADDRESS: u32 = 0x1000;
const WAIT_POLL: Duration = Duration::from_millis(100);

fn main() {
    let cli = Cli::parse();

    let metrics_handle = if cli.metrics {
        rtdbg::metrics::CliRecorder::new().install()
    } else {
        None
    };
    rtdbg::metrics::init();

    let default_level = if cli.verbose {
        "rtdbg=debug"
    } else if cli.silent {
        "rtdbg=error"
    } else {
        "rtdbg=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let exit_code = match run(&cli) {
        Ok(()) => EXIT_SUCCESS,
        Err(err) => {
            error!(%err, "rtdbg failed");
            EXIT_FAILURE
        }
    };

    if let Some(handle) = metrics_handle {
        handle.print_summary();
    }
    std::process::exit(exit_code);
}

fn run(cli: &Cli) -> rtdbg::Result<()> {
    let sim = Sim::new(MachineConfig {
        cpus: cli.cpus(),
        memory_base: u64::from(LOAD_ADDRESS),
        ..MachineConfig::default()
    });
    sim.machine.load(u64::from(LOAD_ADDRESS), &cli.program.image())?;
    sim.machine
        .set_trap_handler(Arc::new(rtdbg::exception::handle));
    for index in 0..cli.tasks {
        let name = format!("T{index:03}");
        sim.machine
            .spawn_program(&name, 100, LOAD_ADDRESS, index % sim.machine.cpus())?;
    }
    let target: Arc<dyn Target> = sim.target.clone();
    let kernel: Arc<dyn Kernel> = sim.kernel.clone();
    rtdbg::start(cli.start_options(), target, kernel)?;
    if cli.verbose {
        rtdbg::set_verbose(true)?;
    }
    if cli.remote_debug {
        rtdbg::remote_debug(true)?;
    }
    info!(
        cpus = sim.machine.cpus(),
        tasks = cli.tasks,
        "system running, waiting for debugger"
    );

    while rtdbg::running() && !sim.machine.reset_requested() {
        thread::sleep(WAIT_POLL);
    }
    if sim.machine.reset_requested() {
        info!("reset requested by debugger");
    }
    rtdbg::stop()
}
