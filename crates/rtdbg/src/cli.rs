//! CLI definitions and argument types.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use rtdbg::StartOptions;
use rtdbg_sim::program;

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "rtdbg")]
#[command(about = "GDB remote debugging agent running on a simulated RV32 kernel")]
#[command(version)]
pub struct Cli {
    /// Show metrics summary on exit
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub silent: bool,

    /// Trace raw packets
    #[arg(long)]
    pub remote_debug: bool,

    /// Transport name
    #[arg(long, default_value = "tcp")]
    pub remote: String,

    /// Listen address (`port`, `:port` or `host:port`)
    #[arg(short, long, default_value = "1122")]
    pub port: String,

    /// Priority of the agent's tasks
    #[arg(long, default_value = "1")]
    pub priority: u32,

    /// Transport read timeout in milliseconds
    #[arg(long, default_value = "1000")]
    pub timeout_ms: u64,

    /// Simulated processors (default: host CPUs)
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Program tasks to start
    #[arg(long, default_value = "2")]
    pub tasks: usize,

    /// Program every task runs
    #[arg(long, value_enum, default_value = "counter")]
    pub program: ProgramArg,
}

impl Cli {
    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            remote: self.remote.clone(),
            device: self.port.clone(),
            priority: self.priority,
            timeout: Duration::from_millis(self.timeout_ms),
            pid: None,
        }
    }

    pub fn cpus(&self) -> usize {
        self.cpus.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Simulated program.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ProgramArg {
    /// Increment a0 forever
    Counter,
    /// Increment a0 and hit a breakpoint each iteration
    CounterWithBreak,
}

impl ProgramArg {
    pub fn image(self) -> Vec<u8> {
        match self {
            Self::Counter => program::counter(),
            Self::CounterWithBreak => program::counter_with_break(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_start_options() {
        let cli = Cli::parse_from(["rtdbg", "--port", ":2000", "--timeout-ms", "250"]);
        let options = cli.start_options();
        assert_eq!(options.remote, "tcp");
        assert_eq!(options.device, ":2000");
        assert_eq!(options.timeout, Duration::from_millis(250));
        assert!(cli.cpus() >= 1);
    }

    #[test]
    fn test_verbose_conflicts_with_silent() {
        assert!(Cli::try_parse_from(["rtdbg", "-v", "-s"]).is_err());
    }
}
