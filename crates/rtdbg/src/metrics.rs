//! Agent metrics using metrics-rs.
//!
//! The agent records protocol traffic and debugger activity through the
//! `metrics` facade. The CLI can install [`CliRecorder`] to keep the values
//! in memory and print them when the agent stops.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit, counter,
    describe_counter, describe_gauge, gauge,
};
use parking_lot::RwLock;

pub const PACKETS_RECEIVED: &str = "rtdbg_packets_received_total";
pub const PACKETS_SENT: &str = "rtdbg_packets_sent_total";
pub const CHECKSUM_ERRORS: &str = "rtdbg_checksum_errors_total";
pub const RETRANSMISSIONS: &str = "rtdbg_retransmissions_total";
pub const STOPS_REPORTED: &str = "rtdbg_stops_reported_total";
pub const SESSIONS: &str = "rtdbg_sessions_total";
pub const BREAKPOINTS: &str = "rtdbg_breakpoints";

// ============================================================================
// Metric descriptions
// ============================================================================

/// Register metric descriptions. Call once at startup.
pub fn init() {
    describe_counter!(PACKETS_RECEIVED, Unit::Count, "Packets received from the debugger");
    describe_counter!(PACKETS_SENT, Unit::Count, "Packets sent to the debugger");
    describe_counter!(
        CHECKSUM_ERRORS,
        Unit::Count,
        "Packets dropped for a bad checksum or overflow"
    );
    describe_counter!(
        RETRANSMISSIONS,
        Unit::Count,
        "Replies resent after a NACK or ack timeout"
    );
    describe_counter!(STOPS_REPORTED, Unit::Count, "Stop notifications sent");
    describe_counter!(SESSIONS, Unit::Count, "Debugger connections accepted");
    describe_gauge!(BREAKPOINTS, Unit::Count, "Software breakpoints tracked");
}

// ============================================================================
// Recording
// ============================================================================

/// Count a packet by command letter.
pub fn record_packet_in(command: u8) {
    let labels = [("command", char::from(command).to_string())];
    counter!(PACKETS_RECEIVED, &labels).increment(1);
}

pub fn record_packet_out() {
    counter!(PACKETS_SENT).increment(1);
}

pub fn record_checksum_error() {
    counter!(CHECKSUM_ERRORS).increment(1);
}

pub fn record_retransmission() {
    counter!(RETRANSMISSIONS).increment(1);
}

pub fn record_stop() {
    counter!(STOPS_REPORTED).increment(1);
}

pub fn record_session() {
    counter!(SESSIONS).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub fn record_breakpoints(count: usize) {
    gauge!(BREAKPOINTS).set(count as f64);
}

// ============================================================================
// CLI Recorder for terminal output
// ============================================================================

#[derive(Default)]
struct CounterStorage {
    values: RwLock<HashMap<String, u64>>,
}

#[derive(Default)]
struct GaugeStorage {
    values: RwLock<HashMap<String, f64>>,
}

struct CliCounter {
    key: String,
    storage: Arc<CounterStorage>,
}

impl metrics::CounterFn for CliCounter {
    fn increment(&self, value: u64) {
        let mut values = self.storage.values.write();
        *values.entry(self.key.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        let mut values = self.storage.values.write();
        values.insert(self.key.clone(), value);
    }
}

struct CliGauge {
    key: String,
    storage: Arc<GaugeStorage>,
}

impl metrics::GaugeFn for CliGauge {
    fn increment(&self, value: f64) {
        let mut values = self.storage.values.write();
        *values.entry(self.key.clone()).or_insert(0.0) += value;
    }

    fn decrement(&self, value: f64) {
        let mut values = self.storage.values.write();
        *values.entry(self.key.clone()).or_insert(0.0) -= value;
    }

    fn set(&self, value: f64) {
        let mut values = self.storage.values.write();
        values.insert(self.key.clone(), value);
    }
}

/// Recorder keeping counters and gauges in memory.
pub struct CliRecorder {
    counters: Arc<CounterStorage>,
    gauges: Arc<GaugeStorage>,
}

impl CliRecorder {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(CounterStorage::default()),
            gauges: Arc::new(GaugeStorage::default()),
        }
    }

    /// Read access to the values this recorder collects.
    pub fn handle(&self) -> CliRecorderHandle {
        CliRecorderHandle {
            counters: Arc::clone(&self.counters),
            gauges: Arc::clone(&self.gauges),
        }
    }

    /// Install as the global recorder. Returns `None` if one is already set.
    pub fn install(self) -> Option<CliRecorderHandle> {
        let handle = self.handle();
        metrics::set_global_recorder(self).ok()?;
        Some(handle)
    }
}

impl Default for CliRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl Recorder for CliRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CliCounter {
            key: key_to_string(key),
            storage: Arc::clone(&self.counters),
        }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(CliGauge {
            key: key_to_string(key),
            storage: Arc::clone(&self.gauges),
        }))
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Access to the values collected by an installed [`CliRecorder`].
pub struct CliRecorderHandle {
    counters: Arc<CounterStorage>,
    gauges: Arc<GaugeStorage>,
}

impl CliRecorderHandle {
    pub fn get_counter(&self, key: &str) -> Option<u64> {
        self.counters.values.read().get(key).copied()
    }

    pub fn get_gauge(&self, key: &str) -> Option<f64> {
        self.gauges.values.read().get(key).copied()
    }

    /// Print all collected metrics.
    pub fn print_summary(&self) {
        let counters = self.counters.values.read();
        let gauges = self.gauges.values.read();

        if counters.is_empty() && gauges.is_empty() {
            println!("No metrics collected.");
            return;
        }

        println!();
        println!("## Metrics Summary");
        println!();

        if !counters.is_empty() {
            println!("### Counters");
            let mut entries: Vec<_> = counters.iter().collect();
            entries.sort();
            for (key, value) in entries {
                println!("  {key}: {value}");
            }
            println!();
        }

        if !gauges.is_empty() {
            println!("### Gauges");
            let mut keys: Vec<_> = gauges.keys().collect();
            keys.sort();
            for key in keys {
                if let Some(value) = gauges.get(key) {
                    println!("  {key}: {value}");
                }
            }
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Label;

    #[test]
    fn test_key_to_string() {
        let key = Key::from_name(PACKETS_SENT);
        assert_eq!(key_to_string(&key), PACKETS_SENT);

        let key = Key::from_parts(PACKETS_RECEIVED, vec![Label::new("command", "g")]);
        assert_eq!(
            key_to_string(&key),
            "rtdbg_packets_received_total{command=g}"
        );
    }

    #[test]
    fn test_cli_recorder_storage() {
        let recorder = CliRecorder::new();

        let counter = CliCounter {
            key: STOPS_REPORTED.to_string(),
            storage: Arc::clone(&recorder.counters),
        };
        metrics::CounterFn::increment(&counter, 2);
        metrics::CounterFn::increment(&counter, 1);
        assert_eq!(
            recorder.counters.values.read().get(STOPS_REPORTED),
            Some(&3)
        );

        let gauge = CliGauge {
            key: BREAKPOINTS.to_string(),
            storage: Arc::clone(&recorder.gauges),
        };
        metrics::GaugeFn::set(&gauge, 4.0);
        metrics::GaugeFn::decrement(&gauge, 1.0);
        assert_eq!(recorder.gauges.values.read().get(BREAKPOINTS), Some(&3.0));
    }

    #[test]
    fn test_agent_metrics_recorded() {
        let recorder = CliRecorder::new();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            record_checksum_error();
            record_checksum_error();
            record_packet_in(b'g');
            record_breakpoints(3);
        });
        assert_eq!(handle.get_counter(CHECKSUM_ERRORS), Some(2));
        assert_eq!(
            handle.get_counter("rtdbg_packets_received_total{command=g}"),
            Some(1)
        );
        assert_eq!(handle.get_counter(STOPS_REPORTED), None);
        assert_eq!(handle.get_gauge(BREAKPOINTS), Some(3.0));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_packet_in(b'g');
        record_breakpoints(2);
    }
}
