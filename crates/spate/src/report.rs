use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{Level, debug, span};

use crate::{
    config::{InstanceId, OutputFormat},
    instance::{Instance, State},
};

/// One record produced by the report pipeline.
#[derive(Clone, Copy, Debug)]
pub enum Report {
    /// Emitted once per instance, when the first payload moved.
    ConnectInfo { id: InstanceId, local: SocketAddr, peer: SocketAddr },
    /// One measurement period.
    Period { id: InstanceId, start_sec: u32, end_sec: u32, bytes: u64, format: OutputFormat },
    /// Cumulative result, emitted when the instance stops.
    Summary { id: InstanceId, start_sec: u32, end_sec: u32, bytes: u64, format: OutputFormat },
}

/// Destination for report records. The engine installs [`StdoutSink`] unless
/// the embedder injects its own implementation.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &Report);
}

/// Cumulative counters for one instance. Written only by its report worker;
/// intended to be read from a state callback at `Running` or `Closed`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrafficReport {
    pub period_start_sec: u32,
    pub end_sec: u32,
    pub period_bytes: u64,
    pub total_bytes: u64,
    pub format: OutputFormat,
}

static HEADER_PRINTED: AtomicBool = AtomicBool::new(false);

/// Prints the classic iperf table:
///
/// ```text
/// [  3] local 127.0.0.1:49374 connected to 127.0.0.1:5001
/// [ ID] Interval          Transfer        Bandwidth
/// [  3]  0.0- 3.0 sec     12.34 MBytes    34.56 Mbits/sec
/// ```
///
/// The header goes out once per process.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn emit(&self, report: &Report) {
        match *report {
            Report::ConnectInfo { id, local, peer } => {
                println!("[{id:3}] local {local} connected to {peer}");
                if !HEADER_PRINTED.swap(true, Ordering::Relaxed) {
                    println!("[ ID] Interval\t\tTransfer\tBandwidth");
                }
            }
            Report::Period { id, start_sec, end_sec, bytes, format }
            | Report::Summary { id, start_sec, end_sec, bytes, format } => {
                println!("{}", format_traffic_line(id, start_sec, end_sec, bytes, format));
            }
        }
    }
}

/// Scales raw bytes to the configured unit. Bit units use SI factors; byte
/// units use binary factors, matching iperf's `-f` conventions.
fn format_traffic_line(
    id: InstanceId,
    start_sec: u32,
    end_sec: u32,
    bytes: u64,
    format: OutputFormat,
) -> String {
    let seconds = f64::from(end_sec.saturating_sub(start_sec).max(1));
    let (divisor, prefix, bits) = match format {
        OutputFormat::BitsPerSec => (1.0, "", true),
        OutputFormat::KbitsPerSec => (1e3, "K", true),
        OutputFormat::MbitsPerSec => (1e6, "M", true),
        OutputFormat::KbytesPerSec => (1024.0, "K", false),
        OutputFormat::MbytesPerSec => (1024.0 * 1024.0, "M", false),
    };
    let transfer = bytes as f64 / divisor;
    let (bandwidth, rate_unit) =
        if bits { (transfer / seconds * 8.0, "bits/sec") } else { (transfer / seconds, "Bytes/sec") };
    format!(
        "[{id:3}] {start_sec:2}.0-{end_sec:2}.0 sec\t{transfer:.2} {prefix}Bytes\t{bandwidth:.2} {prefix}{rate_unit}"
    )
}

/// Report worker: blocks on the notification channel, turns consumed
/// snapshots into `Period` records and finishes with a `Summary`.
pub(crate) fn report_worker(inst: Arc<Instance>) {
    let _span = span!(Level::INFO, "report", id = inst.id).entered();
    let mut connected = false;
    loop {
        if inst.report_notify.1.recv().is_err() {
            break;
        }
        if !connected {
            connected = emit_connect_info(&inst);
        }
        consume_snapshot(&inst);
        if !inst.is_running.load(Ordering::Acquire) {
            break;
        }
    }
    // the deadline snapshot can land between the last consume and the
    // running check above, so drain once more before summarizing
    consume_snapshot(&inst);

    let totals = *inst.totals.lock().unwrap();
    if totals.end_sec != 0 {
        inst.sink.emit(&Report::Summary {
            id: inst.id,
            start_sec: 0,
            end_sec: totals.end_sec,
            bytes: totals.total_bytes,
            format: totals.format,
        });
    }
    debug!("report worker exiting");
}

/// True once the record went out. A wakeup that arrives before any
/// connection exists (e.g. a failed setup) must not print a connect line.
fn emit_connect_info(inst: &Instance) -> bool {
    let local = *inst.local_addr.lock().unwrap();
    let peer = *inst.target_addr.lock().unwrap();
    match (local, peer) {
        (Some(local), Some(peer)) => {
            inst.sink.emit(&Report::ConnectInfo { id: inst.id, local, peer });
            true
        }
        _ => false,
    }
}

fn consume_snapshot(inst: &Instance) {
    let snapshot = inst.snapshot.take();
    if snapshot.seconds == 0 {
        return;
    }
    let record = {
        let mut totals = inst.totals.lock().unwrap();
        totals.period_bytes = u64::from(snapshot.bytes);
        totals.total_bytes += u64::from(snapshot.bytes);
        totals.period_start_sec = totals.end_sec;
        totals.end_sec += snapshot.seconds;
        Report::Period {
            id: inst.id,
            start_sec: totals.period_start_sec,
            end_sec: totals.end_sec,
            bytes: totals.period_bytes,
            format: totals.format,
        }
    };
    inst.state_action(State::Running);
    inst.sink.emit(&record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbits_line_matches_iperf_layout() {
        let line = format_traffic_line(3, 0, 3, 3_750_000, OutputFormat::MbitsPerSec);
        assert_eq!(line, "[  3]  0.0- 3.0 sec\t3.75 MBytes\t10.00 Mbits/sec");
    }

    #[test]
    fn bits_format_has_no_prefix() {
        let line = format_traffic_line(1, 3, 6, 300, OutputFormat::BitsPerSec);
        assert_eq!(line, "[  1]  3.0- 6.0 sec\t300.00 Bytes\t800.00 bits/sec");
    }

    #[test]
    fn byte_formats_use_binary_factors() {
        let line = format_traffic_line(2, 0, 1, 2048, OutputFormat::KbytesPerSec);
        assert_eq!(line, "[  2]  0.0- 1.0 sec\t2.00 KBytes\t2.00 KBytes/sec");
    }

    #[test]
    fn zero_length_period_does_not_divide_by_zero() {
        let line = format_traffic_line(1, 5, 5, 1_000_000, OutputFormat::KbitsPerSec);
        assert!(line.contains("1000.00 KBytes"));
    }
}
