use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use spate::{
    ALL_INSTANCES, Config, DEFAULT_INTERVAL_S, DEFAULT_PORT, DEFAULT_TIME_S, Engine, OutputFormat,
    Proto, Role, State,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Measure network throughput over TCP or UDP connections.
///
/// `-V` selects IPv6 as classical iperf does, so the version flag stays
/// long-form only.
#[derive(Parser, Debug)]
#[command(name = "spate", about, disable_version_flag = true)]
struct Args {
    /// run in client mode, connecting to <HOST>
    #[arg(short = 'c', long = "client", value_name = "HOST", conflicts_with = "server")]
    client: Option<String>,

    /// run in server mode
    #[arg(short = 's', long)]
    server: bool,

    /// use UDP rather than TCP
    #[arg(short = 'u', long)]
    udp: bool,

    /// set the domain to IPv6 (send packets over IPv6)
    #[arg(short = 'V', long = "ipv6-domain")]
    ipv6: bool,

    /// server port to listen on / connect to
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// bind to interface at <HOST> address
    #[arg(short = 'B', long, value_name = "HOST")]
    bind: Option<String>,

    /// bind to a specific client port
    #[arg(long)]
    cport: Option<u16>,

    /// length of buffer in bytes to write
    #[arg(short = 'l', long = "len")]
    length: Option<usize>,

    /// seconds between periodic bandwidth reports
    #[arg(short = 'i', long)]
    interval: Option<u32>,

    /// time in seconds to transmit for
    #[arg(short = 't', long)]
    time: Option<u32>,

    /// bandwidth to send at in bits/sec, with optional k/K/m/M/g/G suffix
    #[arg(short = 'b', long)]
    bandwidth: Option<String>,

    /// 'b' = bits/sec, 'k' = Kbits/sec, 'm' = Mbits/sec
    #[arg(short = 'f', long)]
    format: Option<char>,

    /// set the socket's IP_TOS (byte) field
    #[arg(short = 'S', long)]
    tos: Option<u8>,

    /// instance id: default 'next free' for create, 'all' for abort
    #[arg(long)]
    id: Option<i32>,

    /// abort running instances; only reaches instances owned by this
    /// process, so it cannot stop another spate (interrupt that one instead)
    #[arg(long)]
    abort: bool,

    /// number of parallel client streams to run
    #[arg(short = 'P', long)]
    parallel: Option<u32>,
}

/// `<value>[kKmMgG]`, bits per second. Lowercase suffixes are SI, uppercase
/// binary, matching iperf.
fn parse_bandwidth(input: &str) -> Option<u64> {
    let digits_end = input.find(|c: char| !c.is_ascii_digit()).unwrap_or(input.len());
    let value: u64 = input[..digits_end].parse().ok().filter(|v| *v > 0)?;
    let base: u64 = match input[digits_end..].chars().next() {
        None => 1,
        Some('k') => 1_000,
        Some('K') => 1 << 10,
        Some('m') => 1_000_000,
        Some('M') => 1 << 20,
        Some('g') => 1_000_000_000,
        Some('G') => 1 << 30,
        Some(_) => return None,
    };
    Some(value * base)
}

fn parse_host(input: &str, v6: bool, what: &str) -> Result<IpAddr, String> {
    let addr: IpAddr =
        input.parse().map_err(|_| format!("invalid {what} address: {input}"))?;
    if addr.is_ipv6() != v6 {
        return Err(format!("{what} address family does not match the -V flag: {input}"));
    }
    Ok(addr)
}

fn build_config(args: &Args) -> Result<Config, String> {
    let proto = if args.udp { Proto::Udp } else { Proto::Tcp };
    let unspecified: IpAddr = if args.ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };

    let mut cfg = match &args.client {
        Some(host) => Config::client(proto, parse_host(host, args.ipv6, "destination")?),
        None => Config::server(proto, unspecified),
    };

    if let Some(bind) = &args.bind {
        cfg.source = parse_host(bind, args.ipv6, "bind")?;
    }
    match cfg.role {
        Role::Server => cfg.sport = args.port.unwrap_or(DEFAULT_PORT),
        Role::Client => {
            cfg.dport = args.port.unwrap_or(DEFAULT_PORT);
            cfg.sport = args.cport.unwrap_or(0);
        }
    }

    cfg.buffer_len = args.length.unwrap_or(0);
    cfg.interval_s = match args.interval {
        Some(0) | None => DEFAULT_INTERVAL_S,
        Some(interval) => interval,
    };
    cfg.time_s = args.time.unwrap_or(DEFAULT_TIME_S).max(cfg.interval_s);

    if let Some(bw) = &args.bandwidth {
        cfg.bandwidth_limit = parse_bandwidth(bw);
        if cfg.bandwidth_limit.is_none() {
            warn!(bandwidth = %bw, "ignoring invalid bandwidth limit");
        }
    }
    if let Some(format) = args.format {
        match format {
            'b' => cfg.format = OutputFormat::BitsPerSec,
            'k' => cfg.format = OutputFormat::KbitsPerSec,
            'm' => cfg.format = OutputFormat::MbitsPerSec,
            'K' => cfg.format = OutputFormat::KbytesPerSec,
            'M' => cfg.format = OutputFormat::MbytesPerSec,
            other => warn!("ignoring invalid format: {other}"),
        }
    }
    cfg.tos = args.tos.unwrap_or(0);

    if let Some(id) = args.id {
        if id <= 0 {
            return Err("instance id must be positive".into());
        }
        cfg.instance_id = id;
    }
    Ok(cfg)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    let engine = Arc::new(Engine::new());

    if args.abort {
        // every spate process owns its engine and registry, so a fresh
        // invocation has nothing this flag could reach
        error!(
            "--abort only addresses instances owned by this process and cannot stop another \
             spate; interrupt the running spate (Ctrl-C) to stop its instances"
        );
        return ExitCode::FAILURE;
    }

    if args.client.is_none() && !args.server {
        error!("should specify client (-c <host>) or server (-s) mode");
        return ExitCode::FAILURE;
    }

    let parallel = match args.parallel {
        None => 1,
        Some(n) => {
            if args.server || args.id.is_some() {
                error!("parallel streams cannot be combined with server mode or a fixed id");
                return ExitCode::FAILURE;
            }
            if n == 0 {
                error!("invalid parallel number");
                return ExitCode::FAILURE;
            }
            n
        }
    };

    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(message) => {
            error!("{message}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        mode = %format!("{}-{}", if args.udp { "udp" } else { "tcp" }, if args.server { "server" } else { "client" }),
        interval = cfg.interval_s,
        time = cfg.time_s,
        "starting"
    );

    let (closed_tx, closed_rx) = crossbeam_channel::unbounded();
    engine.set_state_handler(move |id, event| {
        if event.state == State::Closed {
            let _ = closed_tx.send(id);
        }
    });

    let mut started = 0;
    for _ in 0..parallel {
        match engine.start_instance(&cfg) {
            Ok(id) => {
                started += 1;
                info!(id, "instance running");
            }
            Err(err) => error!(%err, "could not start instance"),
        }
    }
    if started == 0 {
        return ExitCode::FAILURE;
    }

    let stopper = engine.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = stopper.stop_instance(ALL_INSTANCES);
    }) {
        warn!(%err, "couldn't install the interrupt handler");
    }

    for _ in 0..started {
        let _ = closed_rx.recv();
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_suffixes() {
        assert_eq!(parse_bandwidth("10"), Some(10));
        assert_eq!(parse_bandwidth("10k"), Some(10_000));
        assert_eq!(parse_bandwidth("10K"), Some(10_240));
        assert_eq!(parse_bandwidth("10m"), Some(10_000_000));
        assert_eq!(parse_bandwidth("2G"), Some(2 << 30));
        assert_eq!(parse_bandwidth("0"), None);
        assert_eq!(parse_bandwidth("10x"), None);
        assert_eq!(parse_bandwidth(""), None);
    }

    #[test]
    fn client_config_from_args() {
        let args = Args::parse_from(["spate", "-c", "127.0.0.1", "-u", "-t", "5", "-i", "1"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.role, Role::Client);
        assert_eq!(cfg.proto, Proto::Udp);
        assert_eq!(cfg.dport, DEFAULT_PORT);
        assert_eq!(cfg.time_s, 5);
        assert_eq!(cfg.interval_s, 1);
    }

    #[test]
    fn time_is_clamped_to_interval() {
        let args = Args::parse_from(["spate", "-c", "127.0.0.1", "-t", "2", "-i", "5"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.time_s, 5);
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let args = Args::parse_from(["spate", "-c", "::1"]);
        assert!(build_config(&args).is_err());
        let args = Args::parse_from(["spate", "-V", "-c", "::1"]);
        assert!(build_config(&args).is_ok());
    }
}
