use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use crate::{error::Error, instance::StateEvent};

/// Identifier of a measurement instance. Live ids are always >= 1; `0` in a
/// [`Config`] means "assign the next free id".
pub type InstanceId = i32;

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_INTERVAL_S: u32 = 3;
pub const DEFAULT_TIME_S: u32 = 30;

/// Socket-level receive timeout; doubles as the fatal-inactivity bound for a
/// server that never sees a first payload.
pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_secs(10);
/// Send timeout applied to TCP client sockets.
pub const DEFAULT_TCP_TX_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const SOCKET_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const TICK_PERIOD: Duration = Duration::from_secs(1);
pub(crate) const WORKERS_FINISH_TIMEOUT: Duration = Duration::from_millis(1500);

pub(crate) const DEFAULT_TCP_TX_LEN: usize = 16 * 1024;
pub(crate) const DEFAULT_TCP_RX_LEN: usize = 16 * 1024;
pub(crate) const DEFAULT_IPV4_UDP_TX_LEN: usize = 1470;
pub(crate) const DEFAULT_IPV6_UDP_TX_LEN: usize = 1450;
pub(crate) const DEFAULT_UDP_RX_LEN: usize = 16 * 1024;

/// Sequence-number header written at the start of every send buffer.
pub(crate) const SEQ_HEADER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// Unit the report sink scales transfer and bandwidth figures to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    BitsPerSec,
    KbitsPerSec,
    #[default]
    MbitsPerSec,
    KbytesPerSec,
    MbytesPerSec,
}

/// Callback invoked on every lifecycle transition of an instance.
pub type StateHandler = dyn Fn(InstanceId, &StateEvent) + Send + Sync;

/// Full description of one measurement session.
///
/// Start from [`Config::client`] or [`Config::server`] and override fields as
/// needed; the defaults mirror classical iperf (port 5001, 3 s report
/// interval, 30 s runtime, unthrottled, Mbits/sec output).
#[derive(Clone)]
pub struct Config {
    pub role: Role,
    pub proto: Proto,
    /// Peer address for clients; ignored by servers.
    pub destination: IpAddr,
    /// Bind address. Servers listen here; clients bind only when this or
    /// `sport` is set.
    pub source: IpAddr,
    pub dport: u16,
    /// 0 leaves the local port ephemeral / unbound.
    pub sport: u16,
    /// Seconds between periodic bandwidth reports.
    pub interval_s: u32,
    /// Total measurement time in seconds; must be >= `interval_s`.
    pub time_s: u32,
    /// Pacing target in bits per second; `None` sends as fast as the socket
    /// accepts.
    pub bandwidth_limit: Option<u64>,
    /// Bytes per send/recv call; 0 picks the role/proto default. A UDP server
    /// always uses the fixed receive buffer regardless of this field.
    pub buffer_len: usize,
    /// IPv4 TOS byte or IPv6 traffic class.
    pub tos: u8,
    pub format: OutputFormat,
    pub rx_timeout: Duration,
    pub tcp_tx_timeout: Duration,
    /// Optional SCHED_FIFO priority for the traffic worker (Linux only).
    pub traffic_priority: Option<i32>,
    /// Requested instance id; 0 assigns the next free one.
    pub instance_id: InstanceId,
    /// Per-instance state callback; falls back to the engine-wide handler.
    pub state_handler: Option<Arc<StateHandler>>,
}

impl Config {
    pub fn client(proto: Proto, destination: IpAddr) -> Self {
        Self {
            role: Role::Client,
            proto,
            destination,
            source: unspecified(destination),
            dport: DEFAULT_PORT,
            sport: 0,
            ..Self::base(destination)
        }
    }

    pub fn server(proto: Proto, source: IpAddr) -> Self {
        Self {
            role: Role::Server,
            proto,
            destination: unspecified(source),
            source,
            dport: 0,
            sport: DEFAULT_PORT,
            ..Self::base(source)
        }
    }

    fn base(addr: IpAddr) -> Self {
        Self {
            role: Role::Client,
            proto: Proto::Tcp,
            destination: unspecified(addr),
            source: unspecified(addr),
            dport: 0,
            sport: 0,
            interval_s: DEFAULT_INTERVAL_S,
            time_s: DEFAULT_TIME_S,
            bandwidth_limit: None,
            buffer_len: 0,
            tos: 0,
            format: OutputFormat::default(),
            rx_timeout: DEFAULT_RX_TIMEOUT,
            tcp_tx_timeout: DEFAULT_TCP_TX_TIMEOUT,
            traffic_priority: None,
            instance_id: 0,
            state_handler: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.interval_s == 0 {
            return Err(Error::InvalidArg("report interval must be positive"));
        }
        if self.time_s < self.interval_s {
            return Err(Error::InvalidArg("time must be at least one report interval"));
        }
        if self.source.is_ipv4() != self.destination.is_ipv4() {
            return Err(Error::InvalidArg("source and destination address families differ"));
        }
        if self.buffer_len != 0 && self.buffer_len < SEQ_HEADER_LEN {
            return Err(Error::InvalidArg("buffer too small for the sequence header"));
        }
        if self.bandwidth_limit == Some(0) {
            return Err(Error::InvalidArg("bandwidth limit must be positive"));
        }
        Ok(())
    }

    /// Buffer length after applying the role/proto defaults.
    pub(crate) fn resolved_buffer_len(&self) -> usize {
        match (self.role, self.proto) {
            // the server-side datagram buffer is fixed, overrides are ignored
            (Role::Server, Proto::Udp) => DEFAULT_UDP_RX_LEN,
            _ if self.buffer_len != 0 => self.buffer_len,
            (Role::Client, Proto::Udp) if self.destination.is_ipv6() => DEFAULT_IPV6_UDP_TX_LEN,
            (Role::Client, Proto::Udp) => DEFAULT_IPV4_UDP_TX_LEN,
            (Role::Client, Proto::Tcp) => DEFAULT_TCP_TX_LEN,
            (Role::Server, Proto::Tcp) => DEFAULT_TCP_RX_LEN,
        }
    }

    /// Transmit pacing period derived from the bandwidth limit, if one is set.
    pub(crate) fn tx_period(&self, buffer_len: usize) -> Option<Duration> {
        self.bandwidth_limit
            .map(|bw| Duration::from_micros(buffer_len as u64 * 8 * 1_000_000 / bw))
    }
}

fn unspecified(family_of: IpAddr) -> IpAddr {
    match family_of {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
