//! Multi-instance network throughput measurement engine.
//!
//! Each instance is one measurement session (one socket, one direction, one
//! peer) with iperf-compatible wire behavior over TCP or UDP, IPv4 or IPv6,
//! in client or server role. Several instances run concurrently inside one
//! [`Engine`], each with its own traffic worker, report worker and timers.
//!
//! ```no_run
//! use spate::{Config, Engine, Proto};
//!
//! let engine = Engine::new();
//! let id = engine.start_instance(&Config::client(Proto::Udp, "192.168.1.10".parse().unwrap()))?;
//! // ... traffic and periodic reports flow until the deadline ...
//! engine.stop_instance(id)?;
//! # Ok::<(), spate::Error>(())
//! ```

mod config;
mod engine;
mod error;
mod instance;
mod registry;
mod report;
mod snapshot;
mod socket;
mod thread;
mod timer;
mod traffic;

pub use config::{
    Config, DEFAULT_INTERVAL_S, DEFAULT_PORT, DEFAULT_RX_TIMEOUT, DEFAULT_TCP_TX_TIMEOUT,
    DEFAULT_TIME_S, InstanceId, OutputFormat, Proto, Role, StateHandler,
};
pub use engine::{ALL_INSTANCES, Engine};
pub use error::Error;
pub use instance::{State, StateEvent, TrafficType};
pub use report::{Report, ReportSink, StdoutSink, TrafficReport};
