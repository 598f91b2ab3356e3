use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, InstanceId, Proto, Role, StateHandler, TICK_PERIOD, WORKERS_FINISH_TIMEOUT},
    error::Error,
    registry::Registry,
    report::{ReportSink, TrafficReport},
    snapshot::SnapshotCell,
    socket::Socket,
    timer::PeriodicTimer,
};

/// Lifecycle states delivered through the state callback, in order:
/// `Started` -> `Running`* -> `Stopped` -> `Closed`. `Closed` is always the
/// last callback for an id; the instance must not be referenced afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// First payload moved.
    Started,
    /// A report period was consumed.
    Running,
    /// Traffic ended (deadline, forced stop or error).
    Stopped,
    /// Workers exited, resources freed, id is reusable.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficType {
    TcpServer,
    TcpClient,
    UdpServer,
    UdpClient,
}

/// Payload of a state callback.
#[derive(Clone, Copy, Debug)]
pub struct StateEvent {
    pub state: State,
    pub traffic_type: TrafficType,
}

const WORKER_EXIT_POLL: Duration = Duration::from_millis(10);

/// One running measurement session, shared between the traffic worker, the
/// report worker, both timer callbacks and the registry.
pub(crate) struct Instance {
    pub id: InstanceId,
    pub role: Role,
    pub proto: Proto,
    pub destination: IpAddr,
    pub source: IpAddr,
    pub dport: u16,
    pub sport: u16,
    pub tos: u8,
    pub interval_s: u32,
    /// Deadline in ticks; forced stop writes 0 so the next tick elapses it.
    pub time_s: AtomicU32,
    pub buffer_len: usize,
    pub rx_timeout: Duration,
    pub tcp_tx_timeout: Duration,
    pub traffic_priority: Option<i32>,
    pub tx_period: Option<Duration>,

    pub is_running: AtomicBool,
    /// Hot-path byte counter: `fetch_add` by the traffic worker, drained with
    /// an atomic exchange by the tick callback only.
    pub period_bytes: AtomicU32,
    pub snapshot: SnapshotCell,
    /// Cumulative report, written only by the report worker.
    pub totals: Mutex<TrafficReport>,

    /// Live data socket (or the listener while a TCP server is accepting).
    /// The Arc keeps the fd valid for the forced-stop shutdown, so a close on
    /// the worker side can never race the unblock.
    pub socket: Mutex<Option<Arc<Socket>>>,
    pub local_addr: Mutex<Option<SocketAddr>>,
    pub target_addr: Mutex<Option<SocketAddr>>,

    pub tick_timer: Mutex<Option<PeriodicTimer>>,
    pub tx_timer: Mutex<Option<PeriodicTimer>>,

    pub report_notify: (Sender<()>, Receiver<()>),
    pub tx_notify: (Sender<()>, Receiver<()>),
    pub report_handle: Mutex<Option<JoinHandle<()>>>,

    pub state_handler: Option<Arc<StateHandler>>,
    pub sink: Arc<dyn ReportSink>,
    pub registry: Arc<Registry>,
}

impl Instance {
    pub fn new(
        cfg: &Config,
        id: InstanceId,
        sink: Arc<dyn ReportSink>,
        state_handler: Option<Arc<StateHandler>>,
        registry: Arc<Registry>,
    ) -> Self {
        let buffer_len = cfg.resolved_buffer_len();
        Self {
            id,
            role: cfg.role,
            proto: cfg.proto,
            destination: cfg.destination,
            source: cfg.source,
            dport: cfg.dport,
            sport: cfg.sport,
            tos: cfg.tos,
            interval_s: cfg.interval_s,
            time_s: AtomicU32::new(cfg.time_s),
            buffer_len,
            rx_timeout: cfg.rx_timeout,
            tcp_tx_timeout: cfg.tcp_tx_timeout,
            traffic_priority: cfg.traffic_priority,
            tx_period: cfg.tx_period(buffer_len),
            is_running: AtomicBool::new(false),
            period_bytes: AtomicU32::new(0),
            snapshot: SnapshotCell::default(),
            totals: Mutex::new(TrafficReport { format: cfg.format, ..TrafficReport::default() }),
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            target_addr: Mutex::new(None),
            tick_timer: Mutex::new(None),
            tx_timer: Mutex::new(None),
            report_notify: unbounded(),
            tx_notify: unbounded(),
            report_handle: Mutex::new(None),
            state_handler,
            sink,
            registry,
        }
    }

    pub fn traffic_type(&self) -> TrafficType {
        match (self.role, self.proto) {
            (Role::Server, Proto::Tcp) => TrafficType::TcpServer,
            (Role::Client, Proto::Tcp) => TrafficType::TcpClient,
            (Role::Server, Proto::Udp) => TrafficType::UdpServer,
            (Role::Client, Proto::Udp) => TrafficType::UdpClient,
        }
    }

    /// Delivers a lifecycle transition to the embedder. On `Started` the
    /// report worker is woken so it emits the connect-info record.
    pub fn state_action(&self, state: State) {
        if let Some(handler) = &self.state_handler {
            handler(self.id, &StateEvent { state, traffic_type: self.traffic_type() });
        }
        if state == State::Started {
            let _ = self.report_notify.0.send(());
        }
    }

    /// Arms the tick timer (and the tx pacing timer when a bandwidth limit is
    /// set). Clients call this before their loop; servers once the first
    /// payload arrived.
    pub fn start_timers(self: &Arc<Self>) -> Result<(), Error> {
        if let Some(period) = self.tx_period {
            let notify = self.tx_notify.0.clone();
            let timer = PeriodicTimer::spawn(format!("spate-tx-{}", self.id), period, move || {
                let _ = notify.send(());
            })
            .map_err(|_| Error::Fatal("failed to start tx timer"))?;
            *self.tx_timer.lock().unwrap() = Some(timer);
        }

        let weak = Arc::downgrade(self);
        let mut ticks: u32 = 0;
        let mut to_report_ticks: u32 = 0;
        let timer = PeriodicTimer::spawn(format!("spate-tick-{}", self.id), TICK_PERIOD, move || {
            let Some(inst) = weak.upgrade() else { return };
            ticks += 1;
            to_report_ticks += 1;

            let time = inst.time_s.load(Ordering::Relaxed);
            if to_report_ticks >= inst.interval_s || ticks >= time {
                let drained = inst.period_bytes.swap(0, Ordering::AcqRel);
                if inst.snapshot.publish(drained, to_report_ticks) {
                    // the report worker has not consumed the previous
                    // snapshot in time; its period was extended instead
                    warn!(id = inst.id, "report worker is starving for execution time");
                }
                to_report_ticks = 0;

                if ticks >= time {
                    inst.stop_exec();
                } else {
                    let _ = inst.report_notify.0.send(());
                }
            }
        })
        .map_err(|_| Error::Fatal("failed to start tick timer"))?;
        *self.tick_timer.lock().unwrap() = Some(timer);
        Ok(())
    }

    /// Forced-stop protocol. Idempotent and callable from any thread,
    /// including the tick callback; nothing here blocks.
    pub fn stop_exec(&self) {
        if let Some(timer) = self.tick_timer.lock().unwrap().as_ref() {
            timer.stop();
        }
        if let Some(timer) = self.tx_timer.lock().unwrap().as_ref() {
            timer.stop();
        }

        self.is_running.store(false, Ordering::Release);

        // release a client waiting on the tx pacing notification
        if self.role == Role::Client && self.tx_period.is_some() {
            let _ = self.tx_notify.0.send(());
        }
        // release a server sleeping in recvfrom/accept
        if self.role == Role::Server {
            if let Some(socket) = self.socket.lock().unwrap().as_ref() {
                socket.shutdown();
            }
        }
        // release the report worker so it observes is_running == false
        let _ = self.report_notify.0.send(());
    }

    /// User-initiated stop: elapse the deadline, then run the stop sequence.
    pub fn force_stop(&self) {
        info!(id = self.id, "waiting for instance to stop");
        self.time_s.store(0, Ordering::Relaxed);
        self.stop_exec();
    }

    /// Final teardown, run on the traffic worker after its loop returned (or
    /// on the starting thread when setup failed before a traffic worker
    /// existed). Waits a bounded time for the report worker; emits `Closed`
    /// and drops the registry entry on success. Returns `false` when the
    /// report worker failed to exit in time and the instance was deliberately
    /// left behind: freeing it would race a hung worker.
    pub fn delete(&self) -> bool {
        let handle = self.report_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let mut waited = Duration::ZERO;
            while !handle.is_finished() && waited < WORKERS_FINISH_TIMEOUT {
                thread::sleep(WORKER_EXIT_POLL);
                waited += WORKER_EXIT_POLL;
            }
            if !handle.is_finished() {
                error!(id = self.id, "report worker hanged, the instance cannot be cleared");
                return false;
            }
            if handle.join().is_err() {
                error!(id = self.id, "report worker panicked");
            }
        }

        // joins the timer threads; keep the instance lock-free while doing so
        let tick = self.tick_timer.lock().unwrap().take();
        drop(tick);
        let tx = self.tx_timer.lock().unwrap().take();
        drop(tx);

        debug!(id = self.id, "deleting instance");
        self.state_action(State::Closed);
        self.registry.remove(self.id);
        true
    }
}
