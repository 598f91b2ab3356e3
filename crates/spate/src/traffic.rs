use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use tracing::{Level, debug, error, span};

use crate::{
    config::{Proto, Role, SEQ_HEADER_LEN, SOCKET_ACCEPT_TIMEOUT},
    error::Error,
    instance::{Instance, State},
    socket::Socket,
    thread::boot_traffic_thread,
};

/// Traffic worker entry point. Runs the socket setup and loop for the
/// instance's role/proto combination, then drives the teardown: whatever the
/// outcome, the stop sequence runs, the socket closes and the instance is
/// deleted from this thread.
pub(crate) fn traffic_worker(inst: Arc<Instance>) {
    let _span = span!(Level::INFO, "traffic", id = inst.id).entered();
    boot_traffic_thread(inst.traffic_priority);

    let result = match (inst.role, inst.proto) {
        (Role::Server, Proto::Tcp) => run_tcp_server(&inst),
        (Role::Client, Proto::Tcp) => run_tcp_client(&inst),
        (Role::Server, Proto::Udp) => run_udp_server(&inst),
        (Role::Client, Proto::Udp) => run_udp_client(&inst),
    };
    if let Err(err) = result {
        error!(%err, "traffic worker failed");
    }

    inst.stop_exec();
    // last Arc to the fd drops here (or in delete, if a stale clone remains)
    inst.socket.lock().unwrap().take();
    inst.delete();
    debug!("traffic worker exiting");
}

fn run_tcp_server(inst: &Arc<Instance>) -> Result<(), Error> {
    let v6 = inst.source.is_ipv6();
    let listener = Socket::new(v6, Proto::Tcp).map_err(Error::SocketCreate)?;
    listener.set_reuseaddr().map_err(Error::SocketCreate)?;
    if v6 {
        listener.set_v6only().map_err(Error::SocketCreate)?;
    }
    listener.bind(SocketAddr::new(inst.source, inst.sport)).map_err(Error::SocketBind)?;
    listener.listen(1).map_err(Error::SocketListen)?;
    listener.set_recv_timeout(SOCKET_ACCEPT_TIMEOUT).map_err(Error::SocketCreate)?;
    debug!(source = %inst.source, port = inst.sport, "tcp server listening");

    // the listener occupies the socket slot while accept blocks, so a forced
    // stop can unblock it
    let listener = Arc::new(listener);
    *inst.socket.lock().unwrap() = Some(listener.clone());

    let (socket, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(err) => {
            // the client never connected
            inst.socket.lock().unwrap().take();
            return Err(Error::SocketAccept(err));
        }
    };
    debug!(%peer, "accepted");

    let socket = Arc::new(socket);
    socket.set_recv_timeout(inst.rx_timeout).map_err(Error::SocketIo)?;
    socket.set_tos(inst.tos).map_err(Error::SocketIo)?;
    *inst.target_addr.lock().unwrap() = Some(peer);
    *inst.local_addr.lock().unwrap() = Some(socket.local_addr().map_err(Error::SocketIo)?);
    // replaces (and thereby releases) the listener
    *inst.socket.lock().unwrap() = Some(socket.clone());

    server_loop(inst, &socket)
}

fn run_tcp_client(inst: &Arc<Instance>) -> Result<(), Error> {
    let v6 = inst.destination.is_ipv6();
    let socket = Socket::new(v6, Proto::Tcp).map_err(Error::SocketCreate)?;
    if inst.sport != 0 || !inst.source.is_unspecified() {
        socket.set_reuseaddr().map_err(Error::SocketCreate)?;
        socket.bind(SocketAddr::new(inst.source, inst.sport)).map_err(Error::SocketBind)?;
    }

    let target = SocketAddr::new(inst.destination, inst.dport);
    socket.connect(target).map_err(Error::SocketConnect)?;
    socket.set_send_timeout(inst.tcp_tx_timeout).map_err(Error::SocketIo)?;
    socket.set_tos(inst.tos).map_err(Error::SocketIo)?;
    debug!(%target, "tcp client connected");
    *inst.target_addr.lock().unwrap() = Some(target);

    let socket = Arc::new(socket);
    *inst.socket.lock().unwrap() = Some(socket.clone());

    inst.start_timers()?;
    client_loop(inst, &socket)
}

fn run_udp_server(inst: &Arc<Instance>) -> Result<(), Error> {
    let v6 = inst.source.is_ipv6();
    let socket = Socket::new(v6, Proto::Udp).map_err(Error::SocketCreate)?;
    socket.set_reuseaddr().map_err(Error::SocketCreate)?;
    socket.bind(SocketAddr::new(inst.source, inst.sport)).map_err(Error::SocketBind)?;
    socket.set_recv_timeout(inst.rx_timeout).map_err(Error::SocketCreate)?;
    socket.set_tos(inst.tos).map_err(Error::SocketCreate)?;
    *inst.local_addr.lock().unwrap() = Some(socket.local_addr().map_err(Error::SocketIo)?);
    debug!(source = %inst.source, port = inst.sport, "udp server bound");

    let socket = Arc::new(socket);
    *inst.socket.lock().unwrap() = Some(socket.clone());

    server_loop(inst, &socket)
}

fn run_udp_client(inst: &Arc<Instance>) -> Result<(), Error> {
    let v6 = inst.destination.is_ipv6();
    let socket = Socket::new(v6, Proto::Udp).map_err(Error::SocketCreate)?;
    socket.set_reuseaddr().map_err(Error::SocketCreate)?;
    if inst.sport != 0 || !inst.source.is_unspecified() {
        socket.bind(SocketAddr::new(inst.source, inst.sport)).map_err(Error::SocketBind)?;
    }
    socket.set_tos(inst.tos).map_err(Error::SocketCreate)?;

    let target = SocketAddr::new(inst.destination, inst.dport);
    debug!(%target, "udp client sending");
    *inst.target_addr.lock().unwrap() = Some(target);

    let socket = Arc::new(socket);
    *inst.socket.lock().unwrap() = Some(socket.clone());

    inst.start_timers()?;
    client_loop(inst, &socket)
}

/// Sends fixed-size buffers, stamping each with a monotonic big-endian
/// sequence number, and credits successful sends to the period counter.
/// With a tx timer the loop paces itself on its notification; otherwise it
/// sends back to back.
fn client_loop(inst: &Arc<Instance>, socket: &Arc<Socket>) -> Result<(), Error> {
    let mut buf = alloc_buffer(inst.buffer_len)?;
    let paced = inst.tx_period.is_some();
    let udp = inst.proto == Proto::Udp;
    let target = inst
        .target_addr
        .lock()
        .unwrap()
        .ok_or(Error::Fatal("client target address missing"))?;
    let mut sequence: u32 = 0;
    let mut started = false;

    let result = loop {
        // pending notifications are not cleared across sends, so a transmit
        // delayed by reporting is caught up with back-to-back wakeups
        if paced && inst.tx_notify.1.recv().is_err() {
            break Ok(());
        }
        if !inst.is_running.load(Ordering::Acquire) {
            break Ok(());
        }

        buf[..SEQ_HEADER_LEN].copy_from_slice(&sequence.to_be_bytes());
        sequence = sequence.wrapping_add(1);

        let sent = if udp { socket.send_to(&buf, target) } else { socket.send(&buf) };
        match sent {
            Ok(n) if n == buf.len() => {
                inst.period_bytes.fetch_add(n as u32, Ordering::AcqRel);
                if !started {
                    if let Ok(local) = socket.local_addr() {
                        *inst.local_addr.lock().unwrap() = Some(local);
                    }
                    inst.state_action(State::Started);
                    started = true;
                }
            }
            Ok(_) => {
                if !inst.is_running.load(Ordering::Acquire) {
                    break Ok(());
                }
                break Err(Error::Fatal("short write on stream socket"));
            }
            Err(err) => {
                if !inst.is_running.load(Ordering::Acquire) {
                    break Ok(());
                }
                // ENOMEM / ENOBUFS mean kernel buffer back-pressure: drop the
                // datagram from the count and keep sending
                if udp
                    && matches!(err.raw_os_error(), Some(code) if code == libc::ENOMEM || code == libc::ENOBUFS)
                {
                    continue;
                }
                break Err(Error::SocketIo(err));
            }
        }
    };

    if started {
        inst.state_action(State::Stopped);
    }
    result
}

/// Receives into a fixed buffer and credits the period counter. Timers are
/// armed only once the first payload arrived, so the measurement window
/// aligns with data rather than with listen time.
fn server_loop(inst: &Arc<Instance>, socket: &Arc<Socket>) -> Result<(), Error> {
    let mut buf = alloc_buffer(inst.buffer_len)?;
    let udp = inst.proto == Proto::Udp;
    let mut started = false;

    let result = loop {
        let received = if udp {
            socket.recv_from(&mut buf).map(|(n, from)| {
                if !started && from.is_some() {
                    *inst.target_addr.lock().unwrap() = from;
                }
                n
            })
        } else {
            socket.recv(&mut buf)
        };

        if !inst.is_running.load(Ordering::Acquire) {
            break Ok(());
        }

        match received {
            Ok(0) if !udp => {
                // peer closed the stream; fold the tail bytes of the partial
                // period into the snapshot before leaving
                flush_residual(inst);
                break Ok(());
            }
            Ok(n) => {
                inst.period_bytes.fetch_add(n as u32, Ordering::AcqRel);
                if !started {
                    inst.start_timers()?;
                    inst.state_action(State::Started);
                    started = true;
                }
            }
            Err(err) => break Err(Error::SocketIo(err)),
        }
    };

    if started {
        inst.state_action(State::Stopped);
    }
    result
}

/// Moves bytes received since the last tick into the snapshot so the summary
/// does not lose the partial period when the loop exits between ticks.
fn flush_residual(inst: &Instance) {
    let residual = inst.period_bytes.swap(0, Ordering::AcqRel);
    if residual != 0 {
        inst.snapshot.fold(residual);
    }
}

fn alloc_buffer(len: usize) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::NoMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}
