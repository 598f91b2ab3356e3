use tracing::warn;

/// Pins the calling thread to the last CPU core so the traffic hot path does
/// not migrate, then applies the optional realtime priority. Single-core
/// hosts and failed affinity calls are tolerated; the pin is a hint.
pub(crate) fn boot_traffic_thread(priority: Option<i32>) {
    if let Some(cores) = core_affinity::get_core_ids() {
        if cores.len() >= 2 {
            let core = cores[cores.len() - 1];
            if !core_affinity::set_for_current(core) {
                warn!(core = core.id, "couldn't set core affinity");
            }
        }
    }
    set_thread_prio(priority);
}

/// Requests `SCHED_FIFO` scheduling if the process has permission
/// (CAP_SYS_NICE). If setting the policy fails, execution continues under
/// the OS default.
#[cfg(target_os = "linux")]
fn set_thread_prio(priority: Option<i32>) {
    let Some(prio) = priority else { return };
    let param = libc::sched_param { sched_priority: prio };
    let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if code != 0 {
        warn!(%code, prio, "couldn't set traffic thread priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_prio(priority: Option<i32>) {
    if priority.is_some() {
        warn!("thread priority setting only supported on linux");
    }
}
