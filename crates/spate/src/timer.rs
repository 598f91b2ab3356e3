use std::{
    io,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::error;

/// Periodic callback running on its own thread.
///
/// The schedule is drift-free (`next += period`): a callback that runs late is
/// followed by shortened waits until the schedule has caught up, so the
/// long-run firing rate matches the period. [`PeriodicTimer::stop`] never
/// blocks and may be called from inside the callback itself; dropping the
/// timer joins the thread.
pub(crate) struct PeriodicTimer {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn spawn<F>(name: String, period: Duration, mut f: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name).spawn(move || {
            let mut next = Instant::now() + period;
            loop {
                let wait = next.saturating_duration_since(Instant::now());
                match stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                f();
                next += period;
            }
        })?;
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Asks the timer thread to exit without waiting for it.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[test]
    fn fires_periodically() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let timer = PeriodicTimer::spawn("test-timer".into(), Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(300));
        drop(timer);
        assert!(count.load(Ordering::Relaxed) >= 5);
    }

    #[test]
    fn stop_is_prompt() {
        let timer = PeriodicTimer::spawn("idle-timer".into(), Duration::from_secs(60), || {
            panic!("must not fire");
        })
        .unwrap();
        let t0 = Instant::now();
        timer.stop();
        drop(timer);
        assert!(t0.elapsed() < Duration::from_secs(1));
    }
}
