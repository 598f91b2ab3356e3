use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes moved during a report period paired with the seconds the period
/// spans. `seconds == 0` marks the cell as consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub bytes: u32,
    pub seconds: u32,
}

/// Handoff cell between the tick callback (producer) and the report worker
/// (consumer). Both halves are packed into a single 64-bit atomic and every
/// operation is one read-modify-write, so the consumer always observes a
/// matched (bytes, seconds) pair and a concurrent [`SnapshotCell::take`] can
/// never interleave with a half-applied merge.
#[derive(Debug, Default)]
pub(crate) struct SnapshotCell(AtomicU64);

impl SnapshotCell {
    /// Publishes one period. An unconsumed previous snapshot is extended in
    /// the same atomic step; returns true when that happened.
    pub fn publish(&self, bytes: u32, seconds: u32) -> bool {
        let mut extended = false;
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            let pending = unpack(current);
            extended = pending.seconds != 0;
            let next = if extended {
                Snapshot {
                    bytes: pending.bytes.wrapping_add(bytes),
                    seconds: pending.seconds + seconds,
                }
            } else {
                Snapshot { bytes, seconds }
            };
            Some(pack(next))
        });
        extended
    }

    /// Folds tail bytes into the cell without stretching a pending period;
    /// an empty cell becomes a one-second period.
    pub fn fold(&self, bytes: u32) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            let pending = unpack(current);
            Some(pack(Snapshot {
                bytes: pending.bytes.wrapping_add(bytes),
                seconds: pending.seconds.max(1),
            }))
        });
    }

    /// Atomically takes the pending snapshot, leaving the consumed marker.
    pub fn take(&self) -> Snapshot {
        unpack(self.0.swap(0, Ordering::AcqRel))
    }
}

fn pack(s: Snapshot) -> u64 {
    (u64::from(s.bytes) << 32) | u64::from(s.seconds)
}

fn unpack(v: u64) -> Snapshot {
    Snapshot { bytes: (v >> 32) as u32, seconds: v as u32 }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicBool,
        thread,
    };

    use super::*;

    #[test]
    fn publish_then_take() {
        let cell = SnapshotCell::default();
        assert!(!cell.publish(1024, 3));
        assert_eq!(cell.take(), Snapshot { bytes: 1024, seconds: 3 });
        assert_eq!(cell.take(), Snapshot::default());
    }

    #[test]
    fn publish_extends_an_unconsumed_snapshot() {
        let cell = SnapshotCell::default();
        assert!(!cell.publish(100, 1));
        assert!(cell.publish(50, 2));
        assert_eq!(cell.take(), Snapshot { bytes: 150, seconds: 3 });
    }

    #[test]
    fn fold_creates_or_joins_a_period() {
        let cell = SnapshotCell::default();
        cell.fold(64);
        assert_eq!(cell.take(), Snapshot { bytes: 64, seconds: 1 });

        cell.publish(100, 2);
        cell.fold(28);
        assert_eq!(cell.take(), Snapshot { bytes: 128, seconds: 2 });
    }

    #[test]
    fn zero_seconds_means_consumed() {
        let cell = SnapshotCell::default();
        assert_eq!(cell.take().seconds, 0);
        cell.publish(1, 1);
        assert_ne!(cell.take().seconds, 0);
    }

    #[test]
    fn concurrent_takes_never_lose_bytes() {
        const ROUNDS: u64 = 100_000;
        let cell = SnapshotCell::default();
        let done = AtomicBool::new(false);
        let mut consumed: u64 = 0;

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    cell.publish(7, 1);
                }
                done.store(true, Ordering::Release);
            });

            loop {
                consumed += u64::from(cell.take().bytes);
                if done.load(Ordering::Acquire) {
                    consumed += u64::from(cell.take().bytes);
                    break;
                }
            }
        });

        assert_eq!(consumed, ROUNDS * 7);
    }
}
