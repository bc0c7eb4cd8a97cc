//! Periodic monitoring loop.
//!
//! Every health-check interval the loop runs one tick of work in its own
//! task, so a panicking tick is logged and the loop keeps going. Integrity
//! scans piggyback on ticks once their own interval has elapsed.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// How long [`MonitorHandle::stop`] waits for an in-flight tick.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Work due on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTick {
    pub number: u64,
    pub health: bool,
    pub integrity: bool,
}

#[derive(Debug)]
pub struct MonitorSchedule {
    integrity_every: Duration,
    last_integrity: Instant,
    ticks: u64,
}

impl MonitorSchedule {
    pub fn new(integrity_every: Duration, started: Instant) -> Self {
        Self {
            integrity_every,
            last_integrity: started,
            ticks: 0,
        }
    }

    /// Work due at `now`. A zero integrity interval disables scans.
    pub fn due(&mut self, now: Instant) -> MonitorTick {
        self.ticks += 1;
        let integrity = !self.integrity_every.is_zero()
            && now.saturating_duration_since(self.last_integrity) >= self.integrity_every;
        if integrity {
            self.last_integrity = now;
        }
        MonitorTick {
            number: self.ticks,
            health: true,
            integrity,
        }
    }
}

pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the loop and wait briefly for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let mut task = self.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!("Monitoring loop did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Start the loop. `tick` returns `None` when the owner is gone, which ends
/// the loop.
pub fn spawn<F, Fut>(every: Duration, integrity_every: Duration, tick: F) -> MonitorHandle
where
    F: Fn(MonitorTick) -> Option<Fut> + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;
        let mut schedule = MonitorSchedule::new(integrity_every, Instant::now());

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            }
            let due = schedule.due(Instant::now());
            let Some(work) = tick(due) else {
                debug!("Monitor owner dropped");
                break;
            };
            if let Err(e) = tokio::spawn(work).await {
                error!(tick = due.number, error = %e, "Monitoring tick failed");
            }
        }
        debug!("Monitoring loop stopped");
    });
    MonitorHandle { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_schedule_spaces_integrity_scans() {
        let t0 = Instant::now();
        let mut schedule = MonitorSchedule::new(Duration::from_secs(10), t0);
        assert!(!schedule.due(t0 + Duration::from_secs(5)).integrity);
        let tick = schedule.due(t0 + Duration::from_secs(10));
        assert!(tick.integrity);
        assert_eq!(tick.number, 2);
        assert!(!schedule.due(t0 + Duration::from_secs(15)).integrity);
        assert!(schedule.due(t0 + Duration::from_secs(21)).integrity);
    }

    #[test]
    fn test_zero_interval_disables_scans() {
        let t0 = Instant::now();
        let mut schedule = MonitorSchedule::new(Duration::ZERO, t0);
        assert!(!schedule.due(t0 + Duration::from_secs(3600)).integrity);
    }

    #[tokio::test]
    async fn test_panicking_tick_does_not_stop_loop() {
        let ticks = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&ticks);
        let handle = spawn(Duration::from_millis(10), Duration::ZERO, move |tick| {
            let seen = Arc::clone(&seen);
            Some(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if tick.number == 1 {
                    panic!("probe exploded");
                }
            })
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_running());
        handle.stop().await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_loop_ends_when_owner_gone() {
        let handle = spawn(
            Duration::from_millis(5),
            Duration::ZERO,
            |_| None::<std::future::Ready<()>>,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_running());
    }
}
