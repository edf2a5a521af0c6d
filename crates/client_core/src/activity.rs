use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};
use tracing::info;

/// No activity for this long marks the session idle; the next activity event
/// triggers one recovery attempt.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(120);

/// The UI-side events that count as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Keyboard,
    Refocus,
}

/// Last-observed user interaction time plus the single-recovery gate.
pub struct IdleMonitor {
    idle_threshold: Duration,
    last_activity: Mutex<Instant>,
    recovery_in_flight: Arc<AtomicBool>,
}

impl IdleMonitor {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            idle_threshold,
            last_activity: Mutex::new(Instant::now()),
            recovery_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Records one activity event and reports whether it crossed an
    /// idle-to-active boundary.
    pub async fn observe(&self, kind: ActivityKind) -> bool {
        let mut last_activity = self.last_activity.lock().await;
        let now = Instant::now();
        let was_idle = now.duration_since(*last_activity) >= self.idle_threshold;
        *last_activity = now;
        if was_idle {
            info!(?kind, "activity after idle period; recovery due");
        }
        was_idle
    }

    /// Claims the single recovery slot. A recovery already running suppresses
    /// the duplicate; the attempt is dropped, not queued. The guard reopens
    /// the slot on drop.
    pub fn begin_recovery(&self) -> Option<RecoveryGuard> {
        self.recovery_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecoveryGuard {
                slot: Arc::clone(&self.recovery_in_flight),
            })
    }

    /// Restarts the idle countdown after a failed recovery so the next
    /// idle-to-active transition retries.
    pub async fn reset(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

pub struct RecoveryGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "tests/activity_tests.rs"]
mod tests;
