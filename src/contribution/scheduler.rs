//! Retry/Timer Scheduler
//!
//! Two independent timers: reconcile (monthly kickoff) and queue drain. A
//! timer id is handed out when armed and delivered on the channel when it
//! fires; `on_timer` clears the slot so the timer can be armed again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Log target for timer chatter, silenced unless `enable_tracing` is set
pub const TARGET_TIMER: &str = "CONTRIB::TIMER";

/// Fired timer id
pub type TimerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconcile,
    Queue,
}

/// Random delay with mean `mean_secs`, never below one second
pub fn geometric_delay(mean_secs: u64) -> Duration {
    if mean_secs == 0 {
        return Duration::from_secs(1);
    }
    let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
    let secs = -(mean_secs as f64) * u.ln();
    Duration::from_secs_f64(secs.max(1.0))
}

/// Delay before the queue is drained again
pub fn queue_delay(testing: bool, mean_secs: u64) -> Duration {
    if testing {
        Duration::from_secs(1)
    } else {
        geometric_delay(mean_secs)
    }
}

/// Time until the reconcile stamp, zero when it already passed
pub fn reconcile_delay(stamp: i64, now: i64) -> Duration {
    Duration::from_secs(stamp.saturating_sub(now).max(0) as u64)
}

struct Armed {
    id: TimerId,
    handle: JoinHandle<()>,
}

pub struct Timers {
    fallback_mean_secs: u64,
    last_id: AtomicU32,
    slots: Mutex<HashMap<TimerKind, Armed>>,
    fired: mpsc::UnboundedSender<TimerId>,
}

impl Timers {
    /// Returns the scheduler and the channel fired ids arrive on
    pub fn new(fallback_mean_secs: u64) -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                fallback_mean_secs,
                last_id: AtomicU32::new(0),
                slots: Mutex::new(HashMap::new()),
                fired,
            },
            rx,
        )
    }

    /// Arm `kind` unless it is already armed.
    ///
    /// A zero delay is replaced by a random fallback. Returns the new id, or
    /// `None` when the timer was already pending.
    pub fn set_timer(&self, kind: TimerKind, delay: Duration) -> Option<TimerId> {
        let mut slots = self.lock();
        if slots.contains_key(&kind) {
            return None;
        }

        let delay = if delay.is_zero() {
            geometric_delay(self.fallback_mean_secs)
        } else {
            delay
        };

        let id = self.last_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine shut down
            let _ = fired.send(id);
        });

        debug!(target: TARGET_TIMER, timer_id = id, ?kind, delay_secs = delay.as_secs(), "Timer armed");
        slots.insert(kind, Armed { id, handle });
        Some(id)
    }

    /// Clear the slot holding `id`; `None` for ids that are not pending
    pub fn on_timer(&self, id: TimerId) -> Option<TimerKind> {
        let mut slots = self.lock();
        let kind = slots
            .iter()
            .find(|(_, armed)| armed.id == id)
            .map(|(kind, _)| *kind)?;
        slots.remove(&kind);
        Some(kind)
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.lock().contains_key(&kind)
    }

    /// Abort every pending timer
    pub fn cancel_all(&self) {
        for (_, armed) in self.lock().drain() {
            armed.handle.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TimerKind, Armed>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
