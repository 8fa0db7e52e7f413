//! Single-threaded event loop with cross-thread task posting and
//! re-armable wall-clock timers.
//!
//! Timer deadlines are kept in nanoseconds since the unix epoch rather
//! than as monotonic instants: batch plans are scheduled against the wall
//! clock by a remote planner, and deadline equality must be exact so that
//! re-arming the head timer to an unchanged deadline stays a no-op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Outcome delivered to a timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Ok,
    Cancelled,
}

type Task = Box<dyn FnOnce() + Send>;
type TimerCallback = Box<dyn FnOnce(TimerStatus) + Send>;

/// Current wall-clock time in nanoseconds since the unix epoch.
pub fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

struct TimerSlot {
    deadline_ns: Option<i64>,
    generation: u64,
    callback: Option<TimerCallback>,
}

#[derive(Default)]
struct LoopState {
    tasks: VecDeque<Task>,
    // (deadline, timer id, generation); superseded generations are skipped
    // lazily when popped.
    heap: BinaryHeap<Reverse<(i64, u64, u64)>>,
    timers: HashMap<u64, TimerSlot>,
}

struct Shared {
    state: Mutex<LoopState>,
    cv: Condvar,
    stop: AtomicBool,
    next_timer_id: AtomicU64,
}

#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::default()),
                cv: Condvar::new(),
                stop: AtomicBool::new(false),
                next_timer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueues a callback to run on the loop thread. Safe from any thread.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(Box::new(f));
        self.shared.cv.notify_one();
    }

    /// Creates a disarmed timer bound to this executor.
    pub fn timer(&self) -> Timer {
        let id = self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().timers.insert(
            id,
            TimerSlot {
                deadline_ns: None,
                generation: 0,
                callback: None,
            },
        );
        Timer {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Runs the loop on the calling thread until [`Executor::stop_event_loop`].
    pub fn run_event_loop(&self) {
        let shared = &self.shared;
        let mut guard = shared.state.lock();
        loop {
            if shared.stop.load(Ordering::Acquire) {
                break;
            }

            if let Some(task) = guard.tasks.pop_front() {
                MutexGuard::unlocked(&mut guard, task);
                continue;
            }

            let now = wall_clock_ns();
            if let Some(callback) = Self::take_due_timer(&mut guard, now) {
                MutexGuard::unlocked(&mut guard, || callback(TimerStatus::Ok));
                continue;
            }

            match Self::next_deadline(&guard) {
                Some(deadline) => {
                    let wait = deadline.saturating_sub(now).max(0) as u64;
                    shared
                        .cv
                        .wait_for(&mut guard, Duration::from_nanos(wait));
                }
                None => {
                    shared.cv.wait(&mut guard);
                }
            }
        }

        // Deliver cancellation to every pending wait, then discard any
        // tasks that never got to run.
        let mut cancelled = Vec::new();
        for slot in guard.timers.values_mut() {
            slot.deadline_ns = None;
            if let Some(callback) = slot.callback.take() {
                cancelled.push(callback);
            }
        }
        let dropped_tasks = guard.tasks.len();
        guard.tasks.clear();
        guard.heap.clear();
        drop(guard);
        if dropped_tasks > 0 {
            log::debug!("event loop stopped with {dropped_tasks} pending tasks");
        }
        for callback in cancelled {
            callback(TimerStatus::Cancelled);
        }
    }

    pub fn stop_event_loop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _guard = self.shared.state.lock();
        self.shared.cv.notify_all();
    }

    fn take_due_timer(guard: &mut MutexGuard<'_, LoopState>, now: i64) -> Option<TimerCallback> {
        while let Some(&Reverse((deadline, id, generation))) = guard.heap.peek() {
            if deadline > now {
                return None;
            }
            guard.heap.pop();
            let Some(slot) = guard.timers.get_mut(&id) else {
                continue;
            };
            if slot.generation != generation || slot.deadline_ns != Some(deadline) {
                continue;
            }
            // Clear the armed deadline before the callback runs so that a
            // re-arm to the same instant from inside the callback fires
            // again instead of being skipped as a duplicate.
            slot.deadline_ns = None;
            if let Some(callback) = slot.callback.take() {
                return Some(callback);
            }
        }
        None
    }

    fn next_deadline(guard: &MutexGuard<'_, LoopState>) -> Option<i64> {
        // Stale heap entries may wake the loop early; it re-evaluates and
        // goes back to sleep, which is harmless.
        guard.heap.peek().map(|&Reverse((deadline, _, _))| deadline)
    }
}

/// One re-armable timer. Arming an already-armed timer with the same
/// deadline is a no-op; a different deadline replaces the pending fire.
pub struct Timer {
    shared: Arc<Shared>,
    id: u64,
}

impl Timer {
    pub fn set_timeout(&self, deadline_ns: i64) {
        let mut state = self.shared.state.lock();
        let slot = state.timers.get_mut(&self.id).expect("timer slot");
        if slot.deadline_ns == Some(deadline_ns) {
            return;
        }
        slot.generation += 1;
        slot.deadline_ns = Some(deadline_ns);
        let generation = slot.generation;
        state.heap.push(Reverse((deadline_ns, self.id, generation)));
        self.shared.cv.notify_one();
    }

    /// Registers the callback for the next fire, replacing any previous one.
    pub fn async_wait(&self, callback: impl FnOnce(TimerStatus) + Send + 'static) {
        let mut state = self.shared.state.lock();
        let slot = state.timers.get_mut(&self.id).expect("timer slot");
        slot.callback = Some(Box::new(callback));
        self.shared.cv.notify_one();
    }

    /// Currently armed deadline, or `None` once fired or never armed.
    pub fn timeout_ns(&self) -> Option<i64> {
        let state = self.shared.state.lock();
        state.timers.get(&self.id).and_then(|slot| slot.deadline_ns)
    }

    /// Disarms the timer and delivers `Cancelled` to a registered callback.
    pub fn cancel(&self) {
        let callback = {
            let mut state = self.shared.state.lock();
            let slot = state.timers.get_mut(&self.id).expect("timer slot");
            slot.deadline_ns = None;
            slot.generation += 1;
            slot.callback.take()
        };
        if let Some(callback) = callback {
            callback(TimerStatus::Cancelled);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().timers.remove(&self.id);
    }
}
