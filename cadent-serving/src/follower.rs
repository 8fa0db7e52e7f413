//! The plan follower: fires batch plans at their scheduled wall-clock
//! instant and dispatches them to the named model replica.
//!
//! Pending plans wait in a min-heap keyed by execution time while a single
//! re-armable timer tracks the head of the heap. The timer is re-armed
//! only when the head deadline changes: every add re-checks the head, and
//! the equality skip keeps repeated adds at the same head deadline from
//! re-registering the wait forever.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use cadent_transport::{Executor, Timer, TimerStatus, wall_clock_ns};
use parking_lot::Mutex;

use crate::cpu;
use crate::model::ModelExecutor;
use crate::plan::BatchPlan;

const DELAY_WARN_THRESHOLD_US: i64 = 100;

struct PlanEntry {
    plan: Arc<BatchPlan>,
    seq: u64,
}

impl PartialEq for PlanEntry {
    fn eq(&self, other: &Self) -> bool {
        self.plan.exec_time_ns() == other.plan.exec_time_ns() && self.seq == other.seq
    }
}

impl Eq for PlanEntry {}

impl PartialOrd for PlanEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PlanEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest plan is on top,
        // insertion order breaking ties.
        other
            .plan
            .exec_time_ns()
            .cmp(&self.plan.exec_time_ns())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Execution counters and the most recent delays, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FollowerTelemetry {
    pub executed_plans: u64,
    pub dropped_plans: u64,
    pub last_start_delay_us: i64,
    pub last_finish_delay_us: i64,
}

struct FollowerInner {
    gpu_id: i32,
    models: Mutex<Vec<Option<Arc<dyn ModelExecutor>>>>,
    plans: Mutex<BinaryHeap<PlanEntry>>,
    timer: Timer,
    next_seq: AtomicU64,
    is_executing: AtomicBool,
    executed_plans: AtomicU64,
    dropped_plans: AtomicU64,
    last_start_delay_us: AtomicI64,
    last_finish_delay_us: AtomicI64,
}

pub struct PlanFollower {
    executor: Executor,
    inner: Arc<FollowerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlanFollower {
    pub fn new(gpu_id: i32) -> Self {
        let executor = Executor::new();
        let timer = executor.timer();
        Self {
            inner: Arc::new(FollowerInner {
                gpu_id,
                models: Mutex::new(Vec::new()),
                plans: Mutex::new(BinaryHeap::new()),
                timer,
                next_seq: AtomicU64::new(0),
                is_executing: AtomicBool::new(false),
                executed_plans: AtomicU64::new(0),
                dropped_plans: AtomicU64::new(0),
                last_start_delay_us: AtomicI64::new(0),
                last_finish_delay_us: AtomicI64::new(0),
            }),
            executor,
            thread: Mutex::new(None),
        }
    }

    /// Spawns the executor thread, optionally pinned to `pin_core`.
    pub fn start(&self, pin_core: Option<usize>) {
        let executor = self.executor.clone();
        let gpu_id = self.inner.gpu_id;
        let handle = thread::Builder::new()
            .name("cadent-plan-follower".to_string())
            .spawn(move || {
                if let Some(core) = pin_core {
                    cpu::pin_current_thread(core);
                    log::info!("plan follower for gpu {gpu_id} pinned on cpu {core}");
                }
                executor.run_event_loop();
            })
            .expect("spawn plan follower thread");
        *self.thread.lock() = Some(handle);
    }

    /// Stops the event loop and joins the executor thread.
    pub fn stop(&self) {
        self.executor.stop_event_loop();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Registers a replica at its own model index. The slot must be empty.
    pub fn add_model(&self, model: Arc<dyn ModelExecutor>) {
        let mut models = self.inner.models.lock();
        let index = model.model_index().0 as usize;
        if models.len() <= index {
            models.resize_with(index + 1, || None);
        }
        assert!(
            models[index].is_none(),
            "model slot {index} is already occupied"
        );
        models[index] = Some(model);
    }

    /// Clears a replica's slot. The slot must currently hold it.
    pub fn remove_model(&self, model: &Arc<dyn ModelExecutor>) {
        let mut models = self.inner.models.lock();
        let index = model.model_index().0 as usize;
        assert!(models.len() > index, "model slot {index} was never filled");
        assert!(models[index].is_some(), "model slot {index} is empty");
        models[index] = None;
    }

    /// Queues a plan for execution at its exec time. Plans already in the
    /// past fire on the next loop iteration.
    pub fn add_batch_plan(&self, plan: Arc<BatchPlan>) {
        {
            let mut plans = self.inner.plans.lock();
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            plans.push(PlanEntry { plan, seq });
        }
        FollowerInner::update_timer(&self.inner);
    }

    pub fn telemetry(&self) -> FollowerTelemetry {
        FollowerTelemetry {
            executed_plans: self.inner.executed_plans.load(Ordering::Relaxed),
            dropped_plans: self.inner.dropped_plans.load(Ordering::Relaxed),
            last_start_delay_us: self.inner.last_start_delay_us.load(Ordering::Relaxed),
            last_finish_delay_us: self.inner.last_finish_delay_us.load(Ordering::Relaxed),
        }
    }

    /// Whether a batch is currently executing on the replica.
    pub fn is_executing(&self) -> bool {
        self.inner.is_executing.load(Ordering::Acquire)
    }
}

impl Drop for PlanFollower {
    fn drop(&mut self) {
        self.inner.timer.cancel();
    }
}

impl FollowerInner {
    fn update_timer(inner: &Arc<FollowerInner>) {
        let head = inner.plans.lock().peek().map(|e| e.plan.exec_time_ns());
        let Some(deadline) = head else {
            return;
        };
        if inner.timer.timeout_ns() == Some(deadline) {
            return;
        }
        // Register the wait before arming so a fire always finds a callback.
        let handle = Arc::clone(inner);
        inner
            .timer
            .async_wait(move |status| FollowerInner::on_timer(&handle, status));
        inner.timer.set_timeout(deadline);
    }

    fn on_timer(inner: &Arc<FollowerInner>, status: TimerStatus) {
        if status != TimerStatus::Ok {
            return;
        }
        let start_ns = wall_clock_ns();

        let plan = {
            let mut plans = inner.plans.lock();
            let Some(entry) = plans.pop() else {
                log::error!("plan timer fired with no pending batch plan");
                return;
            };
            // An add racing the fire can re-arm the timer ahead of the
            // head plan; a plan never executes before its exec time.
            if entry.plan.exec_time_ns() > start_ns {
                plans.push(entry);
                None
            } else {
                Some(entry.plan)
            }
        };
        let Some(plan) = plan else {
            Self::update_timer(inner);
            return;
        };

        let model = {
            let models = inner.models.lock();
            models
                .get(plan.model_index().0 as usize)
                .cloned()
                .flatten()
        };
        let Some(model) = model else {
            log::error!(
                "no model registered at index {} on gpu {}; dropping plan {}",
                plan.model_index(),
                inner.gpu_id,
                plan.plan_id()
            );
            inner.dropped_plans.fetch_add(1, Ordering::Relaxed);
            Self::update_timer(inner);
            return;
        };

        let start_delay_us = (start_ns - plan.exec_time_ns()) / 1_000;
        if start_delay_us > DELAY_WARN_THRESHOLD_US {
            log::warn!(
                "huge start delay: session={}, plan_id={}, start_delay={start_delay_us}us",
                model.session_id(),
                plan.plan_id()
            );
        }
        log::debug!(
            "executing batch plan: plan_id={}, session={}, batch_size={}, start_delay={start_delay_us}us",
            plan.plan_id(),
            model.session_id(),
            plan.batch_size()
        );

        let was_executing = inner.is_executing.swap(true, Ordering::AcqRel);
        assert!(
            !was_executing,
            "batch plan fired while the previous batch was still executing"
        );
        model.execute_batch_plan(&plan);

        let finish_ns = wall_clock_ns();
        let elapse_us = (finish_ns - start_ns) / 1_000;
        let finish_delay_us = (finish_ns - plan.expected_finish_time_ns()) / 1_000;
        inner.executed_plans.fetch_add(1, Ordering::Relaxed);
        inner
            .last_start_delay_us
            .store(start_delay_us, Ordering::Relaxed);
        inner
            .last_finish_delay_us
            .store(finish_delay_us, Ordering::Relaxed);
        log::debug!(
            "batch plan finished: plan_id={}, session={}, batch_size={}, start_delay={start_delay_us}us, elapse={elapse_us}us, finish_delay={finish_delay_us}us",
            plan.plan_id(),
            model.session_id(),
            plan.batch_size()
        );
        if finish_delay_us > DELAY_WARN_THRESHOLD_US {
            log::warn!(
                "huge finish delay: session={}, plan_id={}, start_delay={start_delay_us}us, finish_delay={finish_delay_us}us",
                model.session_id(),
                plan.plan_id()
            );
        }

        Self::update_timer(inner);
        inner.is_executing.store(false, Ordering::Release);
    }
}
