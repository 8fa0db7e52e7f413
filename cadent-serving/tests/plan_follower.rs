//! Timing behavior of the plan follower: plans fire at or after their
//! scheduled instant, in execution-time order, strictly one at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cadent_serving::{
    BatchPlan, ModelExecutor, ModelIndex, PlanFollower, QueryWithoutInput,
};
use cadent_transport::wall_clock_ns;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct RecordingModel {
    model_index: ModelIndex,
    session_id: String,
    // (plan id, wall-clock fire time)
    calls: Mutex<Vec<(u64, i64)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingModel {
    fn new(model_index: ModelIndex) -> Arc<Self> {
        Arc::new(Self {
            model_index,
            session_id: format!("test:recorder:{}:0", model_index.0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn wait_for_calls(&self, count: usize) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while Instant::now() < deadline {
            if self.calls.lock().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

impl ModelExecutor for RecordingModel {
    fn model_index(&self) -> ModelIndex {
        self.model_index
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn execute_batch_plan(&self, plan: &BatchPlan) {
        let depth = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(depth, Ordering::SeqCst);
        self.calls.lock().push((plan.plan_id(), wall_clock_ns()));
        std::thread::sleep(Duration::from_micros(200));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn plan(plan_id: u64, model_index: ModelIndex, exec_time_ns: i64) -> Arc<BatchPlan> {
    Arc::new(
        BatchPlan::new(
            plan_id,
            model_index,
            exec_time_ns,
            exec_time_ns + 1_000_000,
            vec![QueryWithoutInput {
                query_id: plan_id * 10,
                ..Default::default()
            }],
        )
        .expect("valid plan"),
    )
}

#[test]
fn single_plan_fires_once_at_its_deadline() {
    let follower = PlanFollower::new(0);
    follower.start(None);
    let model = RecordingModel::new(ModelIndex(0));
    follower.add_model(model.clone());

    let exec_time = wall_clock_ns() + 5_000_000;
    follower.add_batch_plan(plan(1, ModelIndex(0), exec_time));

    assert!(model.wait_for_calls(1));
    std::thread::sleep(Duration::from_millis(10));
    {
        let calls = model.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 1);
        // Never early; lateness is scheduler noise, bounded loosely here.
        assert!(calls[0].1 >= exec_time);
        assert!(calls[0].1 - exec_time < 100_000_000);
    }

    let telemetry = follower.telemetry();
    assert_eq!(telemetry.executed_plans, 1);
    assert!(telemetry.last_start_delay_us >= 0);
    assert!(!follower.is_executing());
    follower.stop();
}

#[test]
fn plans_fire_in_exec_time_order() {
    let follower = PlanFollower::new(0);
    follower.start(None);
    let model = RecordingModel::new(ModelIndex(1));
    follower.add_model(model.clone());

    let now = wall_clock_ns();
    follower.add_batch_plan(plan(30, ModelIndex(1), now + 60_000_000));
    follower.add_batch_plan(plan(10, ModelIndex(1), now + 20_000_000));
    follower.add_batch_plan(plan(20, ModelIndex(1), now + 40_000_000));

    assert!(model.wait_for_calls(3));
    let order: Vec<u64> = model.calls.lock().iter().map(|&(id, _)| id).collect();
    assert_eq!(order, vec![10, 20, 30]);
    assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 1);
    follower.stop();
}

#[test]
fn past_deadline_plan_fires_immediately() {
    let follower = PlanFollower::new(0);
    follower.start(None);
    let model = RecordingModel::new(ModelIndex(0));
    follower.add_model(model.clone());

    let started = Instant::now();
    follower.add_batch_plan(plan(5, ModelIndex(0), wall_clock_ns() - 1_000_000));
    assert!(model.wait_for_calls(1));
    assert!(started.elapsed() < Duration::from_secs(1));
    follower.stop();
}

#[test]
fn plans_with_identical_exec_times_all_fire() {
    let follower = PlanFollower::new(0);
    follower.start(None);
    let model = RecordingModel::new(ModelIndex(0));
    follower.add_model(model.clone());

    let exec_time = wall_clock_ns() + 10_000_000;
    follower.add_batch_plan(plan(1, ModelIndex(0), exec_time));
    follower.add_batch_plan(plan(2, ModelIndex(0), exec_time));

    assert!(model.wait_for_calls(2));
    let order: Vec<u64> = model.calls.lock().iter().map(|&(id, _)| id).collect();
    assert_eq!(order, vec![1, 2]);
    follower.stop();
}

#[test]
fn an_earlier_plan_replaces_the_pending_head() {
    let follower = PlanFollower::new(0);
    follower.start(None);
    let model = RecordingModel::new(ModelIndex(0));
    follower.add_model(model.clone());

    let now = wall_clock_ns();
    follower.add_batch_plan(plan(2, ModelIndex(0), now + 60_000_000));
    follower.add_batch_plan(plan(1, ModelIndex(0), now + 5_000_000));

    assert!(model.wait_for_calls(1));
    assert_eq!(model.calls.lock()[0].0, 1);
    assert!(model.wait_for_calls(2));
    follower.stop();
}

#[test]
fn missing_model_drops_the_plan_and_rearms() {
    let follower = PlanFollower::new(0);
    follower.start(None);
    let model = RecordingModel::new(ModelIndex(0));
    follower.add_model(model.clone());

    let now = wall_clock_ns();
    // No model lives at index 7; that plan is dropped with telemetry, and
    // the later plan for the registered model still fires.
    follower.add_batch_plan(plan(70, ModelIndex(7), now + 2_000_000));
    follower.add_batch_plan(plan(1, ModelIndex(0), now + 8_000_000));

    assert!(model.wait_for_calls(1));
    assert_eq!(model.calls.lock()[0].0, 1);
    std::thread::sleep(Duration::from_millis(20));
    let telemetry = follower.telemetry();
    assert_eq!(telemetry.dropped_plans, 1);
    assert_eq!(telemetry.executed_plans, 1);
    follower.stop();
}

#[test]
fn removed_model_slot_can_be_reused() {
    let follower = PlanFollower::new(0);
    let first = RecordingModel::new(ModelIndex(3));
    follower.add_model(first.clone());
    follower.remove_model(&(first as Arc<dyn ModelExecutor>));

    let second = RecordingModel::new(ModelIndex(3));
    follower.add_model(second);
}
