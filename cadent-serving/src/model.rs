//! The model-executor seam, plus a sleep-based stand-in replica used by
//! load tests and scheduler tests.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::plan::BatchPlan;
use crate::types::{ModelIndex, ModelInstanceConfig};

/// One live model replica on a backend.
pub trait ModelExecutor: Send + Sync {
    fn model_index(&self) -> ModelIndex;
    fn session_id(&self) -> &str;
    /// Runs the batch to completion on the replica's device. Must not
    /// panic; an unrecoverable device failure terminates the process.
    fn execute_batch_plan(&self, plan: &BatchPlan);
}

/// Latency profile of a stand-in model: a fixed setup cost plus a
/// per-query cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepProfile {
    pub base_us: u64,
    pub per_query_us: u64,
}

impl SleepProfile {
    pub fn batch_latency_us(&self, batch_size: usize) -> u64 {
        self.base_us + self.per_query_us * batch_size as u64
    }
}

/// A replica that burns its latency profile instead of running a framework
/// forward pass.
pub struct SleepModel {
    model_index: ModelIndex,
    session_id: String,
    profile: SleepProfile,
}

impl SleepModel {
    pub fn new(
        model_index: ModelIndex,
        config: &ModelInstanceConfig,
        profile: SleepProfile,
    ) -> Result<Self> {
        config.validate()?;
        let session_id = config.model_session.session_id();
        log::info!(
            "constructed model {session_id}, batch {}, max batch {}",
            config.batch,
            config.max_batch
        );
        Ok(Self {
            model_index,
            session_id,
            profile,
        })
    }
}

impl ModelExecutor for SleepModel {
    fn model_index(&self) -> ModelIndex {
        self.model_index
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn execute_batch_plan(&self, plan: &BatchPlan) {
        let latency_us = self.profile.batch_latency_us(plan.batch_size());
        thread::sleep(Duration::from_micros(latency_us));
    }
}
