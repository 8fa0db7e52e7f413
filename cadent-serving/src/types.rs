//! Core data model of the serving fabric.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ServingError};

/// Dense non-negative index naming a logical model replica within a
/// process; keys the model table and the entrance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelIndex(pub u32);

impl fmt::Display for ModelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique 64-bit query identity assigned at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(pub u64);

/// Issues monotonic global ids. Passed in explicitly wherever queries are
/// stamped so tests can observe the sequence.
#[derive(Debug)]
pub struct GlobalIdIssuer {
    next: AtomicU64,
}

impl GlobalIdIssuer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> GlobalId {
        GlobalId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for GlobalIdIssuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable description of one model session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSession {
    pub framework: String,
    pub model_name: String,
    pub version: u32,
    pub latency_sla_us: u64,
    pub image_height: Option<u32>,
    pub image_width: Option<u32>,
}

impl ModelSession {
    /// Canonical string form, used as a map key and in log lines.
    pub fn session_id(&self) -> String {
        let mut id = format!(
            "{}:{}:{}:{}",
            self.framework, self.model_name, self.version, self.latency_sla_us
        );
        if let (Some(height), Some(width)) = (self.image_height, self.image_width) {
            id.push_str(&format!(":{height}x{width}"));
        }
        id
    }

    /// Profile key: like the session id but independent of the SLA.
    pub fn profile_id(&self) -> String {
        let mut id = format!("{}:{}:{}", self.framework, self.model_name, self.version);
        if let (Some(height), Some(width)) = (self.image_height, self.image_width) {
            id.push_str(&format!(":{height}x{width}"));
        }
        id
    }
}

/// Punch clock carried by a query. Nanoseconds since the unix epoch; zero
/// means the stage has not been stamped yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryClock {
    pub frontend_send_ns: i64,
    pub dispatcher_recv_ns: i64,
    pub dispatcher_sched_ns: i64,
}

/// A query stripped of its input payload; the input travels separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryWithoutInput {
    pub query_id: u64,
    /// Zero until assigned at dispatch.
    pub global_id: u64,
    pub clock: QueryClock,
}

/// One query arriving at the dispatcher from a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRequest {
    pub model_index: ModelIndex,
    pub query: QueryWithoutInput,
}

/// Dispatch outcome surfaced to frontends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchStatus {
    Ok = 0,
    ModelOverloaded = 1,
    ModelNotFound = 2,
    InvalidQuery = 3,
}

impl DispatchStatus {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::ModelOverloaded),
            2 => Some(Self::ModelNotFound),
            3 => Some(Self::InvalidQuery),
            _ => None,
        }
    }
}

/// Query identity plus its clock, echoed in failure replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStamp {
    pub query_id: u64,
    pub clock: QueryClock,
}

/// Sent to the originating frontend only when a dispatch fails; the
/// success path answers through the eventual inference result instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReply {
    pub status: DispatchStatus,
    pub model_index: ModelIndex,
    pub query_list: Vec<QueryStamp>,
}

/// Static configuration of one model replica on a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInstanceConfig {
    pub gpu_id: i32,
    pub model_session: ModelSession,
    pub batch: u32,
    pub max_batch: u32,
}

impl ModelInstanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch == 0 {
            return Err(ServingError::InvalidConfig("batch must be greater than 0"));
        }
        if self.max_batch < self.batch {
            return Err(ServingError::InvalidConfig(
                "max_batch must be at least batch",
            ));
        }
        Ok(())
    }
}
