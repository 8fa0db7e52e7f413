mod control;
mod cpu;
mod error;
mod follower;
mod model;
mod plan;
mod types;
mod worker;

pub use control::ControlMessage;
pub use error::{Result, ServingError};
pub use follower::{FollowerTelemetry, PlanFollower};
pub use model::{ModelExecutor, SleepModel, SleepProfile};
pub use plan::BatchPlan;
pub use types::{
    DispatchReply, DispatchRequest, DispatchStatus, GlobalId, GlobalIdIssuer, ModelIndex,
    ModelInstanceConfig, ModelSession, QueryClock, QueryStamp, QueryWithoutInput,
};
pub use worker::{ModelWorker, ModelWorkerConfig, QueryDispatcher, QueryEntrance};
