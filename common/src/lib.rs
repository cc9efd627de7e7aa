pub mod config;
pub mod error;
pub mod failover;
pub mod job;
pub mod node;
pub mod results;
pub mod session;
pub mod task;
pub mod worker;

pub use config::FailoverConfig;
pub use error::{ConfigError, FailoverError, GridError, SessionError};
pub use failover::{FailoverContext, FailoverCoordinator, FailoverDecision, FailoverKind, FailoverStats};
pub use job::{Job, JobContext, JobId};
pub use node::{LoadBalancer, Node, NodeId, TopologyView};
pub use results::JobResult;
pub use session::{timeout_millis, SessionRegistry, TaskSession};
pub use task::{JobSpec, Reducer, ResultPolicy, TaskId, TaskInfo, TaskRequest, TaskStatus};
pub use worker::*;
