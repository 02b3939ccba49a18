pub mod approval;
pub mod breaker;
pub mod condition;
pub mod context;
pub mod engine;
pub mod graph;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod steps;
pub mod stream;

pub use approval::ApprovalBroker;
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreakerRegistry};
pub use condition::evaluate_condition;
pub use context::ExecutionContext;
pub use engine::{ApprovalResolution, EngineBuilder, WorkflowEngine};
pub use registry::StepRegistry;
pub use retry::{ErrorHandler, ErrorRecord, ErrorScope, ErrorStatistics, Severity};
pub use scheduler::{ExecutionHandle, Scheduler};
pub use steps::HttpJobClient;
pub use stream::StreamManager;
