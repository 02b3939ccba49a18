pub mod approval;
pub mod builtin;
pub mod external_job;
pub mod invoke;

pub use approval::ApprovalStep;
pub use builtin::{DelayStep, MergeStep, SourceStep, TransformStep};
pub use external_job::{ExternalJobStep, HttpJobClient};
pub use invoke::{AgentCallStep, ToolCallStep};
