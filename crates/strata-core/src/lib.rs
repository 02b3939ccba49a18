pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod tenant;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{ErrorKind, Result, StrataError};
pub use event::EventBus;
pub use types::*;
pub use workflow::{MergeMode, StepConfig, StepKind, WorkflowDefinition};
