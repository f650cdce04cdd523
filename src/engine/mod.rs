//! The processing engine: the worker loop and what it keeps track of.

pub mod backoff;
pub mod processor;
pub mod stats;

pub use backoff::PollBackoff;
pub use processor::{
    DeploymentState, ExitReason, LandingSignal, ProcessorConfig, QueueProcessor, Transition,
    WorkItemProcessor,
};
pub use stats::QueueProcessorStats;
