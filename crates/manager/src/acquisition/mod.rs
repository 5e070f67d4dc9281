//! Certificate acquisition
//!
//! - [`AcquisitionPipeline`] - one attempt: cache check, staging pre-control,
//!   production issue or renew
//! - [`AcquisitionQueue`] / [`AcquisitionWorker`] - serialized task
//!   processing with timeout and linear backoff ([`RetryPolicy`])

mod pipeline;
mod queue;
mod retry;

pub use pipeline::{AcquisitionPipeline, PipelineSettings};
pub use queue::{AcquisitionQueue, AcquisitionWorker, Task};
pub use retry::RetryPolicy;
