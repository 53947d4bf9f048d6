//! Application-side instrumentation: per-CPU status, the per-process
//! record log, the cross-process sampler, and region/epoch accumulation
//! (`spec.md` §4.6–4.8, components C6–C8).

pub mod aggregator;
pub mod record_log;
pub mod sampler;
pub mod status;

pub use aggregator::SampleAggregator;
pub use record_log::{EventKind, Record, RecordLog};
pub use sampler::{ApplicationSampler, RecordFilter};
pub use status::{ApplicationStatus, Hint};
