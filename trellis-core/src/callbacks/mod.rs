//! Built-in callbacks.

pub mod call_recipe;
pub mod checkpoint;
pub mod counter;
pub mod log;
pub mod logger;
pub mod metrics;

pub use call_recipe::{CallRecipe, InitFn, SYNCED_KEYS, sync_counters};
pub use checkpoint::{Checkpoint, CheckpointTrigger};
pub use counter::Counter;
pub use log::Log;
pub use logger::{MemorySink, MetricLogger, MetricSink, Report, TracingSink};
pub use metrics::{AccAvg, EpochMetricAvg, RunningAvg, WindowAvg, WindowedMetricAvg};
