pub mod metrics;

pub use metrics::{LiveMetrics, QueueMetrics};
