pub mod events;
pub mod ids;
pub mod message;
pub mod record;

pub use events::QueueEvent;
pub use ids::LeaseToken;
pub use message::{JobData, QueueMessage};
pub use record::{ClaimedJob, QueueCounts, QueueRecord, QueueStatus, ReclaimOutcome};
