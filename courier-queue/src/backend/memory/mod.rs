mod reaper;
mod storage;

pub use reaper::{LeaseReaper, DEFAULT_REAPER_INTERVAL};
pub use storage::MemoryQueueBackend;
