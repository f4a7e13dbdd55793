pub mod admission;
pub mod pending;

pub use admission::{AdmissionCache, ClusterQueueCache};
pub use pending::{PendingLedger, QueueManager};
