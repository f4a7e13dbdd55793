pub mod cluster_queue;
pub mod key;
pub mod lifecycle;
pub mod queue;
pub mod workload;
