//! Keeps a pending-workload ledger and an admission cache in sync with
//! Workload, Queue and ClusterQueue watches, and reflects what they know back
//! into Workload conditions and Queue status.

pub mod controllers;
pub mod indices;
pub mod models;
pub mod runtime;
pub mod utils;
