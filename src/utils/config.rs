use std::time::Duration;

use clap::{Parser, ValueEnum};

/// What happens when the workload notification buffer is full.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Wait for room; workload event processing stalls until the queue
    /// aggregator catches up.
    Block,
    /// Drop the notification and log it.
    Drop,
}

/// Controller configuration, from flags or the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "workload-queue-controller", version, about, long_about = None)]
pub struct ControllerConfig {
    /// Namespace to watch Workloads and Queues in; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Delay between a workload change and the recompute of its queue status
    #[arg(long, env = "UPDATES_BATCH_PERIOD_MS", default_value_t = 1000)]
    pub updates_batch_period_ms: u64,

    /// Capacity of the workload notification channel
    #[arg(long, env = "NOTIFICATION_BUFFER", default_value_t = 1024)]
    pub notification_buffer: usize,

    #[arg(
        long,
        env = "NOTIFICATION_OVERFLOW",
        value_enum,
        default_value_t = OverflowPolicy::Block
    )]
    pub notification_overflow: OverflowPolicy,

    /// First retry delay after a failed reconcile
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 5)]
    pub retry_base_delay_ms: u64,

    /// Retry delay ceiling
    #[arg(long, env = "RETRY_MAX_DELAY_SECS", default_value_t = 1000)]
    pub retry_max_delay_secs: u64,
}

impl ControllerConfig {
    pub fn updates_batch_period(&self) -> Duration {
        Duration::from_millis(self.updates_batch_period_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            namespace: None,
            updates_batch_period_ms: 1000,
            notification_buffer: 1024,
            notification_overflow: OverflowPolicy::Block,
            retry_base_delay_ms: 5,
            retry_max_delay_secs: 1000,
        }
    }
}
