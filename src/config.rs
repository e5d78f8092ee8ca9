//! Engine-wide tuning knobs, shared by every job the engine launches.

use std::path::PathBuf;
use std::time::Duration;

use crate::exchange::flow::LinkConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tuples per payload message.
    pub batch_size: usize,
    /// Initial unacked-message allowance per link; receivers may shrink it.
    pub flow_window: usize,
    pub ack_timeout: Duration,
    pub retry_limit: u32,
    /// Worker count for operators that do not pin their own.
    pub default_parallelism: usize,
    /// Where materialize operators write their partition files.
    pub spill_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_size: 64,
            flow_window: 20,
            ack_timeout: Duration::from_millis(500),
            retry_limit: 5,
            default_parallelism: 2,
            spill_dir: std::env::temp_dir().join("grainflow"),
        }
    }
}

impl EngineConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flow_window(mut self, flow_window: usize) -> Self {
        self.flow_window = flow_window.max(1);
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_parallelism(mut self, default_parallelism: usize) -> Self {
        self.default_parallelism = default_parallelism.max(1);
        self
    }

    pub fn with_spill_dir(mut self, spill_dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = spill_dir.into();
        self
    }

    pub fn link(&self) -> LinkConfig {
        LinkConfig {
            initial_window: self.flow_window,
            ack_timeout: self.ack_timeout,
            retry_limit: self.retry_limit,
        }
    }
}
