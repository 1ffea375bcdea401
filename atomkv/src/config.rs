//! Tunables for change feeds and registries

/// Configuration of a change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    /// How many undelivered changes a subscriber may fall behind before
    /// its stream reports a gap
    pub capacity: usize,
}

impl FeedConfig {
    pub const DEFAULT_CAPACITY: usize = 256;

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}

/// Configuration of an atom registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Re-read every cached key after the change stream reported a gap
    pub resync_on_lag: bool,
}

impl RegistryConfig {
    #[must_use]
    pub fn with_resync_on_lag(mut self, resync_on_lag: bool) -> Self {
        self.resync_on_lag = resync_on_lag;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resync_on_lag: true,
        }
    }
}
