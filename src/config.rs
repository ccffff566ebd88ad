/// Order bounds for a [`crate::BuddyPool`].
///
/// `MIN_K`/`MAX_K`/`DEFAULT_K` are compile-time constants sized for the
/// pool's fixed sentinel array; this struct is a thin runtime layer on top
/// so an embedder can request a smaller pool (e.g. in tests, or on a
/// memory-constrained target) without recompiling the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyPoolConfig {
    /// Smallest order the pool will ever split a block down to.
    pub min_k: usize,
    /// Exclusive upper bound on order; must not exceed [`crate::MAX_K`],
    /// the capacity of the pool's sentinel array.
    pub max_k: usize,
    /// Order used when a pool is created with a requested size of zero.
    pub default_k: usize,
}

impl Default for BuddyPoolConfig {
    fn default() -> Self {
        BuddyPoolConfig {
            min_k: crate::MIN_K,
            max_k: crate::MAX_K,
            default_k: crate::DEFAULT_K,
        }
    }
}

impl BuddyPoolConfig {
    /// Clamp this config's bounds to what the pool's fixed-size sentinel
    /// array can actually hold, logging if a caller-supplied `max_k` had to
    /// be lowered.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_k > crate::MAX_K {
            log::warn!(
                "requested max_k {} exceeds sentinel array capacity {}, clamping",
                self.max_k,
                crate::MAX_K
            );
            self.max_k = crate::MAX_K;
        }
        if self.min_k > self.max_k {
            self.min_k = self.max_k;
        }
        self
    }
}
