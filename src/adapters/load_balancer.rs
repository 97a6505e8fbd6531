use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::config::models::LoadBalanceStrategy;

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a slot in `0..len`
    fn select(&self, len: u64) -> Option<u64>;

    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicU64,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, len: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(count % len)
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select(&self, len: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        Some(rand::rng().random_range(0..len))
    }
}

pub fn create_strategy(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
    match strategy {
        LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
        LoadBalanceStrategy::Random => RandomStrategy.boxed(),
    }
}

/// Weighted candidate pool.
///
/// Items own consecutive slot ranges sized by their weight (weight defaults to 1, weight 0
/// removes the item). The strategy picks a slot among the total weight and a binary search
/// over the running sums maps it back to an item, so both strategies honour weights
/// without knowing about them.
pub struct WeightedPool<T> {
    items: Vec<T>,
    /// `cumulative[i]` is the summed weight of items `0..=i`
    cumulative: Vec<u64>,
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl<T> WeightedPool<T> {
    pub fn new(
        weighted: impl IntoIterator<Item = (T, Option<u32>)>,
        strategy: LoadBalanceStrategy,
    ) -> Self {
        let mut items = Vec::new();
        let mut cumulative = Vec::new();
        let mut total = 0u64;
        for (item, weight) in weighted {
            total = total.saturating_add(u64::from(weight.unwrap_or(1)));
            items.push(item);
            cumulative.push(total);
        }
        Self {
            items,
            cumulative,
            strategy: create_strategy(strategy),
        }
    }

    fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn pick(&self) -> Option<&T> {
        let slot = self.strategy.select(self.total_weight())?;
        let index = self.cumulative.partition_point(|&sum| sum <= slot);
        self.items.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.total_weight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_strategy() {
        let strategy = RoundRobinStrategy::new();
        assert_eq!(strategy.select(3), Some(0));
        assert_eq!(strategy.select(3), Some(1));
        assert_eq!(strategy.select(3), Some(2));
        assert_eq!(strategy.select(3), Some(0)); // Wraps around
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(RoundRobinStrategy::new().select(0), None);
        assert_eq!(RandomStrategy.select(0), None);
    }

    #[test]
    fn test_random_strategy_in_range() {
        for _ in 0..32 {
            let selected = RandomStrategy.select(3).unwrap();
            assert!(selected < 3);
        }
    }

    #[test]
    fn test_weighted_round_robin() {
        let pool = WeightedPool::new(
            [("a", Some(2)), ("b", None), ("c", Some(0))],
            LoadBalanceStrategy::RoundRobin,
        );
        let picks: Vec<_> = (0..6).map(|_| *pool.pick().unwrap()).collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "a", "b"]);
    }

    #[test]
    fn test_all_zero_weights_is_empty() {
        let pool = WeightedPool::new([("a", Some(0))], LoadBalanceStrategy::Random);
        assert!(pool.is_empty());
        assert!(pool.pick().is_none());
    }

    #[test]
    fn test_huge_weights_do_not_expand() {
        let pool = WeightedPool::new(
            [("a", Some(u32::MAX)), ("b", Some(u32::MAX)), ("c", Some(1))],
            LoadBalanceStrategy::RoundRobin,
        );
        assert_eq!(pool.cumulative.len(), 3);
        assert_eq!(pool.total_weight(), 2 * u64::from(u32::MAX) + 1);
        assert!(!pool.is_empty());

        // The first u32::MAX round-robin slots all belong to "a"
        let picks: Vec<_> = (0..4).map(|_| *pool.pick().unwrap()).collect();
        assert_eq!(picks, vec!["a"; 4]);
    }

    #[test]
    fn test_huge_weight_dominates_random_selection() {
        let pool = WeightedPool::new(
            [("light", Some(1)), ("heavy", Some(u32::MAX))],
            LoadBalanceStrategy::Random,
        );
        let heavy = (0..64).filter(|_| *pool.pick().unwrap() == "heavy").count();
        assert!(heavy >= 63);
    }
}
