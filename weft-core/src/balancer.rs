//! Least-loaded manager selection.

/// Picks the manager with the fewest connections.
///
/// Ties are broken round-robin: the scan starts just past the previous
/// choice, and the first manager with the minimal load wins.
///
/// ```
/// use weft_core::balancer::LeastLoaded;
///
/// let mut balancer = LeastLoaded::new();
/// assert_eq!(balancer.select(&[0, 0, 0]), Some(0));
/// assert_eq!(balancer.select(&[1, 0, 0]), Some(1));
/// assert_eq!(balancer.select(&[1, 1, 0]), Some(2));
/// assert_eq!(balancer.select(&[1, 0, 1]), Some(1));
/// ```
#[derive(Debug, Default, Clone)]
pub struct LeastLoaded {
    cursor: usize,
}

impl LeastLoaded {
    #[must_use]
    pub const fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Index of the manager to receive the next connection, or `None` when
    /// there are no managers.
    pub fn select(&mut self, loads: &[usize]) -> Option<usize> {
        let count = loads.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor % count;
        let chosen = (0..count)
            .map(|offset| (start + offset) % count)
            .min_by_key(|&index| loads[index])?;
        self.cursor = (chosen + 1) % count;
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn empty_set_has_no_choice() {
        assert_eq!(LeastLoaded::new().select(&[]), None);
    }

    #[test]
    fn equal_loads_rotate() {
        let mut balancer = LeastLoaded::new();
        let mut loads = [0usize; 3];
        for expected in [0, 1, 2, 0, 1, 2] {
            let chosen = balancer.select(&loads).unwrap();
            assert_eq!(chosen, expected);
            loads[chosen] += 1;
        }
    }

    #[test]
    fn choice_is_always_minimal_under_churn() {
        let mut rng = rand::thread_rng();
        let mut balancer = LeastLoaded::new();
        let mut loads = vec![0usize; 5];

        for _ in 0..2000 {
            if rng.gen_bool(0.3) {
                let victim = rng.gen_range(0..loads.len());
                loads[victim] = loads[victim].saturating_sub(1);
                continue;
            }
            let min = *loads.iter().min().unwrap();
            let chosen = balancer.select(&loads).unwrap();
            assert_eq!(loads[chosen], min);
            loads[chosen] += 1;
        }
    }

    #[test]
    fn loads_stay_balanced_without_removals() {
        let mut balancer = LeastLoaded::new();
        let mut loads = vec![0usize; 4];
        for _ in 0..103 {
            let chosen = balancer.select(&loads).unwrap();
            loads[chosen] += 1;
        }
        let max = loads.iter().max().unwrap();
        let min = loads.iter().min().unwrap();
        assert!(max - min <= 1);
    }
}
