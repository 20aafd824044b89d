//! Binary sum tree over slot priorities.

/// Complete binary tree whose leaves hold per-slot priorities and whose
/// internal nodes hold the sum of their children.
#[derive(Debug, Clone)]
pub struct SumTree {
    capacity: usize,
    leaves: usize,
    nodes: Vec<f64>,
}

impl SumTree {
    pub fn new(capacity: usize) -> Self {
        let leaves = capacity.max(1).next_power_of_two();
        Self {
            capacity,
            leaves,
            nodes: vec![0.0; 2 * leaves],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total(&self) -> f64 {
        self.nodes[1]
    }

    pub fn get(&self, slot: usize) -> f64 {
        self.nodes[self.leaves + slot]
    }

    pub fn set(&mut self, slot: usize, priority: f64) {
        debug_assert!(slot < self.capacity);
        let mut node = self.leaves + slot;
        self.nodes[node] = priority;
        while node > 1 {
            node /= 2;
            self.nodes[node] = self.nodes[2 * node] + self.nodes[2 * node + 1];
        }
    }

    /// Slot whose cumulative priority range contains `mass`.
    ///
    /// `mass` is clamped into `[0, total)`; zero-priority slots are never
    /// returned while any slot has positive priority.
    pub fn find(&self, mass: f64) -> usize {
        let mut mass = mass.clamp(0.0, self.total());
        let mut node = 1;
        while node < self.leaves {
            let left = 2 * node;
            if mass < self.nodes[left] || self.nodes[left + 1] <= 0.0 {
                node = left;
            } else {
                mass -= self.nodes[left];
                node = left + 1;
            }
        }
        (node - self.leaves).min(self.capacity.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_and_lookup() {
        let mut tree = SumTree::new(5);
        for (slot, p) in [1.0, 2.0, 3.0, 4.0, 0.0].iter().enumerate() {
            tree.set(slot, *p);
        }
        assert_eq!(tree.total(), 10.0);
        assert_eq!(tree.find(0.5), 0);
        assert_eq!(tree.find(1.0), 1);
        assert_eq!(tree.find(2.9), 1);
        assert_eq!(tree.find(5.5), 2);
        assert_eq!(tree.find(9.99), 3);
        // Clamped to the last positive slot, never the empty one.
        assert_eq!(tree.find(10.0), 3);

        tree.set(3, 0.0);
        assert_eq!(tree.total(), 6.0);
        assert_eq!(tree.get(2), 3.0);
    }
}
