//! Weighted-random selection backed by a binary-indexed tree so picking and
//! re-weighting are both O(log n) regardless of pool size.

use std::collections::HashMap;

use rand::Rng;

use crate::collections::bit::BinaryIndexedTree;

use super::algorithm::{Algorithm, AddrId};

pub struct WeightedRandom {
    bit: BinaryIndexedTree,
    /// Dense position -> address id, kept in lockstep with the tree.
    positions: Vec<AddrId>,
    /// address id -> (position, weight), for O(1) removal lookups.
    index: HashMap<AddrId, (usize, u64)>,
}

impl WeightedRandom {
    pub fn new() -> Self {
        Self {
            bit: BinaryIndexedTree::new(),
            positions: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for WeightedRandom {
    fn add(&mut self, id: AddrId, weight: u64) {
        let pos = self.bit.add_element(weight);
        self.positions.push(id);
        self.index.insert(id, (pos, weight));
    }

    fn remove(&mut self, id: AddrId) {
        let Some((pos, _)) = self.index.remove(&id) else { return };
        let last_pos = self.positions.len();
        if pos != last_pos {
            // Swap this id's weight with whatever sits at the last BIT
            // position, so the tree can shrink from the tail.
            let last_id = self.positions[last_pos - 1];
            let last_weight = self.index.get(&last_id).map(|(_, w)| *w).unwrap_or(0);
            let this_weight = self.bit.prefix_sum(pos) - self.bit.prefix_sum(pos - 1);
            self.bit.increase(pos, last_weight.wrapping_sub(this_weight));
            self.bit.decrease(last_pos, last_weight);
            self.positions[pos - 1] = last_id;
            self.index.insert(last_id, (pos, last_weight));
        }
        self.positions.pop();
        self.bit.remove_last_element();
    }

    fn pick(&mut self, exclude: Option<AddrId>) -> Option<AddrId> {
        let total = self.bit.total();
        if total == 0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        let mut candidate = self.sample(&mut rng, total)?;
        if let Some(ex) = exclude {
            if candidate == ex && self.positions.len() > 1 {
                for _ in 0..8 {
                    candidate = self.sample(&mut rng, total)?;
                    if candidate != ex {
                        break;
                    }
                }
            }
        }
        Some(candidate)
    }

    fn on_finish(&mut self, _id: AddrId) {}
}

impl WeightedRandom {
    fn sample(&self, rng: &mut impl Rng, total: u64) -> Option<AddrId> {
        let x = rng.gen_range(1..=total);
        let pos = self.bit.find_pos(x)?;
        self.positions.get(pos - 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_pick_only_returns_registered_ids() {
        let mut algo = WeightedRandom::new();
        algo.add(1, 5);
        algo.add(2, 5);
        algo.add(3, 5);
        for _ in 0..50 {
            let picked = algo.pick(None).unwrap();
            assert!([1, 2, 3].contains(&picked));
        }
    }

    #[test]
    fn remove_drops_address_from_distribution() {
        let mut algo = WeightedRandom::new();
        algo.add(1, 5);
        algo.add(2, 5);
        algo.remove(1);
        for _ in 0..20 {
            assert_eq!(algo.pick(None), Some(2));
        }
    }

    #[test]
    fn heavier_weight_is_picked_much_more_often() {
        let mut algo = WeightedRandom::new();
        algo.add(1, 1);
        algo.add(2, 99);
        let mut heavy_hits = 0;
        for _ in 0..500 {
            if algo.pick(None) == Some(2) {
                heavy_hits += 1;
            }
        }
        assert!(heavy_hits > 400);
    }
}
