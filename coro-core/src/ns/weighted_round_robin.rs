//! Smooth weighted round robin, implemented as a sorted set of virtual
//! "seating" keys rather than the classic current-weight-counter loop: each
//! address is re-keyed further down the line every time it's picked, so the
//! one furthest behind is always the lowest key at or after the moving
//! cursor.

use std::collections::{BTreeMap, HashMap};

use rand::Rng;

use super::algorithm::{Algorithm, AddrId};

const SEATINGS: u64 = 1 << 20;
const WRAP: u64 = 1 << 30;

struct Entry {
    weight: u64,
    step: u64,
    offset: u64,
}

fn key_of(entry: &Entry) -> u64 {
    (entry.offset + SEATINGS.saturating_mul(entry.step) / entry.weight.max(1)) % WRAP
}

pub struct WeightedRoundRobin {
    entries: HashMap<AddrId, Entry>,
    /// (key, id) -> (), ordered ascending by key then id; `find lowest
    /// entry with key >= cursor, wrapping`. Keying by the pair instead of
    /// `key` alone means two addresses whose `key_of` values collide still
    /// occupy distinct seats instead of one silently overwriting the other.
    seating: BTreeMap<(u64, AddrId), ()>,
    cursor: u64,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            seating: BTreeMap::new(),
            cursor: 0,
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for WeightedRoundRobin {
    fn add(&mut self, id: AddrId, weight: u64) {
        let weight = weight.clamp(1, SEATINGS);
        let tie_break = if weight < SEATINGS {
            rand::thread_rng().gen_range(0..(SEATINGS / weight).max(1))
        } else {
            0
        };
        let entry = Entry {
            weight,
            step: 0,
            offset: tie_break,
        };
        let key = key_of(&entry);
        self.seating.insert((key, id), ());
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: AddrId) {
        if let Some(entry) = self.entries.remove(&id) {
            let key = key_of(&entry);
            self.seating.remove(&(key, id));
        }
    }

    fn pick(&mut self, _exclude: Option<AddrId>) -> Option<AddrId> {
        if self.seating.is_empty() {
            return None;
        }
        let found = self
            .seating
            .range((self.cursor, AddrId::MIN)..)
            .next()
            .or_else(|| self.seating.iter().next())
            .map(|(k, _)| *k)?;
        let (old_key, id) = found;
        self.seating.remove(&(old_key, id));
        let entry = self.entries.get_mut(&id)?;
        entry.step += 1;
        let new_key = key_of(entry);
        self.seating.insert((new_key, id), ());
        self.cursor = old_key.wrapping_add(1) % WRAP;
        Some(id)
    }

    fn on_finish(&mut self, _id: AddrId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_weights_distribute_evenly_over_many_picks() {
        let mut algo = WeightedRoundRobin::new();
        algo.add(1, 1);
        algo.add(2, 1);
        algo.add(3, 1);
        let mut counts = HashMap::new();
        for _ in 0..300 {
            let id = algo.pick(None).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        for id in [1, 2, 3] {
            let c = counts[&id];
            assert!((90..=110).contains(&c), "id {id} got {c} picks");
        }
    }

    #[test]
    fn heavier_weight_gets_picked_proportionally_more() {
        let mut algo = WeightedRoundRobin::new();
        algo.add(1, 1);
        algo.add(2, 3);
        let mut counts = HashMap::new();
        for _ in 0..400 {
            let id = algo.pick(None).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert!(counts[&2] > counts[&1] * 2);
    }

    #[test]
    fn three_weights_hit_exact_proportional_counts_over_one_cycle() {
        // Weights {10, 20, 30} sum to 60, so 60 picks is exactly one full
        // cycle through every seat: each id is picked weight-many times,
        // with no seat ever lost to a `key_of` collision overwriting
        // another address's entry in the seating set.
        let mut algo = WeightedRoundRobin::new();
        algo.add(1, 10);
        algo.add(2, 20);
        algo.add(3, 30);
        let mut counts = HashMap::new();
        for _ in 0..60 {
            let id = algo.pick(None).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert_eq!(counts[&1], 10);
        assert_eq!(counts[&2], 20);
        assert_eq!(counts[&3], 30);
    }

    #[test]
    fn remove_excludes_address_from_further_picks() {
        let mut algo = WeightedRoundRobin::new();
        algo.add(1, 1);
        algo.add(2, 1);
        algo.remove(1);
        for _ in 0..10 {
            assert_eq!(algo.pick(None), Some(2));
        }
    }
}
