//! Weighted least-connections: pick the address with the lowest
//! `connections / weight` ratio, tracking per-request state so a `finish`
//! hook can give the slot back.

use std::collections::{BTreeMap, HashMap};

use super::algorithm::{Algorithm, AddrId};

const SEATINGS: u64 = 1 << 20;

struct Entry {
    weight: u64,
    conn_count: u64,
}

fn key_of(e: &Entry) -> u64 {
    SEATINGS.saturating_mul(e.conn_count) / e.weight.max(1)
}

pub struct WeightedLeastConn {
    entries: HashMap<AddrId, Entry>,
    set: BTreeMap<(u64, AddrId), ()>,
}

impl WeightedLeastConn {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            set: BTreeMap::new(),
        }
    }
}

impl Default for WeightedLeastConn {
    fn default() -> Self {
        Self::new()
    }
}

impl Algorithm for WeightedLeastConn {
    fn add(&mut self, id: AddrId, weight: u64) {
        let weight = weight.max(1);
        // Start at roughly the pool's current load level, so a freshly
        // added address doesn't look idle and get flooded immediately.
        let conn_count = match self.set.iter().next_back() {
            Some((&(max_key, _), _)) => max_key.saturating_mul(weight) / SEATINGS,
            None => 0,
        };
        let entry = Entry { weight, conn_count };
        let key = key_of(&entry);
        self.set.insert((key, id), ());
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: AddrId) {
        if let Some(entry) = self.entries.remove(&id) {
            let key = key_of(&entry);
            self.set.remove(&(key, id));
        }
    }

    fn pick(&mut self, exclude: Option<AddrId>) -> Option<AddrId> {
        if self.set.is_empty() {
            return None;
        }
        let mut candidates = self.set.keys().copied();
        let mut chosen = candidates.next()?;
        if let Some(ex) = exclude {
            if chosen.1 == ex && self.set.len() > 1 {
                if let Some(next) = candidates.next() {
                    chosen = next;
                }
            }
        }
        let (old_key, id) = chosen;
        self.set.remove(&(old_key, id));
        let entry = self.entries.get_mut(&id)?;
        entry.conn_count += 1;
        let new_key = key_of(entry);
        self.set.insert((new_key, id), ());
        Some(id)
    }

    fn on_finish(&mut self, id: AddrId) {
        let Some(entry) = self.entries.get_mut(&id) else { return };
        let old_key = key_of(entry);
        self.set.remove(&(old_key, id));
        entry.conn_count = entry.conn_count.saturating_sub(1);
        let new_key = key_of(entry);
        self.set.insert((new_key, id), ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_least_loaded_address_first() {
        let mut algo = WeightedLeastConn::new();
        algo.add(1, 1);
        algo.add(2, 1);
        let first = algo.pick(None).unwrap();
        let second = algo.pick(None).unwrap();
        assert_ne!(first, second, "load should spread across both addresses");
    }

    #[test]
    fn finish_gives_the_slot_back() {
        let mut algo = WeightedLeastConn::new();
        algo.add(1, 1);
        algo.add(2, 1);
        let a = algo.pick(None).unwrap();
        let b = algo.pick(None).unwrap();
        assert_ne!(a, b);
        algo.on_finish(a);
        // a's connection count dropped back to 0, so it's picked again.
        assert_eq!(algo.pick(None), Some(a));
    }

    #[test]
    fn heavier_weight_tolerates_more_concurrent_connections() {
        let mut algo = WeightedLeastConn::new();
        algo.add(1, 1);
        algo.add(2, 4);
        let mut counts: HashMap<AddrId, u32> = HashMap::new();
        for _ in 0..10 {
            let id = algo.pick(None).unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert!(counts.get(&2).copied().unwrap_or(0) >= counts.get(&1).copied().unwrap_or(0));
    }
}
