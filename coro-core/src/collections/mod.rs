//! Small data structures shared by the cache and name-service layers.

pub mod bit;
pub mod hashtable;

pub use bit::BinaryIndexedTree;
pub use hashtable::HashTable;
