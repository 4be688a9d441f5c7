//! Caching layer built on the collections primitives.

pub mod rlru;

pub use rlru::{Cache, EntryState, Handle};
