//! The piece each selection policy supplies: given the set of currently
//! selectable addresses and their weights, pick one. Lifecycle (health
//! state, fail marks, recovery scheduling) lives one level up in
//! [`super::pool::Pool`] and is shared by all three policies.

pub type AddrId = u64;

pub trait Algorithm: Send {
    /// Registers a newly selectable address.
    fn add(&mut self, id: AddrId, weight: u64);

    /// Removes an address from the distribution (disabled or removed).
    fn remove(&mut self, id: AddrId);

    /// Picks one selectable address, optionally biased away from `exclude`.
    /// Returns `None` only if nothing is registered.
    fn pick(&mut self, exclude: Option<AddrId>) -> Option<AddrId>;

    /// Called once per completed selection. Only weighted least-connection
    /// tracks per-request state, so every other policy's implementation is a
    /// no-op.
    fn on_finish(&mut self, id: AddrId);
}
