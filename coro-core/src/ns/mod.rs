//! Name-service address pool: health-tracked address lifecycle plus three
//! interchangeable weighted selection policies.

pub mod algorithm;
pub mod clock;
pub mod pool;
pub mod weighted_least_conn;
pub mod weighted_random;
pub mod weighted_round_robin;

pub use algorithm::{Algorithm, AddrId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use pool::{AddrState, BreakRecoverConfig, Pool, Selection};
pub use weighted_least_conn::WeightedLeastConn;
pub use weighted_random::WeightedRandom;
pub use weighted_round_robin::WeightedRoundRobin;
