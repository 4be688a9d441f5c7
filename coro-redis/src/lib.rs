//! Redis client stack built on `coro-core`: a RESP2/RESP3 codec, a
//! standalone single-endpoint client with a handshake state machine, and a
//! cluster client with slot routing and `MOVED`/`ASK` redirection.

pub mod client;
pub mod cluster;
pub mod crc16;
pub mod resp;

pub use client::{Client, ClientParams, RedisConnection, TlsConfig};
pub use cluster::{ClusterClient, ExecuteOpt, NodeInfo, RedisSlotsTable, SlotOpt};
pub use resp::{encode_command, Parser, RedisValue, ScatterWriter};
