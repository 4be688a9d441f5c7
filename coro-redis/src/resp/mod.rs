//! RESP2/RESP3 wire protocol: value model, incremental parser, and
//! command serializer.

pub mod parser;
pub mod value;
pub mod writer;

pub use parser::Parser;
pub use value::RedisValue;
pub use writer::{encode_command, ScatterWriter};
