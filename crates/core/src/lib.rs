pub mod config;
pub mod error;

pub use config::{Config, PoolConfig};
pub use error::*;
