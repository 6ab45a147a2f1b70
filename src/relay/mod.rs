//! Relay client: wire framing and the connection pool.

pub mod pool;
pub mod wire;

pub use pool::{RelayHandle, RelayPool, SeenCache, SubMessage};
pub use wire::{Filter, RelayMessage};
