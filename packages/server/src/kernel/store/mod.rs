//! Job store implementations and the shared store connection.

pub mod connection;
pub mod dns;
pub mod memory;
pub mod postgres;

pub use connection::{ConnectionManager, StoreTarget};
pub use dns::{DnsCache, Resolve, SystemResolver};
pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;
