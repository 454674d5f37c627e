mod memory;
mod postgres;

pub use memory::MemoryCheckpointStore;
pub use postgres::PgCheckpointStore;
