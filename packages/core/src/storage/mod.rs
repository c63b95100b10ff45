// Хранилище аудита понижений уровня

pub mod memory;
pub mod models;

pub use memory::MemoryAuditLog;
pub use models::FallbackRecord;
