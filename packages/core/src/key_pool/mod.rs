// Пул ключей (Key Pool Authority, KPA)
// Единственный источник ключевого материала и состояния его жизненного цикла

pub mod authority;
pub mod http;
pub mod inventory;
pub mod pool;
pub mod record;
pub mod sweeper;

pub use authority::KeyAuthority;
pub use pool::{KeyPool, PoolStats, PoolStatus, SweepReport, AES_SEED_LEN};
pub use record::{ConsumeToken, KeyId, KeyMaterial, KeyPurpose, KeyRecord, KeyState, PeerId};
pub use sweeper::ReservationSweeper;
