// QuMail Core
// Многоуровневое шифрование на квантовых ключах: пул, жизненный цикл, уровни и политика

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

// Модули
pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key_pool;
pub mod lifecycle;
pub mod policy;
pub mod protocol;
pub mod storage;
pub mod utils;

// Реэкспорт для удобства
pub use api::{OutgoingMessage, SecureMessenger};
pub use config::Config;
pub use crypto::{DecryptionKeys, EncryptionEngine, SecurityEnvelope, SecurityLevel};
pub use error::{CryptoError, KeyError};
pub use key_pool::{KeyPool, KeyPurpose, PeerId};
pub use lifecycle::{KeyLifecycleTracker, RemoteKeyAuthority};
pub use policy::{DecisionReason, PolicyDecision, PolicyEngine};
