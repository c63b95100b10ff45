//! Криптографический модуль: четыре уровня защиты сообщений
//!
//! # Архитектура
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SecureMessenger (api)                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   EncryptionEngine                          │
//! │  - Выбирает преобразование по SecurityLevel                 │
//! │  - Арендует ключ (KeyLease) на время шифрования             │
//! │  - Расходует одноразовый ключ при первой расшифровке        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!      ┌───────────────┬───────┴───────┬───────────────┐
//!      ▼               ▼               ▼               ▼
//! ┌──────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────┐
//! │ 1: OTP   │  │ 2: AES-GCM   │  │ 3: Kyber768  │  │ 4: Plain│
//! │ XOR+HMAC │  │ HKDF(seed)   │  │ + HKDF(ss‖   │  │         │
//! │          │  │              │  │   seed)      │  │         │
//! │          │  │              │  │ + Dilithium3 │  │         │
//! └──────────┘  └──────────────┘  └──────────────┘  └─────────┘
//!      │               │               │
//!      └───────────────┴───────┬───────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            KeyLifecycleTracker → KeyPool (QKD)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Модули
//!
//! - [`level`]: уровни защиты и идентификаторы алгоритмов
//! - [`envelope`]: `SecurityEnvelope` и его структурная проверка
//! - [`kdf`]: HKDF-SHA256 с разделением контекстов
//! - [`otp`], [`aead`], [`pqc`]: примитивы уровней 1, 2 и 3
//! - [`engine`]: `EncryptionEngine` поверх трекера ключей

pub mod aead;
pub mod engine;
pub mod envelope;
pub mod kdf;
pub mod level;
pub mod otp;
pub mod pqc;

pub use engine::{DecryptionKeys, EncryptionEngine};
pub use envelope::SecurityEnvelope;
pub use level::SecurityLevel;
pub use pqc::{fingerprint, KemKeyPair, SigningKeyPair};
