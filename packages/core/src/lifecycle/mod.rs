// Трекер жизненного цикла ключей (Key Lifecycle Tracker, KLT)
// Локальный учёт ключей и доступ к KPA (in-process или по HTTP)

pub mod lease;
pub mod remote;
pub mod retry;
pub mod tracker;

pub use lease::KeyLease;
pub use remote::RemoteKeyAuthority;
pub use retry::with_retry;
pub use tracker::{KeyLifecycleTracker, LocalState};
