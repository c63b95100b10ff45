// Логирование

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Установить глобальный подписчик `tracing`.
///
/// Если задан `RUST_LOG`, он главнее; иначе действует `default_directive` (например `"info"`).
/// Повторный вызов безвреден: вторая установка игнорируется.
pub fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
