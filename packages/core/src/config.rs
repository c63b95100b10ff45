// Конфигурация QuMail Core
//
// Все настройки пула ключей, трекера, политики и сервера KPA собраны здесь.
// Глобального экземпляра нет: `Config` строится один раз и передаётся вниз.

use std::net::SocketAddr;
use std::time::Duration;

/// Конфигурация верхнего уровня
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub policy: PolicyConfig,
    pub server: ServerConfig,
}

/// Лимиты пула ключей (KPA)
#[derive(Debug, Clone)]
pub struct PoolConfig {
    // ============================================
    // ЗАПАСЫ
    // ============================================

    /// Сколько OTP-байт может взять новый собеседник до `Exhausted`
    pub otp_bytes_per_peer: u64,

    /// Сколько AES-семян (по 32 байта) может взять новый собеседник
    pub aes_keys_per_peer: u64,

    /// Наибольший ключ, который пул выдаст за один запрос
    pub max_key_size: usize,

    // ============================================
    // ВРЕМЯ
    // ============================================

    /// Сколько живёт резерв без `consume`/`retain`
    pub reservation_ttl: Duration,

    /// Полный срок жизни выданного материала
    pub key_ttl: Duration,

    /// Период очистки просроченных резервов
    pub sweep_interval: Duration,

    /// Число полос блокировок для сериализации по ключу
    pub lock_stripes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            otp_bytes_per_peer: 10 * 1024 * 1024, // 10 MiB
            aes_keys_per_peer: 1000,
            max_key_size: 1024 * 1024, // 1 MiB
            reservation_ttl: Duration::from_secs(60),
            key_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5),
            lock_stripes: 16,
        }
    }
}

/// Ограниченный экспоненциальный backoff для вызовов трекера к KPA
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Без повторов: первая ошибка возвращается как есть
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Пауза перед повтором номер `attempt` (с единицы, 1 означает первый повтор)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Лимиты движка политики
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Уровень 1 отказывает сообщениям длиннее этого
    pub otp_max_message_size: usize,

    /// Срок свежести кэшированных возможностей получателя
    pub capability_ttl: Duration,

    /// Подписывать конверты уровня 3 ключом Dilithium, если он настроен
    pub sign_pqc_messages: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            otp_max_message_size: 1024 * 1024,
            capability_ttl: Duration::from_secs(5 * 60),
            sign_pqc_messages: true,
        }
    }
}

/// Адреса сервера менеджера ключей и клиента к нему
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub km_url: String,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8100)),
            km_url: "http://127.0.0.1:8100".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Собрать конфигурацию из переменных окружения `QUMAIL_*`.
    ///
    /// Незаданные или нечитаемые переменные оставляют значение по умолчанию.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = parsed("QUMAIL_OTP_BYTES_PER_PEER") {
            config.pool.otp_bytes_per_peer = v;
        }
        if let Some(v) = parsed("QUMAIL_AES_KEYS_PER_PEER") {
            config.pool.aes_keys_per_peer = v;
        }
        if let Some(v) = parsed("QUMAIL_RESERVATION_TTL_SECS") {
            config.pool.reservation_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parsed("QUMAIL_KEY_TTL_SECS") {
            config.pool.key_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parsed("QUMAIL_SWEEP_INTERVAL_SECS") {
            if v > 0 {
                config.pool.sweep_interval = Duration::from_secs(v);
            }
        }
        if let Some(v) = parsed("QUMAIL_RETRY_MAX_ATTEMPTS") {
            if v > 0 {
                config.retry.max_attempts = v as u32;
            }
        }
        if let Some(addr) = lookup("QUMAIL_BIND_ADDR").and_then(|v| v.parse().ok()) {
            config.server.bind_addr = addr;
        }
        if let Some(url) = lookup("QUMAIL_KM_URL") {
            config.server.km_url = url;
        }

        config
    }
}
