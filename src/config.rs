use std::env;
use std::time::Duration;

/// Runtime configuration, sourced from the environment. Every knob falls
/// back to a default when the variable is missing or unparseable.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// TTL of a pairing code while no browser is attached.
    pub session_code_expiry: Duration,
    /// Per-connection outbound queue bound, in messages.
    pub outbound_queue_limit: usize,
    pub ping_interval: Duration,
    /// Age of the last pong after which a connection is considered dead.
    pub ping_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a browser has to send its first `join`/`rejoin` frame.
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_u64(name, default))
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            session_code_expiry: env_millis("SESSION_CODE_EXPIRY_MS", 300_000),
            outbound_queue_limit: env_u64("OUTBOUND_QUEUE_LIMIT", 1024) as usize,
            ping_interval: env_millis("PING_INTERVAL_MS", 25_000),
            ping_timeout: env_millis("PING_TIMEOUT_MS", 50_000),
            sweep_interval: env_millis("SWEEP_INTERVAL_MS", 60_000),
            handshake_timeout: env_millis("HANDSHAKE_TIMEOUT_MS", 10_000),
            shutdown_grace: env_millis("SHUTDOWN_GRACE_MS", 5_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            session_code_expiry: Duration::from_millis(300_000),
            outbound_queue_limit: 1024,
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(50_000),
            sweep_interval: Duration::from_millis(60_000),
            handshake_timeout: Duration::from_millis(10_000),
            shutdown_grace: Duration::from_millis(5_000),
        }
    }
}
