//! Relay configuration, read from the environment.

use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_ADDR: &str = "0.0.0.0:3210";
pub const DEFAULT_DB_PATH: &str = "duet.db";

/// How long a typing indicator stays up without a fresh keystroke.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum broadcast channel capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: String,
    pub db_path: String,
    pub token_secret: Vec<u8>,
    pub typing_timeout: Duration,
    pub broadcast_capacity: usize,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let token_secret = match lookup("DUET_TOKEN_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret.into_bytes(),
            None => {
                warn!("DUET_TOKEN_SECRET not set; using a random secret, tokens will not survive a restart");
                rand::random::<[u8; 32]>().to_vec()
            }
        };

        let typing_timeout = parse_var::<u64>(&lookup, "DUET_TYPING_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TYPING_TIMEOUT);

        let broadcast_capacity = parse_var::<usize>(&lookup, "DUET_BROADCAST_CAPACITY")
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BROADCAST_CAPACITY);

        let config = Self {
            addr: lookup("DUET_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            db_path: lookup("DUET_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            token_secret,
            typing_timeout,
            broadcast_capacity,
        };
        info!(
            "Config: addr={} db={} typing_timeout={:?} broadcast_capacity={}",
            config.addr, config.db_path, config.typing_timeout, config.broadcast_capacity
        );
        config
    }
}

/// Parse `key` if set. Returns `None` (after a warning) when the value does not parse.
fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {key}={raw:?}");
            None
        }
    }
}
