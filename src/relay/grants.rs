//! Session credential grants
//!
//! The relay mints one grant per credential request. A grant lives in a TTL
//! cache until it expires or a client presents it on upgrade, which consumes
//! it.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use rand::Rng;
use serde::{Deserialize, Serialize};

const SECRET_BYTES: usize = 32;
const MAX_OUTSTANDING: u64 = 4096;

/// Session scope bound to a minted credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub model: String,
    pub voice: String,
    pub instructions: String,
}

/// Outstanding grants keyed by secret
pub struct GrantStore {
    grants: Cache<String, Grant>,
    ttl: Duration,
    consume_lock: Mutex<()>,
}

impl GrantStore {
    /// Create a store whose grants expire after `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: Cache::builder()
                .max_capacity(MAX_OUTSTANDING)
                .time_to_live(ttl)
                .build(),
            ttl,
            consume_lock: Mutex::new(()),
        }
    }

    /// Store a grant and return its secret and absolute expiry
    pub fn mint(&self, grant: Grant) -> (String, DateTime<Utc>) {
        let secret = generate_secret();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(1));
        self.grants.insert(secret.clone(), grant);
        (secret, expires_at)
    }

    /// Take the grant for `secret`; a second call with the same secret fails
    #[must_use]
    pub fn consume(&self, secret: &str) -> Option<Grant> {
        let _guard = self.consume_lock.lock().ok()?;
        let key = secret.to_string();
        let grant = self.grants.get(&key)?;
        self.grants.invalidate(&key);
        Some(grant)
    }

    /// Grant lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Random 32-byte secret, hex-encoded
fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..SECRET_BYTES).map(|_| rng.r#gen()).collect();
    hex::encode(bytes)
}

/// Constant-time byte comparison to prevent timing attacks
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
