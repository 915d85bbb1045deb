use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::config::AdminConfig;

const TOKEN_LENGTH: usize = 48;

/// Bearer token handed out on admin login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// In-memory admin sessions. Tokens live until their TTL passes or until
/// logout; a restart signs everybody out.
pub struct TokenStore {
    ttl: Duration,
    tokens: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        TokenStore {
            ttl,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn issue(&self) -> AdminToken {
        let token = generate_random_string(TOKEN_LENGTH);
        let expires_at = Utc::now().checked_add_signed(self.ttl).unwrap_or(
            if self.ttl < Duration::zero() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            },
        );
        self.tokens.write().await.insert(token.clone(), expires_at);
        AdminToken { token, expires_at }
    }

    pub async fn validate(&self, token: &str) -> bool {
        let now = Utc::now();
        {
            let tokens = self.tokens.read().await;
            match tokens.get(token) {
                Some(expires_at) if *expires_at > now => return true,
                Some(_) => {}
                None => return false,
            }
        }

        // Expired: drop it eagerly.
        self.tokens.write().await.remove(token);
        false
    }

    pub async fn revoke(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Remove expired tokens; returns how many were dropped.
    pub async fn prune(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);
        before - tokens.len()
    }
}

pub struct AuthService;

impl AuthService {
    /// Check login credentials against the admin block of the config.
    ///
    /// The configured password may be a bcrypt hash or plain text. An empty
    /// configured password disables admin login entirely.
    pub fn verify_credentials(admin: &AdminConfig, username: &str, password: &str) -> bool {
        if admin.password.is_empty() {
            return false;
        }

        let user_ok: bool = username.as_bytes().ct_eq(admin.username.as_bytes()).into();

        let password_ok = if is_bcrypt_hash(&admin.password) {
            match bcrypt::verify(password, &admin.password) {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!("Failed to verify admin password hash: {}", e);
                    false
                }
            }
        } else {
            password.as_bytes().ct_eq(admin.password.as_bytes()).into()
        };

        user_ok && password_ok
    }
}

fn is_bcrypt_hash(value: &str) -> bool {
    ["$2a$", "$2b$", "$2x$", "$2y$"]
        .iter()
        .any(|prefix| value.starts_with(prefix))
}

/// Generate a random alphanumeric string of the given length
pub fn generate_random_string(length: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
