use std::time::Duration;

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

const PASSWORD_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;

/// Issues and checks session tokens, hashes and verifies passwords.
///
/// A token is `<user_id>.<expires_at>.<signature>`, the signature being the
/// base64url HMAC-SHA256 of the first two fields under the server secret.
/// Stored passwords are `pbkdf2-sha256$<rounds>$<salt>$<hash>`.
#[derive(Clone)]
pub struct AuthKeys {
    signer: HmacSha256,
    token_ttl: Duration,
    password_iterations: u32,
}

impl AuthKeys {
    pub fn new(secret: &str, token_ttl: Duration, password_iterations: u32) -> AppResult<Self> {
        let signer = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Config(format!("Unusable token secret: {}", e)))?;

        Ok(Self {
            signer,
            token_ttl,
            password_iterations,
        })
    }

    pub fn issue_token(&self, user_id: i64) -> String {
        let expires_at = Utc::now().timestamp() + self.token_ttl.as_secs() as i64;
        self.sign(user_id, expires_at)
    }

    fn sign(&self, user_id: i64, expires_at: i64) -> String {
        let payload = format!("{}.{}", user_id, expires_at);
        let mut mac = self.signer.clone();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", payload, signature)
    }

    /// User id carried by a well-signed, unexpired token
    pub fn verify_token(&self, token: &str) -> Option<i64> {
        let (payload, signature) = token.rsplit_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = self.signer.clone();
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!("Rejected session token with a bad signature");
            return None;
        }

        let (user_id, expires_at) = payload.split_once('.')?;
        let expires_at: i64 = expires_at.parse().ok()?;
        if expires_at <= Utc::now().timestamp() {
            debug!("Rejected expired session token");
            return None;
        }

        user_id.parse().ok()
    }

    /// Runs on the blocking pool; the key derivation is CPU bound.
    pub async fn hash_password(&self, password: &str) -> AppResult<String> {
        let password = password.to_string();
        let rounds = self.password_iterations;

        tokio::task::spawn_blocking(move || {
            let salt: [u8; SALT_LEN] = rand::random();
            let derived = pbkdf2_sha256(password.as_bytes(), &salt, rounds)?;
            Ok(format!(
                "{}${}${}${}",
                PASSWORD_SCHEME,
                rounds,
                STANDARD_NO_PAD.encode(salt),
                STANDARD_NO_PAD.encode(derived)
            ))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Password hashing task failed: {}", e)))?
    }

    pub async fn verify_password(&self, password: &str, stored: &str) -> AppResult<bool> {
        let password = password.to_string();
        let stored = stored.to_string();

        tokio::task::spawn_blocking(move || {
            let unreadable = || AppError::Internal("Stored password hash is unreadable".to_string());

            let mut parts = stored.split('$');
            if parts.next() != Some(PASSWORD_SCHEME) {
                return Err(unreadable());
            }
            let rounds: u32 = parts.next().and_then(|r| r.parse().ok()).ok_or_else(unreadable)?;
            let salt = parts
                .next()
                .and_then(|s| STANDARD_NO_PAD.decode(s).ok())
                .ok_or_else(unreadable)?;
            let expected = parts
                .next()
                .and_then(|h| STANDARD_NO_PAD.decode(h).ok())
                .ok_or_else(unreadable)?;

            let derived = pbkdf2_sha256(password.as_bytes(), &salt, rounds)?;
            Ok(constant_time_eq(&derived, &expected))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Password check task failed: {}", e)))?
    }
}

/// PBKDF2-HMAC-SHA256 with a single 32-byte output block
fn pbkdf2_sha256(password: &[u8], salt: &[u8], rounds: u32) -> AppResult<[u8; 32]> {
    let prf = HmacSha256::new_from_slice(password)
        .map_err(|e| AppError::Internal(format!("Password key rejected: {}", e)))?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block: [u8; 32] = mac.finalize().into_bytes().into();
    let mut output = block;

    for _ in 1..rounds {
        let mut mac = prf.clone();
        mac.update(&block);
        block = mac.finalize().into_bytes().into();
        output.iter_mut().zip(block.iter()).for_each(|(o, b)| *o ^= b);
    }

    Ok(output)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
