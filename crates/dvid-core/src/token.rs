//! HMAC session tokens.
//!
//! A token binds a user id to an expiry time and is signed with a server
//! secret. Format (hex-encoded): `[8-byte expiry][16-byte user id][32-byte HMAC-SHA256]`

use ring::hmac;

use crate::error::{DvidError, DvidResult};
use crate::model::UserId;

const EXPIRY_LEN: usize = 8;
const UID_LEN: usize = 16;
const TAG_LEN: usize = 32;
const TOKEN_LEN: usize = EXPIRY_LEN + UID_LEN + TAG_LEN;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sign(secret: &[u8], expiry: u64, user_id: &UserId) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::with_capacity(EXPIRY_LEN + UID_LEN);
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(user_id.as_bytes());
    hmac::sign(&key, &data)
}

fn token_with_expiry(secret: &[u8], user_id: &UserId, expiry: u64) -> String {
    let tag = sign(secret, expiry, user_id);

    let mut token = Vec::with_capacity(TOKEN_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(user_id.as_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Create a session token for `user_id` valid for `ttl_secs`.
pub fn create_token(secret: &[u8], user_id: &UserId, ttl_secs: u64) -> String {
    token_with_expiry(secret, user_id, now_secs().saturating_add(ttl_secs))
}

/// Verify a session token and return the user id it was issued for.
///
/// Checks the encoding, the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> DvidResult<UserId> {
    let raw = hex::decode(token).map_err(|_| DvidError::Token("token is not hex".into()))?;
    if raw.len() != TOKEN_LEN {
        return Err(DvidError::Token(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            raw.len()
        )));
    }

    let (expiry_bytes, rest) = raw.split_at(EXPIRY_LEN);
    let (uid_bytes, tag) = rest.split_at(UID_LEN);

    let mut expiry_buf = [0u8; EXPIRY_LEN];
    expiry_buf.copy_from_slice(expiry_bytes);
    let expiry = u64::from_be_bytes(expiry_buf);
    let user_id = UserId::try_from(uid_bytes)?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::with_capacity(EXPIRY_LEN + UID_LEN);
    data.extend_from_slice(expiry_bytes);
    data.extend_from_slice(uid_bytes);
    hmac::verify(&key, &data, tag)
        .map_err(|_| DvidError::Token("invalid token signature".into()))?;

    if now_secs() > expiry {
        return Err(DvidError::Token("token expired".into()));
    }

    Ok(user_id)
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> DvidResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| DvidError::Other("RNG failure".into()))?;
    Ok(secret)
}
