//! HMAC-SHA256 session tokens.
//!
//! A token binds a connection to a user id until it expires:
//!
//! ```text
//! <user_id>.<expires_at_ms>.<hex(HMAC-SHA256(secret, "<user_id>.<expires_at_ms>"))>
//! ```
//!
//! The login layer issues tokens; the relay only verifies them.
//! User ids may contain dots, so tokens are parsed from the right.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8], payload: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Error::InvalidField {
        field: "secret",
        reason: "unusable HMAC key".to_string(),
    })?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Issue a token for `user_id` valid until `expires_at_ms`.
pub fn issue(secret: &[u8], user_id: &str, expires_at_ms: u64) -> Result<String> {
    if user_id.is_empty() {
        return Err(Error::MissingField("user_id"));
    }
    let payload = format!("{user_id}.{expires_at_ms}");
    let tag = mac_for(secret, &payload)?.finalize().into_bytes();
    Ok(format!("{payload}.{}", hex::encode(tag)))
}

/// Verify a token at time `now_ms` and return the user id it names.
pub fn verify(secret: &[u8], token: &str, now_ms: u64) -> Result<String> {
    let mut parts = token.rsplitn(3, '.');
    let (Some(tag_hex), Some(expires), Some(user_id)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedToken);
    };
    if user_id.is_empty() {
        return Err(Error::MalformedToken);
    }
    let expires_at: u64 = expires.parse().map_err(|_| Error::MalformedToken)?;
    let tag = hex::decode(tag_hex).map_err(|_| Error::MalformedToken)?;

    mac_for(secret, &format!("{user_id}.{expires}"))?
        .verify_slice(&tag)
        .map_err(|_| Error::SignatureMismatch)?;

    if now_ms >= expires_at {
        return Err(Error::TokenExpired);
    }
    Ok(user_id.to_string())
}
