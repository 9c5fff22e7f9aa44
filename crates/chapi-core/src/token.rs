//! HMAC-signed channel tokens.
//!
//! A token lets the out-of-band channel connection be correlated with the
//! suspended request it was issued for.
//! Format (hex-encoded): `[8-byte expiry][16-byte nonce][32-byte HMAC-SHA256]`

use crate::error::{ChapiError, ChapiResult};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

const EXPIRY_LEN: usize = 8;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
/// Decoded token length in bytes.
pub const TOKEN_LEN: usize = EXPIRY_LEN + NONCE_LEN + TAG_LEN;

/// Create a channel token for `client_id`, valid for `ttl_secs`.
///
/// Each call draws a fresh nonce, so two tokens for the same client differ.
pub fn create_token(secret: &[u8], client_id: &str, ttl_secs: u64) -> ChapiResult<String> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| ChapiError::Token("RNG failure".into()))?;
    Ok(sign(secret, client_id, unix_now().saturating_add(ttl_secs), &nonce))
}

/// Verify a channel token against the client it should belong to.
///
/// Checks both the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], client_id: &str, token: &str) -> ChapiResult<()> {
    verify_token_at(secret, client_id, token, unix_now())
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> ChapiResult<Vec<u8>> {
    let mut secret = vec![0u8; 32];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| ChapiError::Token("RNG failure".into()))?;
    Ok(secret)
}

fn sign(secret: &[u8], client_id: &str, expiry: u64, nonce: &[u8; NONCE_LEN]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(client_id, expiry, nonce));

    let mut token = Vec::with_capacity(TOKEN_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(nonce);
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

fn verify_token_at(secret: &[u8], client_id: &str, token: &str, now: u64) -> ChapiResult<()> {
    let raw = hex::decode(token).map_err(|e| ChapiError::Token(format!("not hex: {e}")))?;
    if raw.len() != TOKEN_LEN {
        return Err(ChapiError::Token(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            raw.len()
        )));
    }

    let (expiry_bytes, rest) = raw.split_at(EXPIRY_LEN);
    let (nonce, tag) = rest.split_at(NONCE_LEN);

    let mut expiry_buf = [0u8; EXPIRY_LEN];
    expiry_buf.copy_from_slice(expiry_bytes);
    let expiry = u64::from_be_bytes(expiry_buf);
    if now > expiry {
        return Err(ChapiError::Token("token expired".into()));
    }

    let nonce: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| ChapiError::Token("truncated nonce".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(client_id, expiry, &nonce), tag)
        .map_err(|_| ChapiError::Token("invalid token signature".into()))
}

fn signed_data(client_id: &str, expiry: u64, nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + NONCE_LEN + client_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(nonce);
    data.extend_from_slice(client_id.as_bytes());
    data
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "client-1", 3600).unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert!(verify_token(&secret, "client-1", &token).is_ok());
    }

    #[test]
    fn tokens_differ_per_issue() {
        let secret = generate_secret().unwrap();
        let a = create_token(&secret, "client-1", 3600).unwrap();
        let b = create_token(&secret, "client-1", 3600).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_client_id() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "client-1", 3600).unwrap();
        assert!(verify_token(&secret, "client-2", &token).is_err());
    }

    #[test]
    fn wrong_secret() {
        let secret1 = generate_secret().unwrap();
        let secret2 = generate_secret().unwrap();
        let token = create_token(&secret1, "client-1", 3600).unwrap();
        assert!(verify_token(&secret2, "client-1", &token).is_err());
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret().unwrap();
        let token = sign(&secret, "client-1", 1_000, &[7u8; NONCE_LEN]);
        assert!(verify_token_at(&secret, "client-1", &token, 1_000).is_ok());
        let err = verify_token_at(&secret, "client-1", &token, 1_001).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn huge_ttl_saturates() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "client-1", u64::MAX).unwrap();
        assert!(verify_token(&secret, "client-1", &token).is_ok());
    }

    #[test]
    fn malformed_tokens() {
        let secret = generate_secret().unwrap();
        assert!(verify_token(&secret, "client-1", "zz").is_err());
        assert!(verify_token(&secret, "client-1", &"00".repeat(10)).is_err());
    }
}
