//! HMAC capability tokens presented at connection time.
//!
//! Format: `hex(expiry_be64) . identity . hex(hmac_sha256(secret, expiry_be64 || identity))`
//!
//! The relay trusts nothing in the token beyond the authenticated
//! `(identity, expiry)` pair. Issuance normally happens in the external
//! credential service; it lives here too so tooling and tests can mint
//! tokens against a shared secret.

use ring::hmac;

use crate::error::{RelayError, RelayResult};

/// Authenticated claims extracted from a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Stable opaque user identity.
    pub identity: String,
    /// Unix seconds after which the token is refused.
    pub expires_at: u64,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn mac_input(expiry: u64, identity: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + identity.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(identity.as_bytes());
    data
}

/// Issue a capability token for `identity`, valid for `ttl_secs`.
pub fn issue_token(secret: &[u8], identity: &str, ttl_secs: u64) -> String {
    let expiry = unix_now() + ttl_secs;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &mac_input(expiry, identity));

    format!(
        "{}.{}.{}",
        hex::encode(expiry.to_be_bytes()),
        identity,
        hex::encode(tag.as_ref())
    )
}

/// Validate a token: signature first, then expiry.
///
/// The identity segment may itself contain dots; the expiry is the first
/// segment and the signature the last.
pub fn validate_token(secret: &[u8], token: &str) -> RelayResult<Claims> {
    let (expiry_hex, rest) = token
        .split_once('.')
        .ok_or_else(|| RelayError::Token("malformed token".into()))?;
    let (identity, tag_hex) = rest
        .rsplit_once('.')
        .ok_or_else(|| RelayError::Token("malformed token".into()))?;

    if identity.is_empty() {
        return Err(RelayError::Token("empty identity".into()));
    }

    let expiry_bytes: [u8; 8] = hex::decode(expiry_hex)
        .map_err(|_| RelayError::Token("malformed expiry".into()))?
        .try_into()
        .map_err(|_| RelayError::Token("malformed expiry".into()))?;
    let expiry = u64::from_be_bytes(expiry_bytes);

    let tag = hex::decode(tag_hex).map_err(|_| RelayError::Token("malformed signature".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &mac_input(expiry, identity), &tag)
        .map_err(|_| RelayError::Token("invalid token signature".into()))?;

    if unix_now() >= expiry {
        return Err(RelayError::Token("token expired".into()));
    }

    Ok(Claims {
        identity: identity.to_string(),
        expires_at: expiry,
    })
}

/// Generate a random token-signing secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_validate() {
        let secret = generate_secret();
        let token = issue_token(&secret, "alice", 3600);
        let claims = validate_token(&secret, &token).unwrap();
        assert_eq!(claims.identity, "alice");
        assert!(claims.expires_at > unix_now());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token(&generate_secret(), "alice", 3600);
        assert!(validate_token(&generate_secret(), &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = generate_secret();
        // TTL of 0 makes expiry == now, which validation treats as expired.
        let token = issue_token(&secret, "alice", 0);
        assert!(validate_token(&secret, &token).is_err());
    }

    #[test]
    fn tampered_identity_is_rejected() {
        let secret = generate_secret();
        let token = issue_token(&secret, "alice", 3600);
        let forged = token.replacen("alice", "mallory", 1);
        assert!(validate_token(&secret, &forged).is_err());
    }

    #[test]
    fn identity_with_dots_survives() {
        let secret = generate_secret();
        let token = issue_token(&secret, "alice.example", 3600);
        let claims = validate_token(&secret, &token).unwrap();
        assert_eq!(claims.identity, "alice.example");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let secret = generate_secret();
        for garbage in ["", "no-dots", "a.b", "zz.alice.zz", "0011.alice."] {
            assert!(validate_token(&secret, garbage).is_err(), "{garbage:?}");
        }
    }
}
