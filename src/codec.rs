//! Stateless token encoding, decoding, and MAC verification.
//!
//! Wire format (a compatibility contract — field order and delimiter are
//! fixed):
//!
//! ```text
//! base64url(tag) '@' <slotDigit><expiresAtEpochMillis> '@' base64url(subject) '@' serverId
//! ```
//!
//! The tag is an HMAC-SHA256 over everything after the first `@`. The
//! subject is base64url encoded so that `@` can never appear unescaped
//! inside a segment. The slot index is the single leading character of the
//! second segment, which caps the ring at 9 slots; config validation
//! enforces that bound rather than letting a larger ring silently break the
//! format.

use crate::keys::ExpiringSecretKey;
use crate::ring::KeyRing;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Segment delimiter in the cookie wire form.
pub const FIELD_DELIMITER: char = '@';

/// Why a token failed to decode. All variants are recoverable: the service
/// boundary collapses them to "no identity" and clears the cookie.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Wrong segment count or unparsable fields.
    #[error("token is not in the expected format")]
    MalformedToken,
    /// The token's expiry time has passed.
    #[error("token expired {0}ms ago")]
    Expired(u64),
    /// The signing key is unknown locally and absent from the cluster cache.
    /// Ordinary after a slot recycles or before the cache converges.
    #[error("no verification key for {server_id}:{slot}")]
    KeyNotFound { server_id: String, slot: usize },
    /// The MAC did not verify.
    #[error("token signature does not match")]
    TagMismatch,
}

/// A successfully verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub subject: String,
    pub expires_at: u64,
    pub slot: usize,
    pub server_id: String,
}

/// Serialize and sign a token.
pub fn encode(
    subject: &str,
    expires_at: u64,
    slot: usize,
    server_id: &str,
    key: &ExpiringSecretKey,
) -> anyhow::Result<String> {
    let payload = format!(
        "{slot}{expires_at}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{server_id}",
        URL_SAFE_NO_PAD.encode(subject.as_bytes())
    );
    let tag = compute_tag(key.key(), payload.as_bytes())?;
    Ok(format!(
        "{}{FIELD_DELIMITER}{payload}",
        URL_SAFE_NO_PAD.encode(tag)
    ))
}

/// Parse and verify a token against the keys reachable from `ring`.
///
/// Expiry is checked strictly against wall clock, before any key work.
/// MAC comparison is constant-time.
pub fn decode(wire: &str, ring: &KeyRing, now: u64) -> Result<DecodedToken, DecodeError> {
    let parts: Vec<&str> = wire.split(FIELD_DELIMITER).collect();
    let &[tag_b64, slot_and_expiry, subject_b64, server_id] = parts.as_slice() else {
        return Err(DecodeError::MalformedToken);
    };

    let mut chars = slot_and_expiry.chars();
    let slot = chars
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or(DecodeError::MalformedToken)? as usize;
    let expires_at: u64 = chars
        .as_str()
        .parse()
        .map_err(|_| DecodeError::MalformedToken)?;

    if now >= expires_at {
        return Err(DecodeError::Expired(now - expires_at));
    }

    let tag = URL_SAFE_NO_PAD
        .decode(tag_b64)
        .map_err(|_| DecodeError::MalformedToken)?;
    let subject_bytes = URL_SAFE_NO_PAD
        .decode(subject_b64)
        .map_err(|_| DecodeError::MalformedToken)?;
    let subject =
        String::from_utf8(subject_bytes).map_err(|_| DecodeError::MalformedToken)?;

    let key = ring
        .lookup(server_id, slot)
        .ok_or_else(|| DecodeError::KeyNotFound {
            server_id: server_id.to_string(),
            slot,
        })?;

    // Everything after the first delimiter is the signed payload.
    let payload = &wire[tag_b64.len() + 1..];
    verify_tag(key.key(), payload.as_bytes(), &tag)?;

    Ok(DecodedToken {
        subject,
        expires_at,
        slot,
        server_id: server_id.to_string(),
    })
}

/// HMAC for the trusted-header path: hex of HMAC-SHA256 over
/// `"{subject};{timestamp}"` under the statically shared secret. The
/// timestamp is covered verbatim and never parsed.
pub fn server_token_hmac(subject: &str, timestamp: &str, secret: &str) -> anyhow::Result<String> {
    let tag = compute_tag(
        secret.as_bytes(),
        format!("{subject};{timestamp}").as_bytes(),
    )?;
    Ok(hex::encode(tag))
}

/// Constant-time check of a trusted-header hash against the shared secret.
pub fn verify_server_token_hmac(
    subject: &str,
    timestamp: &str,
    secret: &str,
    presented_hex: &str,
) -> bool {
    let Ok(presented) = hex::decode(presented_hex) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(format!("{subject};{timestamp}").as_bytes());
    mac.verify_slice(&presented).is_ok()
}

fn compute_tag(key: &[u8], payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("invalid MAC key: {e}"))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_tag(key: &[u8], payload: &[u8], tag: &[u8]) -> Result<(), DecodeError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| DecodeError::TagMismatch)?;
    mac.update(payload);
    mac.verify_slice(tag).map_err(|_| DecodeError::TagMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemorySharedCache, SharedKeyCache};
    use crate::ring::DEFAULT_RING_SIZE;
    use crate::util::{Clock, ManualClock};
    use std::sync::Arc;
    use tempfile::tempdir;

    const TTL: u64 = 1_000;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        ring: KeyRing,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let cache: Arc<dyn SharedKeyCache> =
            Arc::new(MemorySharedCache::with_clock(clock.clone()));
        let ring = KeyRing::open(
            "server-a",
            TTL,
            DEFAULT_RING_SIZE,
            dir.path().join("keys.bin"),
            cache,
            clock.clone(),
        );
        Fixture {
            _dir: dir,
            clock,
            ring,
        }
    }

    fn mint(f: &Fixture, subject: &str) -> String {
        let now = f.clock.now_millis();
        let (slot, key) = f.ring.active_key();
        encode(subject, now + TTL, slot, key.server_id(), &key).unwrap()
    }

    #[test]
    fn round_trip() {
        let f = fixture();
        let wire = mint(&f, "alice");
        let decoded = decode(&wire, &f.ring, f.clock.now_millis()).unwrap();
        assert_eq!(decoded.subject, "alice");
        assert_eq!(decoded.expires_at, TTL);
        assert_eq!(decoded.server_id, "server-a");
    }

    #[test]
    fn subject_with_delimiter_characters_survives() {
        let f = fixture();
        let wire = mint(&f, "al@ice@example;com");
        let decoded = decode(&wire, &f.ring, 1).unwrap();
        assert_eq!(decoded.subject, "al@ice@example;com");
    }

    #[test]
    fn wrong_segment_count_is_malformed() {
        let f = fixture();
        for wire in ["", "a@b", "a@b@c", "a@b@c@d@e", "not a token"] {
            assert_eq!(
                decode(wire, &f.ring, 0),
                Err(DecodeError::MalformedToken),
                "{wire:?}"
            );
        }
    }

    #[test]
    fn unparsable_slot_or_expiry_is_malformed() {
        let f = fixture();
        assert_eq!(
            decode("dGFn@xyz@c3Vi@server-a", &f.ring, 0),
            Err(DecodeError::MalformedToken)
        );
        assert_eq!(
            decode("dGFn@5@c3Vi@server-a", &f.ring, 0),
            Err(DecodeError::MalformedToken),
            "slot digit with no expiry digits"
        );
    }

    #[test]
    fn expiry_is_checked_before_key_lookup() {
        let f = fixture();
        let wire = mint(&f, "alice");
        f.clock.set(TTL); // now == expires_at: already expired
        assert_eq!(decode(&wire, &f.ring, TTL), Err(DecodeError::Expired(0)));
        assert_eq!(
            decode(&wire, &f.ring, TTL + 250),
            Err(DecodeError::Expired(250))
        );

        // even a token for an unknown server reports Expired, not KeyNotFound
        let foreign = "dGFn@1500@c3Vi@server-x";
        assert_eq!(decode(foreign, &f.ring, 600), Err(DecodeError::Expired(100)));
    }

    #[test]
    fn unknown_key_is_key_not_found() {
        let f = fixture();
        assert_eq!(
            decode("dGFn@31000@c3Vi@server-x", &f.ring, 0),
            Err(DecodeError::KeyNotFound {
                server_id: "server-x".into(),
                slot: 3
            })
        );
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let f = fixture();
        let wire = mint(&f, "alice");
        let (tag_b64, rest) = wire.split_once(FIELD_DELIMITER).unwrap();

        let mut tag = URL_SAFE_NO_PAD.decode(tag_b64).unwrap();
        for bit in [0usize, 7, 93, tag.len() * 8 - 1] {
            tag[bit / 8] ^= 1 << (bit % 8);
            let forged = format!("{}@{rest}", URL_SAFE_NO_PAD.encode(&tag));
            assert_eq!(
                decode(&forged, &f.ring, 1),
                Err(DecodeError::TagMismatch),
                "bit {bit}"
            );
            tag[bit / 8] ^= 1 << (bit % 8);
        }
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let f = fixture();
        let wire = mint(&f, "alice");
        let parts: Vec<&str> = wire.split(FIELD_DELIMITER).collect();
        let forged_subject = URL_SAFE_NO_PAD.encode("mallory");
        let forged = format!(
            "{}@{}@{}@{}",
            parts[0], parts[1], forged_subject, parts[3]
        );
        assert_eq!(decode(&forged, &f.ring, 1), Err(DecodeError::TagMismatch));
    }

    #[test]
    fn server_token_hmac_round_trips() {
        let hash = server_token_hmac("alice", "1234", "s3cret").unwrap();
        assert!(verify_server_token_hmac("alice", "1234", "s3cret", &hash));
        assert!(!verify_server_token_hmac("mallory", "1234", "s3cret", &hash));
        assert!(!verify_server_token_hmac("alice", "1235", "s3cret", &hash));
        assert!(!verify_server_token_hmac("alice", "1234", "other", &hash));
        assert!(!verify_server_token_hmac("alice", "1234", "s3cret", "zz-not-hex"));
    }
}
