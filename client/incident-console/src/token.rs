//! Bearer token codec: reads the embedded `exp` claim without verifying the
//! signature. The server is the authority; this only keeps the client from
//! using a token that is already dead.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Default lead time for [`is_expiring_soon`].
pub const EXPIRING_SOON_SECS: i64 = 300;

/// Decoded token payload. Only `exp` matters to the client; everything else
/// is kept as raw JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
  #[serde(default)]
  pub exp: Option<i64>,
  #[serde(default)]
  pub iat: Option<i64>,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Split into exactly three dot-separated segments and decode the middle one
/// as base64url JSON.
pub fn decode(token: &str) -> Option<TokenClaims> {
  let parts: Vec<&str> = token.split('.').collect();
  if parts.len() != 3 {
    return None;
  }

  // Some issuers keep the `=` padding.
  let payload = parts[1].trim_end_matches('=');
  let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
  serde_json::from_slice(&bytes).ok()
}

pub fn is_expired(token: Option<&str>) -> bool {
  is_expired_at(token, Utc::now())
}

/// True for a missing/undecodable token, a token without `exp`, or
/// `exp < now` (whole seconds).
pub fn is_expired_at(token: Option<&str>, now: DateTime<Utc>) -> bool {
  match token.and_then(decode).and_then(|c| c.exp) {
    Some(exp) => exp < now.timestamp(),
    None => true,
  }
}

pub fn ms_until_expiry(token: Option<&str>) -> u64 {
  ms_until_expiry_at(token, Utc::now())
}

pub fn ms_until_expiry_at(token: Option<&str>, now: DateTime<Utc>) -> u64 {
  match token.and_then(decode).and_then(|c| c.exp) {
    Some(exp) => {
      let remaining = exp - now.timestamp();
      if remaining > 0 {
        remaining as u64 * 1000
      } else {
        0
      }
    }
    None => 0,
  }
}

/// Still valid, but expires within `threshold_secs`.
pub fn is_expiring_soon(token: Option<&str>, threshold_secs: i64) -> bool {
  is_expiring_soon_at(token, threshold_secs, Utc::now())
}

pub fn is_expiring_soon_at(token: Option<&str>, threshold_secs: i64, now: DateTime<Utc>) -> bool {
  match token.and_then(decode).and_then(|c| c.exp) {
    Some(exp) => {
      let remaining = exp - now.timestamp();
      remaining > 0 && remaining <= threshold_secs
    }
    None => true,
  }
}

/// Build an unsigned token with the given claims. Test helper.
#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &serde_json::Value) -> String {
  let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
  let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
  format!("{}.{}.sig", header, payload)
}

#[cfg(test)]
pub(crate) fn token_expiring_in(secs: i64) -> String {
  let exp = Utc::now().timestamp() + secs;
  encode_unsigned(&serde_json::json!({ "exp": exp, "username": "analyst" }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use serde_json::json;

  fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
  }

  #[test]
  fn decodes_payload_claims() {
    let token = encode_unsigned(&json!({"exp": 1_700_000_000, "username": "ana", "role": "analyst"}));
    let claims = decode(&token).unwrap();
    assert_eq!(claims.exp, Some(1_700_000_000));
    assert_eq!(claims.username.as_deref(), Some("ana"));
    assert_eq!(claims.extra["role"], "analyst");
  }

  #[test]
  fn rejects_wrong_segment_count_and_bad_payload() {
    assert!(decode("").is_none());
    assert!(decode("only.two").is_none());
    assert!(decode("a.b.c.d").is_none());
    assert!(decode("header.!!!not-base64!!!.sig").is_none());
    let not_json = format!("h.{}.s", URL_SAFE_NO_PAD.encode("plain text"));
    assert!(decode(&not_json).is_none());
  }

  #[test]
  fn tolerates_padded_payload() {
    let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"exp":50}"#);
    assert!(payload.ends_with('='));
    let claims = decode(&format!("h.{}.s", payload)).unwrap();
    assert_eq!(claims.exp, Some(50));
  }

  #[test]
  fn expiry_boundaries() {
    let token = encode_unsigned(&json!({"exp": 1_000}));
    assert!(!is_expired_at(Some(token.as_str()), at(999)));
    // exp == now is not yet strictly in the past.
    assert!(!is_expired_at(Some(token.as_str()), at(1_000)));
    assert!(is_expired_at(Some(token.as_str()), at(1_001)));
  }

  #[test]
  fn missing_or_undecodable_tokens_are_expired() {
    assert!(is_expired_at(None, at(0)));
    assert!(is_expired_at(Some("garbage"), at(0)));
    let no_exp = encode_unsigned(&json!({"username": "ana"}));
    assert!(is_expired_at(Some(no_exp.as_str()), at(0)));
  }

  #[test]
  fn past_is_expired_future_hour_is_not() {
    assert!(is_expired(Some(token_expiring_in(-60).as_str())));
    assert!(!is_expired(Some(token_expiring_in(3600).as_str())));
  }

  #[test]
  fn ms_until_expiry_never_negative() {
    let token = encode_unsigned(&json!({"exp": 1_000}));
    assert_eq!(ms_until_expiry_at(Some(token.as_str()), at(990)), 10_000);
    assert_eq!(ms_until_expiry_at(Some(token.as_str()), at(2_000)), 0);
    assert_eq!(ms_until_expiry_at(Some("x.y.z"), at(0)), 0);
    assert_eq!(ms_until_expiry_at(None, at(0)), 0);
  }

  #[test]
  fn expiring_soon_window() {
    let token = encode_unsigned(&json!({"exp": 1_000}));
    assert!(is_expiring_soon_at(Some(token.as_str()), 300, at(800)));
    assert!(!is_expiring_soon_at(Some(token.as_str()), 300, at(600)));
    assert!(!is_expiring_soon_at(Some(token.as_str()), 300, at(1_000)));
    assert!(is_expiring_soon_at(None, 300, at(0)));
  }
}
