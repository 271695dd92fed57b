//! Reading identity claims out of an `id_token`.
//!
//! The payload is decoded for display purposes only. The signature is not
//! verified, so nothing read here may be used for an authorization decision.

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    serde_json::Value,
};

use crate::types::OAuthProfile;

/// Decode the claims segment of a compact JWT.
pub fn decode_claims(jwt: &str) -> Option<Value> {
    let mut parts = jwt.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    parts.next()?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Build a profile from `id_token` claims.
///
/// The id is the account id under `namespace.account_field` when present,
/// then `sub`, then `"unknown"`. Never fails: an undecodable token yields the
/// unknown profile.
pub fn profile_from_id_token(id_token: &str, namespace: &str, account_field: &str) -> OAuthProfile {
    let Some(claims) = decode_claims(id_token) else {
        return OAuthProfile::unknown();
    };

    let account_id = claims
        .get(namespace)
        .and_then(|ns| ns.get(account_field))
        .and_then(Value::as_str);
    let id = account_id
        .or_else(|| claims.get("sub").and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string();

    OAuthProfile {
        id,
        email: string_claim(&claims, "email"),
        name: string_claim(&claims, "name"),
    }
}

fn string_claim(claims: &Value, key: &str) -> Option<String> {
    claims
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
